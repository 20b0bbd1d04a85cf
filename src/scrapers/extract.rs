//! Product field extraction from rendered pages.
//!
//! Every field is optional. A page that is not a product page at all is an
//! error, which is different from a product page with nothing on it.

use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};

use super::session::PageSnapshot;
use crate::models::{MarketOffer, OfferCount, ProductFields};

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("page at {0} is not a product page")]
    NotProductPage(String),
}

/// Turns a rendered page into product fields.
pub trait FieldExtractor: Send + Sync {
    fn extract(&self, page: &PageSnapshot) -> Result<ProductFields, ExtractError>;
}

static MONEY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d[\d,]*(?:\.\d+)?").unwrap());
static OFFER_COUNT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\((\d+)\)").unwrap());
static PARENTHETICAL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s*\([^)]*\)").unwrap());
static RATING: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+(?:\.\d+)?").unwrap());

const PRODUCT_MARKERS: &[&str] = &["#dp", "#dp-container", "#ppd", "#productTitle"];
const TITLE: &[&str] = &["#productTitle"];
const PRICE_SPLIT: &[(&str, &str)] = &[
    (
        "#corePriceDisplay_desktop_feature_div span.a-price-whole",
        "#corePriceDisplay_desktop_feature_div span.a-price-fraction",
    ),
    ("span.a-price-whole", "span.a-price-fraction"),
];
const PRICE_TEXT: &[&str] = &[
    "#corePriceDisplay_desktop_feature_div span.a-offscreen",
    "#corePriceDisplay_desktop_feature_div",
    "#price_inside_buybox",
];
const OFFERS: &[&str] = &["#dynamic-aod-ingress-box", "[id*='olp_feature_div']"];
const MINIMUM_PRICE: &[&str] = &[
    "#dynamic-aod-ingress-box span.a-price span.a-offscreen",
    "[id*='olp_feature_div'] span.a-price span.a-offscreen",
];
const RANK_LABEL: &str = "Best Sellers Rank";
const RATING_TEXT: &[&str] = &[
    "#averageCustomerReviews #acrPopover span.a-size-base",
    "#averageCustomerReviews #acrPopover span",
];
const REVIEWS_COUNT: &[&str] = &["#averageCustomerReviews #acrCustomerReviewText"];
const BUYBOX_SHIPPED_FROM: &[&str] = &[
    "#offer-display-features #fulfillerInfoFeature_feature_div > div:nth-of-type(2)",
    "#offer-display-features #fulfillerInfoFeature_feature_div .offer-display-feature-text",
];
const BUYBOX_SOLD_BY: &[&str] = &[
    "#offer-display-features #merchantInfoFeature_feature_div > div:nth-of-type(2)",
    "#offer-display-features #merchantInfoFeature_feature_div .offer-display-feature-text",
];
const BUYBOX_PRICE: &[&str] = &["#price_inside_buybox", "#buybox span.a-price span.a-offscreen"];

/// Rows of the "other sellers" panel once it has been opened.
const OFFER_ROWS: &str = "#aod-offer-list > div#aod-offer";
const OFFER_HEADING: &[&str] = &["#aod-offer-heading > span"];
const OFFER_SHIPS_FROM: &[&str] = &["#aod-offer-shipsFrom > div > div > div:nth-of-type(2) > span"];
const OFFER_SOLD_BY: &[&str] = &[
    "#aod-offer-soldBy a",
    "#aod-offer-soldBy > div > div > div:nth-of-type(2) > span",
];
const OFFER_PRICE: (&str, &str) = (
    "#aod-offer-price span.a-price-whole",
    "#aod-offer-price span.a-price-fraction",
);

/// Extractor for the retail product detail page layout.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProductPageExtractor;

impl FieldExtractor for ProductPageExtractor {
    fn extract(&self, page: &PageSnapshot) -> Result<ProductFields, ExtractError> {
        let document = Html::parse_document(&page.html);

        if first_match(&document, PRODUCT_MARKERS).is_none() {
            return Err(ExtractError::NotProductPage(page.url.clone()));
        }

        let price = extract_price(&document);
        let minimum_price = first_text(&document, MINIMUM_PRICE)
            .and_then(|text| parse_money(&text))
            .or_else(|| price.clone());

        let buybox_sold_by = first_text(&document, BUYBOX_SOLD_BY);
        // A listed seller means the headline price is the buy-box price.
        let buybox_price = first_text(&document, BUYBOX_PRICE)
            .and_then(|text| parse_money(&text))
            .or_else(|| buybox_sold_by.as_ref().and(price.clone()));

        Ok(ProductFields {
            title: first_text(&document, TITLE),
            minimum_price,
            offers: extract_offers(&document),
            best_seller_rank: extract_rank(&document),
            rating: first_text(&document, RATING_TEXT)
                .and_then(|text| RATING.find(&text).map(|m| m.as_str().to_string())),
            reviews_count: first_text(&document, REVIEWS_COUNT).and_then(|text| parse_count(&text)),
            buybox_shipped_from: first_text(&document, BUYBOX_SHIPPED_FROM),
            buybox_sold_by,
            buybox_price,
            other_offers: extract_other_offers(&document),
            price,
        })
    }
}

fn first_match<'a>(document: &'a Html, selectors: &[&str]) -> Option<ElementRef<'a>> {
    selectors.iter().find_map(|selector_str| {
        let selector = Selector::parse(selector_str).ok()?;
        document.select(&selector).next()
    })
}

fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

fn first_text(document: &Html, selectors: &[&str]) -> Option<String> {
    scoped_text(document.root_element(), selectors)
}

/// Like [`first_text`], limited to descendants of `scope`.
fn scoped_text(scope: ElementRef<'_>, selectors: &[&str]) -> Option<String> {
    selectors.iter().find_map(|selector_str| {
        let selector = Selector::parse(selector_str).ok()?;
        scope
            .select(&selector)
            .map(element_text)
            .find(|text| !text.is_empty())
    })
}

/// "1,873 ratings" -> 1873
fn parse_count(text: &str) -> Option<u32> {
    let digits: String = text
        .split_whitespace()
        .next()?
        .chars()
        .filter(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

/// First number in `text`, thousands separators removed.
fn parse_money(text: &str) -> Option<String> {
    MONEY
        .find(text)
        .map(|m| m.as_str().replace(',', ""))
        .filter(|s| !s.is_empty())
}

fn extract_price(document: &Html) -> Option<String> {
    PRICE_SPLIT
        .iter()
        .find_map(|&parts| split_price(document.root_element(), parts))
        .or_else(|| first_text(document, PRICE_TEXT).and_then(|text| parse_money(&text)))
}

/// Price rendered as separate whole and fraction spans.
fn split_price(scope: ElementRef<'_>, (whole_sel, fraction_sel): (&str, &str)) -> Option<String> {
    let whole: String = scoped_text(scope, &[whole_sel])?
        .chars()
        .filter(char::is_ascii_digit)
        .collect();
    if whole.is_empty() {
        return None;
    }
    let fraction: String = scoped_text(scope, &[fraction_sel])
        .unwrap_or_default()
        .chars()
        .filter(char::is_ascii_digit)
        .collect();
    Some(if fraction.is_empty() {
        whole
    } else {
        format!("{}.{}", whole, fraction)
    })
}

fn extract_other_offers(document: &Html) -> Vec<MarketOffer> {
    let Ok(rows) = Selector::parse(OFFER_ROWS) else {
        return Vec::new();
    };
    document
        .select(&rows)
        .map(|row| MarketOffer {
            offer_type: scoped_text(row, OFFER_HEADING),
            shipped_from: scoped_text(row, OFFER_SHIPS_FROM),
            seller_name: scoped_text(row, OFFER_SOLD_BY),
            price: split_price(row, OFFER_PRICE),
        })
        .collect()
}

fn extract_offers(document: &Html) -> Option<OfferCount> {
    for selector_str in OFFERS {
        let Ok(selector) = Selector::parse(selector_str) else {
            continue;
        };
        for element in document.select(&selector) {
            let text = element_text(element);
            if let Some(count) = OFFER_COUNT
                .captures(&text)
                .and_then(|caps| caps[1].parse::<u32>().ok())
            {
                return Some(OfferCount(count));
            }
        }
    }
    None
}

fn extract_rank(document: &Html) -> Option<String> {
    // Technical details table: <tr><th>Best Sellers Rank</th><td>...</td></tr>
    if let (Ok(rows), Ok(th), Ok(td)) = (
        Selector::parse("tr"),
        Selector::parse("th"),
        Selector::parse("td"),
    ) {
        for row in document.select(&rows) {
            let labelled = row
                .select(&th)
                .next()
                .is_some_and(|h| element_text(h).contains(RANK_LABEL));
            if labelled {
                if let Some(cell) = row.select(&td).next() {
                    return clean_rank(&element_text(cell));
                }
            }
        }
    }

    // Detail bullets: <li><span><span>Best Sellers Rank:</span> #12 in ...</span></li>
    if let Ok(items) = Selector::parse("#detailBulletsWrapper_feature_div li, #detailBullets_feature_div li") {
        for item in document.select(&items) {
            let text = element_text(item);
            if let Some(pos) = text.find(RANK_LABEL) {
                let rest = text[pos + RANK_LABEL.len()..].trim_start_matches([':', ' ']);
                return clean_rank(rest);
            }
        }
    }

    None
}

/// Strip parenthesised notes and list each `#N in Category` ranking.
fn clean_rank(raw: &str) -> Option<String> {
    let cleaned = PARENTHETICAL.replace_all(raw, "");
    let ranks: Vec<String> = cleaned
        .split('#')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| format!("#{}", part))
        .collect();

    if ranks.is_empty() {
        None
    } else {
        Some(ranks.join(", "))
    }
}
