// Diesel table definitions. Kept in sync with `crate::migrations`.

diesel::table! {
    scrape_checkpoints (scan_date) {
        scan_date -> Text,
        last_identifier -> Nullable<Text>,
        last_index -> Integer,
        completed -> Bool,
        updated_at -> Text,
    }
}

diesel::table! {
    product_snapshots (id) {
        id -> Integer,
        identifier -> Text,
        scan_date -> Text,
        status -> Text,
        title -> Nullable<Text>,
        price -> Nullable<Text>,
        minimum_price -> Nullable<Text>,
        offer_count -> Nullable<Integer>,
        best_seller_rank -> Nullable<Text>,
        error -> Nullable<Text>,
        scraped_at -> Text,
        rating -> Nullable<Text>,
        reviews_count -> Nullable<Integer>,
        buybox_shipped_from -> Nullable<Text>,
        buybox_sold_by -> Nullable<Text>,
        buybox_price -> Nullable<Text>,
        other_offers -> Nullable<Text>,
    }
}

diesel::allow_tables_to_appear_in_same_query!(scrape_checkpoints, product_snapshots);
