use cetane::prelude::*;

pub fn migration() -> Migration {
    Migration::new("0003_listing_details")
        .depends_on(&["0002_snapshot_date_index"])
        .operation(AddField::new(
            "product_snapshots",
            Field::new("rating", FieldType::Text),
        ))
        .operation(AddField::new(
            "product_snapshots",
            Field::new("reviews_count", FieldType::Integer),
        ))
        .operation(AddField::new(
            "product_snapshots",
            Field::new("buybox_shipped_from", FieldType::Text),
        ))
        .operation(AddField::new(
            "product_snapshots",
            Field::new("buybox_sold_by", FieldType::Text),
        ))
        .operation(AddField::new(
            "product_snapshots",
            Field::new("buybox_price", FieldType::Text),
        ))
        // JSON array of {type, shipped_from, seller_name, price}; NULL when none were listed
        .operation(AddField::new(
            "product_snapshots",
            Field::new("other_offers", FieldType::Text),
        ))
}
