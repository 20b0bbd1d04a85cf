use cetane::prelude::*;

pub fn migration() -> Migration {
    Migration::new("0002_snapshot_date_index")
        .depends_on(&["0001_initial"])
        .operation(AddIndex::new(
            "product_snapshots",
            Index::new("idx_product_snapshots_scan_date")
                .column("scan_date")
                .column("status"),
        ))
}
