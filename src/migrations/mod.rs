mod m0001_initial;
mod m0002_snapshot_date_index;
mod m0003_listing_details;

use cetane::prelude::MigrationRegistry;

pub fn registry() -> MigrationRegistry {
    let mut reg = MigrationRegistry::new();
    reg.register(m0001_initial::migration());
    reg.register(m0002_snapshot_date_index::migration());
    reg.register(m0003_listing_details::migration());
    reg
}
