//! Seed data for `--demo`: two small in-memory spreadsheets.

use inventory_sync_core::{columns, Fields, RawRow};
use inventory_sync_engine::MemorySource;

pub const WAREHOUSE: &str = "warehouse";
pub const SHOP: &str = "shop";

fn row(id: &str, brand: &str, code: &str, name: &str, quantity: &str, location: &str) -> RawRow {
    let fields: Fields = [
        (columns::BRAND, brand),
        (columns::PRODUCT_CODE, code),
        (columns::NAME, name),
        (columns::QUANTITY, quantity),
        (columns::UNIT, "pcs"),
        (columns::LOCATION, location),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    RawRow::new(id, fields)
}

pub fn demo_source() -> MemorySource {
    MemorySource::new()
        .with_rows(
            WAREHOUSE,
            vec![
                row("1", "Acme", "AC-100", "Packing tape", "40", "A1"),
                row("2", "Acme", "AC-220", "Nitrile gloves", "12", "A2"),
                row("3", "Borel", "BR-015", "Cable ties", "300", "B4"),
            ],
        )
        .with_rows(
            SHOP,
            vec![
                // Same local id as a warehouse row; the source keeps them apart
                row("1", "Borel", "BR-015", "Cable ties", "25", "Counter"),
                row("2", "Acme", "AC-310", "Box cutter", "6", "Shelf 3"),
            ],
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demo_sources_share_local_ids() {
        let source = demo_source();
        assert_eq!(source.rows(WAREHOUSE).len(), 3);
        assert_eq!(source.rows(SHOP).len(), 2);
        assert_eq!(source.row(WAREHOUSE, "1").unwrap()[columns::NAME], "Packing tape");
        assert_eq!(source.row(SHOP, "1").unwrap()[columns::NAME], "Cable ties");
    }
}
