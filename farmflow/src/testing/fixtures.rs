//! Sample farmer records.

use crate::core::{Address, FarmerRecord};

/// A valid record with a phone unique to `index`.
#[must_use]
pub fn sample_record(index: usize) -> FarmerRecord {
    FarmerRecord::new(
        format!("Farmer{index}"),
        "Patil",
        format!("98{:08}", index % 100_000_000),
    )
    .with_gender("male")
    .with_address(Address {
        village: Some("Shirur".into()),
        district: Some("Pune".into()),
        state: Some("Maharashtra".into()),
        ..Address::default()
    })
}

/// `count` valid records with distinct phone numbers.
#[must_use]
pub fn sample_records(count: usize) -> Vec<FarmerRecord> {
    (0..count).map(sample_record).collect()
}

/// A record whose phone has only nine digits.
#[must_use]
pub fn short_phone_record() -> FarmerRecord {
    FarmerRecord::new("Sunita", "Devi", "987654321")
}
