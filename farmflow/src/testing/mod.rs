//! Test doubles for the onboarding pipeline.
//!
//! The fakes implement the capability ports in memory, count calls and can
//! be told to fail or slow down a specific method. They back the crate's own
//! tests and benches and are usable by downstream integration tests.

mod fakes;
mod fixtures;

pub use fakes::{
    FakeAccountService, FakeCall, FakeFarmerRegistry, FakeLinkageService, FakeServices, FaultPlan,
};
pub use fixtures::{sample_record, sample_records, short_phone_record};
