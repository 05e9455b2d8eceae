//! Fuzz target for package decoding.
//!
//! `from_bytes` must never panic on arbitrary wire bytes, and anything it
//! accepts must pass its own checksum check.

#![no_main]

use distribution_engine::package::DistributionPackage;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(package) = DistributionPackage::from_bytes(data) {
        assert!(package.verify().is_ok());
    }
});
