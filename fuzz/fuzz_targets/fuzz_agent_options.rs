//! Fuzz target for agent option parsing.
//!
//! Arbitrary `key=value` lines should either build a valid agent config or
//! fail with an error, and a parsed config must survive a round trip.

#![no_main]

use distribution_engine::AgentConfig;
use libfuzzer_sys::fuzz_target;
use std::collections::BTreeMap;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    let options: BTreeMap<String, String> = text
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    if let Ok(config) = AgentConfig::from_options("fuzz", &options) {
        let again = AgentConfig::from_options("fuzz", &config.to_properties());
        assert!(again.is_ok());
    }
});
