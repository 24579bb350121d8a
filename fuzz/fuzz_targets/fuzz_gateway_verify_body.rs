//! Fuzz target: JSON deserialization of `VerifyBody`.
//!
//! Errors are expected; panics are not.

#![no_main]

use breakfix_gateway::routes::VerifyBody;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = serde_json::from_slice::<VerifyBody>(data);
});
