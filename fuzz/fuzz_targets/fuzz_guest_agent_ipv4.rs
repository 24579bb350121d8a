//! Fuzz target: guest-agent `network-get-interfaces` parsing.
//!
//! Arbitrary JSON must never panic the IPv4 extractor, and any address it
//! returns must be usable (not loopback or unspecified).

#![no_main]

use breakfix_executor::proxmox::first_ipv4;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(data) else {
        return;
    };
    if let Some(ip) = first_ipv4(&value) {
        assert!(!ip.is_loopback(), "loopback address returned");
        assert!(!ip.is_unspecified(), "unspecified address returned");
    }
});
