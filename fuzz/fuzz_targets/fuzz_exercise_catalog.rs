//! Fuzz target: exercise catalog parsing and progression.
//!
//! Any catalog that parses must yield a progression that visits each
//! enabled exercise exactly once.

#![no_main]

use breakfix_core::{first_enabled, next_enabled, MemoryStore};
use breakfix_gateway::catalog::parse_exercises;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(raw) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(exercises) = parse_exercises(raw) else {
        return;
    };
    let enabled = exercises.iter().filter(|e| e.enabled).count();

    // MemoryStore sorts into progression order.
    let _ = MemoryStore::with_exercises(exercises.clone());

    let mut sorted = exercises;
    sorted.sort_by_key(breakfix_core::Exercise::sort_key);
    let mut visited = 0;
    let mut current = first_enabled(&sorted);
    while let Some(ex) = current {
        visited += 1;
        assert!(visited <= enabled, "progression revisited an exercise");
        current = next_enabled(&sorted, ex);
    }
    assert_eq!(visited, enabled);
});
