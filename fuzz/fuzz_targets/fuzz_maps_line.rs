#![no_main]

use libfuzzer_sys::fuzz_target;
use stasis_kernfeat::probes::{parse_maps_content, parse_maps_line};

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        if let Some(entry) = parse_maps_line(text) {
            // Decoded entries must be internally consistent.
            assert!(entry.end >= entry.start);
            assert!(!entry.perms.is_empty());
        }
        let _ = parse_maps_content(text);
    }
});
