//! Fuzz target for LSN parsing.
//!
//! Parsing arbitrary strings must never panic, and anything that parses
//! must display back to a string that parses to the same position.

#![no_main]

use libfuzzer_sys::fuzz_target;
use table_sync::Lsn;

fuzz_target!(|data: &str| {
    if let Ok(lsn) = data.parse::<Lsn>() {
        let shown = lsn.to_string();
        assert_eq!(shown.parse::<Lsn>(), Ok(lsn));
    }
});
