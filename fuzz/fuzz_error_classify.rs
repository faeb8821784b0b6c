//! Fuzz target for the free-text error classifier.
//!
//! Run with: cargo +nightly fuzz run fuzz_error_classify
//!
//! Classification must be total: any provider error message, however
//! malformed, maps to an `ErrorKind` without panicking.

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        let _ = colloquy_core::classify_text(s);
    }
});
