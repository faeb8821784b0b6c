//! Fuzz target for the TOML configuration parser.
//!
//! Run with: cargo +nightly fuzz run fuzz_config_parser
//!
//! `AppConfig::parse` runs on user-edited config files, so arbitrary input
//! must produce a clean `Err`, never a panic or hang.

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let _ = colloquy_config::AppConfig::parse(text);
});
