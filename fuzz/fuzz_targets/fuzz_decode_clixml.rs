//! Fuzz target for CLIXML error stream decoding.
//!
//! Remote stderr is attacker-influenced text; decoding must never panic and
//! must never lose plain (non-CLIXML) input.

#![no_main]

use libfuzzer_sys::fuzz_target;
use windowsad::powershell::{decode_cli_xml, is_cli_xml, parse_cli_xml};

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    let decoded = decode_cli_xml(text);
    if !is_cli_xml(text) {
        assert_eq!(decoded, text);
    }

    // Force the parser path regardless of the header.
    let framed = format!("#< CLIXML\r\n{}", text);
    let _ = parse_cli_xml(&framed);
    let _ = decode_cli_xml(&framed);
});
