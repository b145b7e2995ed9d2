//! Fuzz target for string escaping.
//!
//! Checks that escaped output can never terminate a double-quoted string or
//! start a variable expansion.

#![no_main]

use libfuzzer_sys::fuzz_target;
use windowsad::powershell::sanitise_string;

fuzz_target!(|input: String| {
    let escaped = sanitise_string(&input);

    let mut chars = escaped.chars();
    while let Some(c) = chars.next() {
        match c {
            '`' => {
                // Every backtick introduces exactly one escaped character.
                assert!(chars.next().is_some(), "dangling backtick in {:?}", escaped);
            }
            '"' | '\u{201C}' | '\u{201D}' | '\u{201E}' | '$' => panic!("unescaped {:?} in {:?}", c, escaped),
            _ => {}
        }
    }
});
