//! Fuzz target for JSON result decoding.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use windowsad::directory::{GpLink, Group, User};
use windowsad::powershell::decode_output;

#[derive(Debug, Arbitrary)]
struct Input {
    stdout: String,
    force_array: bool,
}

fuzz_target!(|input: Input| {
    if let Ok(decoded) = decode_output::<serde_json::Value>(&input.stdout, input.force_array) {
        if input.force_array {
            assert!(decoded.is_many());
        }
    }
    let _ = decode_output::<User>(&input.stdout, input.force_array);
    let _ = decode_output::<Group>(&input.stdout, input.force_array);
    let _ = decode_output::<GpLink>(&input.stdout, input.force_array);
});
