//! PowerShell script handling.
//!
//! - [`sanitize`] escapes values for double-quoted PowerShell strings
//! - [`command`] assembles scripts from fragments and options
//! - [`decode`] reads CLIXML error streams and JSON output

pub mod command;
pub mod decode;
pub mod sanitize;

pub use command::{Cmdlet, PsCommand, PsCommandOptions, REDACTED};
pub use decode::{
    cli_xml_errors, decode_cli_xml, decode_output, is_cli_xml, parse_cli_xml, Decoded, DecodeError, PsOutput, Segment,
};
pub use sanitize::{
    render_bare_word, render_literal, sanitise_string, sort_multi_valued, AttributeValue, CustomAttributes,
    RenderedLiteral, Scalar,
};
