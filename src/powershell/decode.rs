//! Output decoding.
//!
//! PowerShell writes its error, warning and verbose streams as CLIXML when
//! stdout/stderr are redirected. [`decode_cli_xml`] turns that envelope back
//! into readable text and leaves anything else alone. [`decode_output`] turns
//! JSON standard output into typed records, picking the shape from the first
//! non-whitespace character.

use once_cell::sync::Lazy;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use regex::{Captures, Regex};
use serde::de::DeserializeOwned;
use std::fmt;
use thiserror::Error;
use tracing::{trace, warn};

/// Marker line that precedes a CLIXML document.
pub const CLIXML_HEADER: &str = "#< CLIXML";

const SNIPPET_LEN: usize = 200;

static ESCAPED_CHAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"_x([0-9A-Fa-f]{4})_").expect("valid escape pattern"));

/// Errors raised while decoding command output
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Malformed CLIXML: {0}")]
    CliXml(String),

    #[error("Failed to parse JSON output: {source} (near: {snippet})")]
    Json {
        #[source]
        source: serde_json::Error,
        snippet: String,
    },

    #[error("Output is neither a JSON object nor an array: {snippet}")]
    UnexpectedShape { snippet: String },
}

impl DecodeError {
    pub fn json(source: serde_json::Error, text: &str) -> Self {
        DecodeError::Json {
            source,
            snippet: snippet(text),
        }
    }

    pub fn shape(text: &str) -> Self {
        DecodeError::UnexpectedShape {
            snippet: snippet(text),
        }
    }
}

fn snippet(text: &str) -> String {
    let text = text.trim();
    match text.char_indices().nth(SNIPPET_LEN) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// One `<S>` record and the stream it was written to (`Error`, `Warning`,
/// `Verbose`, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub stream: Option<String>,
    pub text: String,
}

impl Segment {
    pub fn is_error(&self) -> bool {
        self.stream
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case("Error"))
    }
}

/// Message segments extracted from a CLIXML document, in document order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PsOutput {
    segments: Vec<Segment>,
}

impl PsOutput {
    /// Output made of untagged lines.
    pub fn new(lines: Vec<String>) -> Self {
        Self {
            segments: lines
                .into_iter()
                .map(|text| Segment { stream: None, text })
                .collect(),
        }
    }

    pub fn from_segments(segments: Vec<Segment>) -> Self {
        Self { segments }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn lines(&self) -> Vec<&str> {
        self.segments.iter().map(|s| s.text.as_str()).collect()
    }

    pub fn into_lines(self) -> Vec<String> {
        self.segments.into_iter().map(|s| s.text).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn has_errors(&self) -> bool {
        self.segments.iter().any(Segment::is_error)
    }

    /// Only the error-stream segments.
    pub fn errors(&self) -> PsOutput {
        Self::from_segments(self.segments.iter().filter(|s| s.is_error()).cloned().collect())
    }
}

impl fmt::Display for PsOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.segments {
            f.write_str(&segment.text)?;
        }
        Ok(())
    }
}

/// Returns true if `text` carries the CLIXML marker.
pub fn is_cli_xml(text: &str) -> bool {
    text.trim_start().starts_with(CLIXML_HEADER)
}

/// Parse a CLIXML document into its string segments.
///
/// Only `<S>` elements directly under the root are collected; progress
/// records and other serialized objects are skipped.
pub fn parse_cli_xml(text: &str) -> Result<PsOutput, DecodeError> {
    let body = text
        .trim_start()
        .strip_prefix(CLIXML_HEADER)
        .ok_or_else(|| DecodeError::CliXml("missing CLIXML header".to_string()))?;

    let mut reader = Reader::from_str(body);
    reader.config_mut().trim_text(false);

    let mut segments = Vec::new();
    let mut depth = 0usize;
    let mut current: Option<(Option<String>, String)> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                depth += 1;
                if depth == 2 && e.local_name().into_inner() == b"S" {
                    current = Some((stream_attribute(&e), String::new()));
                }
            }
            Ok(Event::Empty(e)) => {
                if depth == 1 && e.local_name().into_inner() == b"S" {
                    segments.push(Segment {
                        stream: stream_attribute(&e),
                        text: String::new(),
                    });
                }
            }
            Ok(Event::Text(t)) => {
                if let Some((_, buf)) = current.as_mut() {
                    let text = t
                        .unescape()
                        .map_err(|e| DecodeError::CliXml(e.to_string()))?;
                    buf.push_str(&text);
                }
            }
            Ok(Event::CData(t)) => {
                if let Some((_, buf)) = current.as_mut() {
                    buf.push_str(&String::from_utf8_lossy(&t.into_inner()));
                }
            }
            Ok(Event::End(_)) => {
                if depth == 2 {
                    if let Some((stream, raw)) = current.take() {
                        segments.push(Segment {
                            stream,
                            text: normalize_segment(&raw),
                        });
                    }
                }
                depth = depth.saturating_sub(1);
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(DecodeError::CliXml(format!(
                    "at position {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
        }
    }

    if depth != 0 {
        return Err(DecodeError::CliXml("unexpected end of document".to_string()));
    }

    trace!(segments = segments.len(), "Decoded CLIXML");
    Ok(PsOutput::from_segments(segments))
}

fn stream_attribute(e: &BytesStart<'_>) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().into_inner() == b"S")
        .map(|a| String::from_utf8_lossy(&a.value).into_owned())
}

/// Readable text for an error stream.
///
/// CLIXML is flattened into its message text; anything else, including a
/// document that fails to parse, is returned unchanged.
pub fn decode_cli_xml(text: &str) -> String {
    if !is_cli_xml(text) {
        return text.to_string();
    }

    match parse_cli_xml(text) {
        Ok(output) => output.to_string(),
        Err(e) => {
            warn!(error = %e, "Returning undecoded error stream");
            text.to_string()
        }
    }
}

/// Error-stream text from a CLIXML envelope, or `None` when the stream
/// holds no error records. Warning, verbose and plain-text output never
/// count as errors.
pub fn cli_xml_errors(text: &str) -> Option<String> {
    if !is_cli_xml(text) {
        return None;
    }
    let output = parse_cli_xml(text).ok()?;
    output.has_errors().then(|| output.errors().to_string())
}

/// Expand `_xHHHH_` escapes, trim, and turn a leading `+` into a line break.
pub fn normalize_segment(raw: &str) -> String {
    let expanded = unescape_chars(raw);
    let trimmed = expanded.trim();
    match trimmed.strip_prefix('+') {
        Some(rest) => format!("\n{}", rest.trim()),
        None => trimmed.to_string(),
    }
}

fn unescape_chars(raw: &str) -> String {
    ESCAPED_CHAR
        .replace_all(raw, |caps: &Captures<'_>| {
            u32::from_str_radix(&caps[1], 16)
                .ok()
                .and_then(char::from_u32)
                .map(String::from)
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Records decoded from JSON output.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded<T> {
    /// The output was a single JSON object.
    Single(T),
    /// The output was an array, empty, or decoded with force-array set.
    Many(Vec<T>),
}

impl<T> Decoded<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            Decoded::Single(item) => vec![item],
            Decoded::Many(items) => items,
        }
    }

    /// The first record, if any.
    pub fn into_single(self) -> Option<T> {
        self.into_vec().into_iter().next()
    }

    pub fn first(&self) -> Option<&T> {
        match self {
            Decoded::Single(item) => Some(item),
            Decoded::Many(items) => items.first(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Decoded::Single(_) => 1,
            Decoded::Many(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_many(&self) -> bool {
        matches!(self, Decoded::Many(_))
    }
}

/// Decode JSON standard output into records.
///
/// `[` decodes as a sequence and `{` as one record (wrapped in a sequence
/// when `force_array` is set). Empty output decodes as an empty sequence.
pub fn decode_output<T: DeserializeOwned>(stdout: &str, force_array: bool) -> Result<Decoded<T>, DecodeError> {
    let text = stdout.trim_start_matches('\u{feff}').trim();

    match text.chars().next() {
        None => Ok(Decoded::Many(Vec::new())),
        Some('[') => serde_json::from_str::<Vec<T>>(text)
            .map(Decoded::Many)
            .map_err(|e| DecodeError::json(e, text)),
        Some('{') => {
            let item = serde_json::from_str::<T>(text).map_err(|e| DecodeError::json(e, text))?;
            if force_array {
                Ok(Decoded::Many(vec![item]))
            } else {
                Ok(Decoded::Single(item))
            }
        }
        Some(_) => Err(DecodeError::shape(text)),
    }
}
