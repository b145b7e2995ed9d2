//! Escaping and literal rendering for PowerShell script text.
//!
//! Every dynamic value that ends up inside a script passes through
//! [`sanitise_string`] or [`render_literal`]. The escaped form is only valid
//! inside a double-quoted PowerShell string.

use indexmap::IndexMap;
use serde_json::Value;
use std::fmt;

use super::decode::DecodeError;

/// Escape `input` for interpolation into a double-quoted PowerShell string.
///
/// The backtick, `$` and every character PowerShell accepts as a double
/// quote (`"`, U+201C, U+201D, U+201E) are prefixed with a backtick; control
/// characters become their backtick escape sequence. Each input character
/// is visited once, so escape sequences produced here are never escaped
/// again.
pub fn sanitise_string(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + input.len() / 8);
    for c in input.chars() {
        match c {
            '`' => out.push_str("``"),
            '"' | '\u{201C}' | '\u{201D}' | '\u{201E}' => {
                out.push('`');
                out.push(c);
            }
            '$' => out.push_str("`$"),
            '\n' => out.push_str("`n"),
            '\r' => out.push_str("`r"),
            '\t' => out.push_str("`t"),
            '\0' => out.push_str("`0"),
            '\x07' => out.push_str("`a"),
            '\x08' => out.push_str("`b"),
            '\x0c' => out.push_str("`f"),
            '\x0b' => out.push_str("`v"),
            _ => out.push(c),
        }
    }
    out
}

/// Quote a value for use as a bare argument.
///
/// Host names and similar tokens made only of letters, digits, `.`, `-` and
/// `_` are returned unchanged; anything else is rendered as a quoted string.
pub fn render_bare_word(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
    if plain {
        value.to_string()
    } else {
        format!("\"{}\"", sanitise_string(value))
    }
}

/// Text produced by [`render_literal`].
///
/// Only this module can build one, so its contents are always a quoted,
/// escaped literal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RenderedLiteral(String);

impl RenderedLiteral {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RenderedLiteral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    /// A value already in rendered literal form.
    Rendered(RenderedLiteral),
}

impl From<RenderedLiteral> for Scalar {
    fn from(value: RenderedLiteral) -> Self {
        Scalar::Rendered(value)
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::String(value.to_string())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Scalar::String(value)
    }
}

impl From<&String> for Scalar {
    fn from(value: &String) -> Self {
        Scalar::String(value.clone())
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Scalar::Bool(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Scalar::Int(value)
    }
}

impl From<i32> for Scalar {
    fn from(value: i32) -> Self {
        Scalar::Int(value.into())
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Scalar::Float(value)
    }
}

/// Render a value in canonical quoted-literal form.
///
/// Every form is a double-quoted string: `"hello"`, `"true"`, `"42"`,
/// `"123.456"`. Whole floats drop the decimal point (`100.0` renders as
/// `"100"`). A [`Scalar::Rendered`] value is returned as is.
pub fn render_literal(value: &Scalar) -> String {
    render(value).0
}

fn render(value: &Scalar) -> RenderedLiteral {
    let text = match value {
        Scalar::String(s) => format!("\"{}\"", sanitise_string(s)),
        Scalar::Bool(b) => format!("\"{}\"", b),
        Scalar::Int(i) => format!("\"{}\"", i),
        Scalar::Float(f) => format!("\"{}\"", format_float(*f)),
        Scalar::Rendered(r) => return r.clone(),
    };
    RenderedLiteral(text)
}

fn format_float(f: f64) -> String {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e15 {
        format!("{}", f as i64)
    } else {
        format!("{}", f)
    }
}

/// A custom attribute: one value or an ordered collection.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Multi(Vec<Scalar>),
    Single(Scalar),
}

impl AttributeValue {
    /// Convert a JSON value. `null` becomes an empty string; nested objects
    /// are kept as their JSON text.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Array(items) => AttributeValue::Multi(items.iter().map(scalar_from_json).collect()),
            other => AttributeValue::Single(scalar_from_json(other)),
        }
    }
}

fn scalar_from_json(value: &Value) -> Scalar {
    match value {
        Value::Null => Scalar::String(String::new()),
        Value::Bool(b) => Scalar::Bool(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Scalar::Int(i),
            None => Scalar::Float(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => Scalar::String(s.clone()),
        other => Scalar::String(other.to_string()),
    }
}

/// Render every value to its literal form, sorting collections.
///
/// Collection elements are rendered then sorted lexicographically; scalar
/// entries are rendered only. Rendered values are stored as
/// [`Scalar::Rendered`], so a second pass leaves the map unchanged.
pub fn sort_multi_valued(attrs: &mut IndexMap<String, AttributeValue>) {
    for value in attrs.values_mut() {
        match value {
            AttributeValue::Multi(items) => {
                let mut rendered: Vec<RenderedLiteral> = items.iter().map(render).collect();
                rendered.sort();
                *items = rendered.into_iter().map(Scalar::Rendered).collect();
            }
            AttributeValue::Single(scalar) => {
                *scalar = Scalar::Rendered(render(scalar));
            }
        }
    }
}

/// Directory attributes outside the fixed record schema.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CustomAttributes(IndexMap<String, AttributeValue>);

impl CustomAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from decoded JSON fields.
    pub fn from_json_map<'a, I>(fields: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a Value)>,
    {
        Self(
            fields
                .into_iter()
                .map(|(k, v)| (k.clone(), AttributeValue::from_json(v)))
                .collect(),
        )
    }

    /// Parse a JSON object such as `{"extensionAttribute1": "a", "otherMailbox": ["x", "y"]}`.
    pub fn from_json_str(text: &str) -> Result<Self, DecodeError> {
        let map: IndexMap<String, Value> =
            serde_json::from_str(text).map_err(|e| DecodeError::json(e, text))?;
        Ok(Self::from_json_map(&map))
    }

    pub fn insert(&mut self, name: impl Into<String>, value: AttributeValue) {
        self.0.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&AttributeValue> {
        self.0.get(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AttributeValue)> {
        self.0.iter()
    }

    /// Keep only the named attributes. Names match case-insensitively, as
    /// directory attribute names do; the caller's spelling is kept.
    pub fn select<S: AsRef<str>>(&self, names: &[S]) -> Self {
        let mut out = IndexMap::new();
        for name in names {
            let name = name.as_ref();
            if let Some((_, value)) = self.0.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
                out.insert(name.to_string(), value.clone());
            }
        }
        Self(out)
    }

    /// Canonical form for comparison. See [`sort_multi_valued`].
    pub fn canonicalize(mut self) -> Self {
        sort_multi_valued(&mut self.0);
        self
    }

    /// True when both sets hold the same values regardless of collection order.
    pub fn equivalent(&self, other: &Self) -> bool {
        self.clone().canonicalize() == other.clone().canonicalize()
    }

    /// Render as a PowerShell hashtable, e.g. `@{"a"="1";"b"=@("x","y")}`.
    pub fn to_hashtable_literal(&self) -> String {
        let entries: Vec<String> = self
            .0
            .iter()
            .map(|(name, value)| {
                let rendered = match value {
                    AttributeValue::Single(s) => render_literal(s),
                    AttributeValue::Multi(items) => format!(
                        "@({})",
                        items.iter().map(render_literal).collect::<Vec<_>>().join(",")
                    ),
                };
                format!("\"{}\"={}", sanitise_string(name), rendered)
            })
            .collect();
        format!("@{{{}}}", entries.join(";"))
    }
}

impl fmt::Display for CustomAttributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hashtable_literal())
    }
}
