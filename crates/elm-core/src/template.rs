//! Response template markup
//!
//! A template is a flat sequence of tagged elements with optional text
//! around them:
//!
//! ```text
//! <exec>cmd_use_header = true</exec>OK <writeln />
//! <header>7E8</header><size>03</size><data>41 00 BE</data>
//! ```
//!
//! Elements do not nest. Tag names are case-insensitive; the usual XML
//! entities are decoded in text. Anything else is rejected.

use crate::error::{ElmError, ElmResult};

/// Known template tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Header,
    Size,
    Data,
    Subd,
    Answer,
    PosAnswer,
    NegAnswer,
    Flow,
    String,
    Writeln,
    Space,
    Eval,
    Exec,
    Rh,
    Rd,
}

impl Tag {
    pub fn from_name(name: &str) -> Option<Self> {
        let tag = match name.to_ascii_lowercase().as_str() {
            "header" => Tag::Header,
            "size" => Tag::Size,
            "data" => Tag::Data,
            "subd" => Tag::Subd,
            "answer" => Tag::Answer,
            "pos_answer" => Tag::PosAnswer,
            "neg_answer" => Tag::NegAnswer,
            "flow" => Tag::Flow,
            "string" => Tag::String,
            "writeln" => Tag::Writeln,
            "space" => Tag::Space,
            "eval" => Tag::Eval,
            "exec" => Tag::Exec,
            "rh" => Tag::Rh,
            "rd" => Tag::Rd,
            _ => return None,
        };
        Some(tag)
    }
}

/// One tagged element plus the trimmed text following it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub tag: Tag,
    /// Decoded inner text, untrimmed
    pub text: String,
    pub tail: String,
}

/// Parsed template
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Template {
    /// Trimmed text before the first element
    pub leading: String,
    pub elements: Vec<Element>,
}

impl Template {
    pub fn parse(input: &str) -> ElmResult<Self> {
        let (leading, mut rest) = split_text(input)?;
        let mut elements = Vec::new();

        while !rest.is_empty() {
            let (open, after) = read_markup(rest)?;
            rest = after;
            let (name, self_closing) = match open.strip_suffix('/') {
                Some(name) => (name.trim_end(), true),
                None => (open.trim_end(), false),
            };
            if let Some(closing) = name.strip_prefix('/') {
                return Err(ElmError::Template(format!("unexpected closing tag </{}>", closing)));
            }
            let tag = parse_name(name)?;

            let text = if self_closing {
                String::new()
            } else {
                let end = rest
                    .find('<')
                    .ok_or_else(|| ElmError::Template(format!("unclosed tag <{}>", name)))?;
                let text = unescape(&rest[..end])?;
                let (close, after) = read_markup(&rest[end..])?;
                match close.strip_prefix('/') {
                    Some(closing) if closing.trim_end().eq_ignore_ascii_case(name) => {}
                    _ => {
                        return Err(ElmError::Template(format!(
                            "expected </{}>, found <{}>",
                            name, close
                        )))
                    }
                }
                rest = after;
                text
            };

            let (tail, after) = split_text(rest)?;
            rest = after;
            elements.push(Element { tag, text, tail });
        }

        Ok(Self { leading, elements })
    }
}

/// Split leading text off `input`, returning it trimmed and decoded
fn split_text(input: &str) -> ElmResult<(String, &str)> {
    let end = input.find('<').unwrap_or(input.len());
    let text = unescape(&input[..end])?.trim().to_string();
    Ok((text, &input[end..]))
}

/// Read `<...>` at the start of `input`, returning the inside
fn read_markup(input: &str) -> ElmResult<(&str, &str)> {
    let inner = input
        .strip_prefix('<')
        .ok_or_else(|| ElmError::Template(format!("expected tag at {:?}", input)))?;
    let end = inner
        .find('>')
        .ok_or_else(|| ElmError::Template(format!("unterminated tag at {:?}", input)))?;
    let markup = &inner[..end];
    if markup.contains('<') {
        return Err(ElmError::Template(format!("malformed tag <{}", markup)));
    }
    Ok((markup, &inner[end + 1..]))
}

fn parse_name(name: &str) -> ElmResult<Tag> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ElmError::Template(format!("malformed tag <{}>", name)));
    }
    Tag::from_name(name).ok_or_else(|| ElmError::Template(format!("unknown tag <{}>", name)))
}

/// Decode XML entities
fn unescape(text: &str) -> ElmResult<String> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let end = after
            .find(';')
            .ok_or_else(|| ElmError::Template(format!("unterminated entity in {:?}", text)))?;
        let entity = &after[..end];
        let decoded = match entity {
            "lt" => '<',
            "gt" => '>',
            "amp" => '&',
            "quot" => '"',
            "apos" => '\'',
            _ => {
                let code = if let Some(hex) = entity.strip_prefix("#x") {
                    u32::from_str_radix(hex, 16).ok()
                } else if let Some(dec) = entity.strip_prefix('#') {
                    dec.parse().ok()
                } else {
                    None
                };
                code.and_then(char::from_u32)
                    .ok_or_else(|| ElmError::Template(format!("unknown entity &{};", entity)))?
            }
        };
        out.push(decoded);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}
