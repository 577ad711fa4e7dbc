//! HTML5 character reference decoding.
//!
//! Named references are looked up in `html_escape`'s WHATWG table. On top of
//! that this follows the HTML5 tokenizer's error recovery: the legacy names
//! that may appear without a trailing semicolon (`&amp`, `&copy`, ...) are
//! decoded, and numeric references to surrogates, NUL or out-of-range code
//! points become U+FFFD.

use std::borrow::Cow;

use html_escape::NAMED_ENTITIES;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

static CHARACTER_REFERENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"&(#[0-9]+;?|#[xX][0-9a-fA-F]+;?|[^\t\n\x0C <&#;]{1,32};?)").unwrap()
});

// Names the HTML5 tokenizer accepts without a terminating semicolon. Sorted.
const LEGACY_NAMES: [&str; 106] = [
    "AElig", "AMP", "Aacute", "Acirc", "Agrave", "Aring", "Atilde", "Auml", "COPY", "Ccedil",
    "ETH", "Eacute", "Ecirc", "Egrave", "Euml", "GT", "Iacute", "Icirc", "Igrave", "Iuml", "LT",
    "Ntilde", "Oacute", "Ocirc", "Ograve", "Oslash", "Otilde", "Ouml", "QUOT", "REG", "THORN",
    "Uacute", "Ucirc", "Ugrave", "Uuml", "Yacute", "aacute", "acirc", "acute", "aelig", "agrave",
    "amp", "aring", "atilde", "auml", "brvbar", "ccedil", "cedil", "cent", "copy", "curren",
    "deg", "divide", "eacute", "ecirc", "egrave", "eth", "euml", "frac12", "frac14", "frac34",
    "gt", "iacute", "icirc", "iexcl", "igrave", "iquest", "iuml", "laquo", "lt", "macr", "micro",
    "middot", "nbsp", "not", "ntilde", "oacute", "ocirc", "ograve", "ordf", "ordm", "oslash",
    "otilde", "ouml", "para", "plusmn", "pound", "quot", "raquo", "reg", "sect", "shy", "sup1",
    "sup2", "sup3", "szlig", "thorn", "times", "uacute", "ucirc", "ugrave", "uml", "uuml",
    "yacute", "yen", "yuml",
];

// Numeric references in 0x80..=0x9F are read as windows-1252.
const WINDOWS_1252: [char; 32] = [
    '\u{20AC}', '\u{81}', '\u{201A}', '\u{192}', '\u{201E}', '\u{2026}', '\u{2020}', '\u{2021}',
    '\u{2C6}', '\u{2030}', '\u{160}', '\u{2039}', '\u{152}', '\u{8D}', '\u{17D}', '\u{8F}',
    '\u{90}', '\u{2018}', '\u{2019}', '\u{201C}', '\u{201D}', '\u{2022}', '\u{2013}', '\u{2014}',
    '\u{2DC}', '\u{2122}', '\u{161}', '\u{203A}', '\u{153}', '\u{9D}', '\u{17E}', '\u{178}',
];

/// Replace every character reference in `text` with the text it stands for.
/// References that are not recognised are kept verbatim.
pub fn unescape(text: &str) -> Cow<'_, str> {
    if !text.contains('&') {
        return Cow::Borrowed(text);
    }
    CHARACTER_REFERENCE.replace_all(text, |caps: &Captures| {
        let reference = &caps[1];
        match reference.strip_prefix('#') {
            Some(number) => decode_numeric(number),
            None => decode_named(reference),
        }
    })
}

fn decode_numeric(number: &str) -> String {
    let number = number.trim_end_matches(';');
    let value = match number.strip_prefix(['x', 'X']) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => number.parse::<u64>(),
    };
    // Too many digits for a u64 is out of range all the same.
    let value = value.unwrap_or(u64::MAX);

    match value {
        0x00 => '\u{FFFD}'.to_string(),
        0x0D => '\r'.to_string(),
        0x80..=0x9F => WINDOWS_1252[(value - 0x80) as usize].to_string(),
        0xD800..=0xDFFF | 0x110000.. => '\u{FFFD}'.to_string(),
        _ if is_forbidden_code_point(value) => String::new(),
        _ => char::from_u32(value as u32)
            .map_or_else(|| '\u{FFFD}'.to_string(), |c| c.to_string()),
    }
}

fn is_forbidden_code_point(value: u64) -> bool {
    matches!(value, 0x01..=0x08 | 0x0B | 0x0E..=0x1F | 0x7F..=0x9F | 0xFDD0..=0xFDEF)
        || value & 0xFFFE == 0xFFFE
}

fn decode_named(reference: &str) -> String {
    if let Some(name) = reference.strip_suffix(';') {
        if let Some(value) = lookup(name) {
            return value.to_string();
        }
    } else if is_legacy(reference) {
        if let Some(value) = lookup(reference) {
            return value.to_string();
        }
    }

    // The longest legacy name that is a strict prefix wins, e.g. `&notit;` is `¬it;`.
    for end in (2..reference.len()).rev() {
        let Some(prefix) = reference.get(..end) else {
            continue;
        };
        if is_legacy(prefix) {
            if let Some(value) = lookup(prefix) {
                return format!("{}{}", value, &reference[end..]);
            }
        }
    }
    format!("&{}", reference)
}

fn is_legacy(name: &str) -> bool {
    LEGACY_NAMES.binary_search(&name).is_ok()
}

fn lookup(name: &str) -> Option<&'static str> {
    NAMED_ENTITIES
        .binary_search_by(|(entity, _)| (*entity).cmp(name.as_bytes()))
        .ok()
        .map(|index| NAMED_ENTITIES[index].1)
}
