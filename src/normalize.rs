//! Cleaning of free-text title and abstract fields.
//!
//! Every field passes through the same ordered chain: trim, discard
//! placeholders, bare DOIs and bare URLs, decode HTML entities, strip markup,
//! collapse whitespace and finally drop whatever could not be decoded as
//! UTF-8. Nothing in here fails; unusable input comes out as an empty string.

use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use url::{Host, Url};

use crate::entities;

/// Title Crossref reports for works that have none.
pub const NO_TITLE_PLACEHOLDER: &str = "[NO TITLE AVAILABLE]";

// Stand-in for an undecodable byte sequence while the text is being cleaned.
// U+FDD0 is a Unicode noncharacter, reserved for exactly this kind of internal use.
const INVALID_MARKER: char = '\u{FDD0}';

const URL_SCHEMES: [&str; 4] = ["http", "https", "ftp", "ftps"];

// https://www.crossref.org/blog/dois-and-matching-regular-expressions/
static CROSSREF_DOI: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^10\.[0-9]{4,9}/[-._;()/:a-zA-Z0-9]+$").unwrap());

static MARKUP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"(?s)<!--.*?-->",
        r"|<!\[CDATA\[(?P<cdata>.*?)\]\]>",
        r"|<[!?][^>]*>",
        r#"|</?[A-Za-z][^>"']*(?:(?:"[^"]*"|'[^']*')[^>"']*)*>"#,
    ))
    .unwrap()
});

/// Clean a text field. `None` and blank input both produce "".
pub fn normalize(text: Option<&str>) -> String {
    match text {
        Some(text) => clean(text),
        None => String::new(),
    }
}

/// Clean a raw CSV field that may hold invalid UTF-8.
///
/// Invalid sequences survive the intermediate steps as opaque characters and
/// are only removed at the very end, so the whitespace around them is left
/// as it was after collapsing.
pub fn normalize_bytes(raw: Option<&[u8]>) -> String {
    match raw {
        Some(raw) => clean(&decode_marking_invalid(raw)),
        None => String::new(),
    }
}

/// Decode a field that is copied through verbatim, dropping invalid UTF-8.
pub fn decode_utf8(raw: &[u8]) -> String {
    raw.utf8_chunks().map(|chunk| chunk.valid()).collect()
}

/// Whether the whole of `text` is a Crossref DOI. DOIs inside longer text do not count.
pub fn is_doi(text: &str) -> bool {
    CROSSREF_DOI.is_match(text)
}

/// Whether the whole of `text` is a web or ftp URL with a plausible host.
pub fn is_url(text: &str) -> bool {
    if text.is_empty() || text.chars().any(is_space) {
        return false;
    }
    let Some((scheme, rest)) = text.split_once("://") else {
        return false;
    };
    if rest.is_empty() || !URL_SCHEMES.iter().any(|s| s.eq_ignore_ascii_case(scheme)) {
        return false;
    }
    match Url::parse(text) {
        Ok(url) => match url.host() {
            Some(Host::Ipv4(_)) | Some(Host::Ipv6(_)) => true,
            Some(Host::Domain(domain)) => is_plausible_domain(domain),
            None => false,
        },
        Err(_) => false,
    }
}

fn clean(text: &str) -> String {
    let text = text.trim_matches(is_space);
    if is_discardable(text) {
        return String::new();
    }

    let mut text = collapse_whitespace(&settle(text.to_string())).replace('\n', "");
    if text.contains(INVALID_MARKER) {
        // Dropping the markers can join the pieces of a tag or an entity.
        text = settle(text.replace(INVALID_MARKER, "")).replace('\n', "");
    }

    if is_discardable(text.trim_matches(is_space)) {
        return String::new();
    }
    text
}

fn is_discardable(text: &str) -> bool {
    text.is_empty() || text == NO_TITLE_PLACEHOLDER || is_doi(text) || is_url(text)
}

// Entities can hide markup and markup can split entities, so repeat until stable.
fn settle(mut text: String) -> String {
    loop {
        let next = strip_markup(&entities::unescape(&text));
        if next == text {
            return text;
        }
        text = next;
    }
}

fn strip_markup(text: &str) -> String {
    MARKUP
        .replace_all(text, |caps: &Captures| {
            caps.name("cdata")
                .map_or_else(String::new, |m| m.as_str().to_string())
        })
        .into_owned()
}

fn collapse_whitespace(text: &str) -> String {
    text.split(is_space)
        .filter(|word| !word.is_empty())
        .collect::<Vec<&str>>()
        .join(" ")
}

// Unicode whitespace plus the ASCII file/group/record/unit separators.
fn is_space(c: char) -> bool {
    c.is_whitespace() || ('\u{1c}'..='\u{1f}').contains(&c)
}

fn is_plausible_domain(domain: &str) -> bool {
    if domain.eq_ignore_ascii_case("localhost") {
        return true;
    }
    let labels: Vec<&str> = domain.trim_end_matches('.').split('.').collect();
    if labels.len() < 2 {
        return false;
    }
    let labels_ok = labels.iter().all(|label| {
        !label.is_empty()
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_alphanumeric() || c == '-')
    });
    let tld = labels[labels.len() - 1];
    labels_ok
        && (tld.starts_with("xn--")
            || (tld.chars().count() >= 2 && tld.chars().all(char::is_alphabetic)))
}

fn decode_marking_invalid(raw: &[u8]) -> Cow<'_, str> {
    if let Ok(text) = std::str::from_utf8(raw) {
        return Cow::Borrowed(text);
    }
    let mut decoded = String::with_capacity(raw.len());
    for chunk in raw.utf8_chunks() {
        decoded.push_str(chunk.valid());
        if !chunk.invalid().is_empty() {
            decoded.push(INVALID_MARKER);
        }
    }
    Cow::Owned(decoded)
}
