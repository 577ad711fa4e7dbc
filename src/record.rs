use csv::ByteRecord;
use serde::Serialize;

use crate::normalize::{decode_utf8, normalize_bytes};

/// Number of columns every input row must carry.
pub const INPUT_COLUMNS: usize = 5;

/// Header written at the top of every output archive.
pub const OUTPUT_HEADER: [&str; 4] = ["doi", "title", "language", "score"];

// A row of an input archive. Fields borrow the raw CSV bytes; decoding
// happens during normalization so undecodable sequences can be dropped last.
pub struct InputRecord<'r> {
    pub doi: &'r [u8],
    pub mag_title: &'r [u8],
    pub crossref_title: &'r [u8],
    pub mag_abstract: &'r [u8],
    pub crossref_abstract: &'r [u8],
}

impl<'r> InputRecord<'r> {
    /// Borrow the five columns of a row. Returns the actual column count when
    /// the row has the wrong shape.
    pub fn from_byte_record(record: &'r ByteRecord) -> Result<InputRecord<'r>, usize> {
        if record.len() != INPUT_COLUMNS {
            return Err(record.len());
        }
        Ok(InputRecord {
            doi: &record[0],
            mag_title: &record[1],
            crossref_title: &record[2],
            mag_abstract: &record[3],
            crossref_abstract: &record[4],
        })
    }
}

/// The cleaned text chosen for a row.
#[derive(Debug, PartialEq)]
pub struct PreparedText {
    pub title: String,
    /// Title and abstract joined; empty when neither survived normalization.
    pub text: String,
}

pub fn preprocess(record: &InputRecord) -> PreparedText {
    let mag_title = normalize_bytes(Some(record.mag_title));
    let crossref_title = normalize_bytes(Some(record.crossref_title));
    let mag_abstract = normalize_bytes(Some(record.mag_abstract));
    let crossref_abstract = normalize_bytes(Some(record.crossref_abstract));

    let title = pick_longer(mag_title, crossref_title);
    let abstract_text = pick_longer(mag_abstract, crossref_abstract);
    let text = combine(&title, &abstract_text);
    PreparedText { title, text }
}

// The Crossref candidate wins unless the MAG one is strictly longer.
fn pick_longer(mag: String, crossref: String) -> String {
    if mag.chars().count() > crossref.chars().count() {
        mag
    } else {
        crossref
    }
}

fn combine(title: &str, abstract_text: &str) -> String {
    [title, abstract_text]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<&str>>()
        .join(" ")
        .trim()
        .to_string()
}

/// One row of an output archive. `None` fields are written as empty cells.
#[derive(Debug, Serialize, PartialEq)]
pub struct OutputRecord {
    pub doi: String,
    pub title: Option<String>,
    pub language: Option<String>,
    pub score: Option<f32>,
}

impl OutputRecord {
    pub fn unclassified(doi: &[u8], title: String) -> OutputRecord {
        OutputRecord {
            doi: decode_utf8(doi),
            title: if title.is_empty() { None } else { Some(title) },
            language: None,
            score: None,
        }
    }
}
