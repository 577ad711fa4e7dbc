use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use csv::{ByteRecord, ReaderBuilder, WriterBuilder};
use thousands::Separable;

use crate::classifier::{ClassifierLoader, LanguageClassifier};
use crate::io::{discard_output, finalize_output, finish_gz_writer, prepare_output, GzFileStream};
use crate::record::{preprocess, InputRecord, OutputRecord, INPUT_COLUMNS, OUTPUT_HEADER};

// A job is a unit of work for the runner.
// It reads one input archive and writes one output archive with the same file name.
#[derive(Debug, Clone)]
pub struct ArchiveJob {
    pub input: PathBuf,
    pub output: PathBuf,
}

impl ArchiveJob {
    pub fn new(input: PathBuf, output_dir: &Path) -> Result<ArchiveJob> {
        let file_name = input
            .file_name()
            .with_context(|| format!("Input path {} has no file name", input.display()))?;
        let output = output_dir.join(file_name);
        Ok(ArchiveJob { input, output })
    }

    // Load a classifier for this job only, then process the archive.
    pub fn run<L: ClassifierLoader>(&self, loader: &L) -> Result<ArchiveReport> {
        let classifier = loader
            .load()
            .with_context(|| format!("Failed to load classifier for {}", self.input.display()))?;
        process_archive(&self.input, &self.output, &classifier)
    }
}

/// Row counters for one processed archive.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ArchiveReport {
    pub rows_read: usize,
    pub rows_written: usize,
    pub rows_classified: usize,
    pub rows_skipped: usize,
}

impl fmt::Display for ArchiveReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} rows written, {} classified, {} skipped",
            self.rows_written.separate_with_commas(),
            self.rows_classified.separate_with_commas(),
            self.rows_skipped.separate_with_commas()
        )
    }
}

/// Predict languages for every row of `input` and write them to `output`.
///
/// The output is staged next to its destination and only moved into place
/// once the whole archive has been written; on error nothing is left behind.
pub fn process_archive<C: LanguageClassifier>(
    input: &Path,
    output: &Path,
    classifier: &C,
) -> Result<ArchiveReport> {
    match write_predictions(input, output, classifier) {
        Ok(report) => {
            finalize_output(output)
                .with_context(|| format!("Failed to move {} into place", output.display()))?;
            Ok(report)
        }
        Err(e) => {
            if let Err(cleanup) = discard_output(output) {
                log::warn!(
                    "Could not remove partial output for {}: {}",
                    output.display(),
                    cleanup
                );
            }
            Err(e)
        }
    }
}

fn write_predictions<C: LanguageClassifier>(
    input: &Path,
    output: &Path,
    classifier: &C,
) -> Result<ArchiveReport> {
    let staged = prepare_output(output)?;
    log::debug!("Writing {} via {}", input.display(), staged.display());

    let reader = GzFileStream::new(input.to_path_buf(), None, None)
        .reader()
        .with_context(|| format!("Failed to open {}", input.display()))?;
    let mut csv_reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);

    let writer = GzFileStream::new(staged.clone(), None, None)
        .writer()
        .with_context(|| format!("Failed to create {}", staged.display()))?;
    let mut csv_writer = WriterBuilder::new().has_headers(false).from_writer(writer);
    csv_writer.write_record(OUTPUT_HEADER)?;

    let mut report = ArchiveReport::default();
    let mut record = ByteRecord::new();
    loop {
        match csv_reader.read_byte_record(&mut record) {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) if matches!(e.kind(), csv::ErrorKind::Io(_)) => {
                return Err(e).with_context(|| format!("Failed to read {}", input.display()));
            }
            Err(e) => {
                report.rows_read += 1;
                report.rows_skipped += 1;
                log::warn!("Skipping malformed row in {}: {}", input.display(), e);
                continue;
            }
        }
        report.rows_read += 1;
        let line = record.position().map_or(0, |position| position.line());

        let row = match InputRecord::from_byte_record(&record) {
            Ok(row) => row,
            Err(columns) => {
                report.rows_skipped += 1;
                log::warn!(
                    "Skipping line {} of {}: expected {} columns, found {}",
                    line,
                    input.display(),
                    INPUT_COLUMNS,
                    columns
                );
                continue;
            }
        };

        let prepared = preprocess(&row);
        let mut result = OutputRecord::unclassified(row.doi, prepared.title);
        if !prepared.text.is_empty() {
            let prediction = classifier.predict(&prepared.text).with_context(|| {
                format!("Failed to classify line {} of {}", line, input.display())
            })?;
            result.language = Some(prediction.language);
            result.score = Some(prediction.score);
            report.rows_classified += 1;
        }
        csv_writer.serialize(&result)?;
        report.rows_written += 1;
    }

    let writer = csv_writer.into_inner().map_err(|e| e.into_error())?;
    finish_gz_writer(writer).with_context(|| format!("Failed to finish {}", staged.display()))?;
    Ok(report)
}

#[cfg(test)]
mod archive_tests {
    use super::*;
    use crate::classifier::Prediction;
    use anyhow::bail;
    use std::io::Write;

    struct FixedClassifier;

    impl LanguageClassifier for FixedClassifier {
        fn predict(&self, text: &str) -> Result<Prediction> {
            let language = if text.contains("Resumen") { "es" } else { "en" };
            Ok(Prediction {
                language: language.to_string(),
                score: 0.5,
            })
        }
    }

    struct BrokenClassifier;

    impl LanguageClassifier for BrokenClassifier {
        fn predict(&self, _text: &str) -> Result<Prediction> {
            bail!("model exploded")
        }
    }

    fn write_archive(path: &Path, contents: &str) {
        let mut writer = GzFileStream::new(path.to_path_buf(), None, None)
            .writer()
            .unwrap();
        writer.write_all(contents.as_bytes()).unwrap();
        finish_gz_writer(writer).unwrap();
    }

    fn read_archive(path: &Path) -> Vec<Vec<String>> {
        let reader = GzFileStream::new(path.to_path_buf(), None, None)
            .reader()
            .unwrap();
        ReaderBuilder::new()
            .has_headers(false)
            .from_reader(reader)
            .records()
            .map(|record| record.unwrap().iter().map(String::from).collect())
            .collect()
    }

    #[test]
    fn test_process_sample_archive() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("sample.csv.gz");
        let input = PathBuf::from("tests/data/archives/sample.csv.gz");

        let report = process_archive(&input, &output, &FixedClassifier).unwrap();
        assert_eq!(
            report,
            ArchiveReport {
                rows_read: 4,
                rows_written: 4,
                rows_classified: 3,
                rows_skipped: 0
            }
        );

        let rows = read_archive(&output);
        assert_eq!(rows[0], vec!["doi", "title", "language", "score"]);
        assert_eq!(
            rows[1],
            vec!["10.1234/one", "Exploring the Mysteries of Cannabis", "en", "0.5"]
        );
        assert_eq!(rows[2], vec!["10.1234/two", "", "", ""]);
        assert_eq!(
            rows[3],
            vec!["10.1234/three", "Uber die Kernspaltung!", "en", "0.5"]
        );
        assert_eq!(rows[4], vec!["10.1234/four", "", "es", "0.5"]);
        assert_eq!(rows.len(), 5);
        assert!(!prepare_output(&output).unwrap().exists());
    }

    #[test]
    fn test_header_only_archive() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.csv.gz");
        let output = dir.path().join("out.csv.gz");
        write_archive(
            &input,
            "doi,mag_title,crossref_title,mag_abstract,crossref_abstract\n",
        );

        let report = process_archive(&input, &output, &FixedClassifier).unwrap();
        assert_eq!(report, ArchiveReport::default());
        assert_eq!(read_archive(&output), vec![vec!["doi", "title", "language", "score"]]);
    }

    #[test]
    fn test_malformed_rows_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.csv.gz");
        let output = dir.path().join("out.csv.gz");
        write_archive(
            &input,
            "doi,mag_title,crossref_title,mag_abstract,crossref_abstract\n\
             10.1/short,only,three\n\
             10.1/ok,A title,,,\n",
        );

        let report = process_archive(&input, &output, &FixedClassifier).unwrap();
        assert_eq!(report.rows_read, 2);
        assert_eq!(report.rows_skipped, 1);
        assert_eq!(report.rows_written, 1);

        let rows = read_archive(&output);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1], vec!["10.1/ok", "A title", "en", "0.5"]);
    }

    #[test]
    fn test_classifier_failure_leaves_no_output() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("sample.csv.gz");
        let input = PathBuf::from("tests/data/archives/sample.csv.gz");

        let err = process_archive(&input, &output, &BrokenClassifier).unwrap_err();
        assert!(format!("{:#}", err).contains("model exploded"));
        assert!(!output.exists());
        assert!(!prepare_output(&output).unwrap().exists());
    }

    #[test]
    fn test_corrupt_archive_fails() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.csv.gz");
        let output = dir.path().join("out.csv.gz");
        std::fs::write(&input, b"doi,title\nnot gzip at all\n").unwrap();

        assert!(process_archive(&input, &output, &FixedClassifier).is_err());
        assert!(!output.exists());
    }

    #[test]
    fn test_rerun_overwrites_output() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("sample.csv.gz");
        let input = PathBuf::from("tests/data/archives/sample.csv.gz");
        std::fs::write(&output, b"stale").unwrap();

        process_archive(&input, &output, &FixedClassifier).unwrap();
        assert_eq!(read_archive(&output).len(), 5);
    }

    #[test]
    fn test_job_output_keeps_file_name() {
        let job = ArchiveJob::new(PathBuf::from("/data/in/part-0007.csv.gz"), Path::new("/data/out")).unwrap();
        assert_eq!(job.output, PathBuf::from("/data/out/part-0007.csv.gz"));
        assert!(ArchiveJob::new(PathBuf::from("/"), Path::new("/data/out")).is_err());
    }
}
