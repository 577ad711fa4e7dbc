use std::any::Any;
use std::fs::File;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use glob::{glob_with, MatchOptions, Pattern};
use thousands::Separable;
use threadpool::ThreadPool;

use crate::archive::{ArchiveJob, ArchiveReport};
use crate::classifier::ClassifierLoader;

use runner_config::*;

struct JobOutcome {
    job: ArchiveJob,
    result: Result<ArchiveReport>,
}

/// What happened to every archive of a run.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub succeeded: Vec<(PathBuf, ArchiveReport)>,
    pub failed: Vec<(PathBuf, String)>,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn finished(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    fn record(&mut self, outcome: JobOutcome) {
        match outcome.result {
            Ok(report) => {
                log::info!("Finished task: {} ({})", outcome.job.input.display(), report);
                self.succeeded.push((outcome.job.input, report));
            }
            Err(e) => {
                log::error!("Failed task: {}: {:#}", outcome.job.input.display(), e);
                self.failed.push((outcome.job.input, format!("{:#}", e)));
            }
        }
    }
}

pub fn run<L: ClassifierLoader>(config: &RunnerConfig, loader: Arc<L>) -> Result<RunSummary> {
    let start = Instant::now();
    validate_directories(config)?;

    let archives = find_archives(&config.input_dir, &config.file_pattern)?;
    let jobs = archives
        .into_iter()
        .map(|input| ArchiveJob::new(input, &config.output_dir))
        .collect::<Result<Vec<ArchiveJob>>>()?;
    let total = jobs.len();
    log::info!(
        "Found {} archives matching {:?} in {}",
        total.separate_with_commas(),
        config.file_pattern,
        config.input_dir.display()
    );

    let threadpool = ThreadPool::new(config.processes.max(1));
    let (sender, receiver) = mpsc::channel();
    for job in jobs {
        log::info!("Creating task: {}", job.input.display());
        let sender = sender.clone();
        let loader = loader.clone();
        threadpool.execute(move || {
            log::info!("Running task: {}", job.input.display());
            let result = panic::catch_unwind(AssertUnwindSafe(|| job.run(loader.as_ref())))
                .unwrap_or_else(|payload| Err(anyhow!("Task panicked: {}", panic_message(&*payload))));
            // the receiver only goes away when the runner has already given up
            let _ = sender.send(JobOutcome { job, result });
        });
    }
    drop(sender);

    let mut summary = collect_outcomes(receiver, total, config.poll_interval)?;
    threadpool.join();
    summary.elapsed = start.elapsed();

    let rows: usize = summary
        .succeeded
        .iter()
        .map(|(_, report)| report.rows_written)
        .sum();
    if summary.is_success() {
        log::info!(
            "Complete: {} archives, {} rows in {}",
            summary.succeeded.len().separate_with_commas(),
            rows.separate_with_commas(),
            humantime::format_duration(Duration::from_secs(summary.elapsed.as_secs()))
        );
    } else {
        log::error!(
            "Complete with errors: {} archives succeeded, {} failed",
            summary.succeeded.len().separate_with_commas(),
            summary.failed.len().separate_with_commas()
        );
        for (path, error) in summary.failed.iter() {
            log::error!("  {}: {}", path.display(), error);
        }
    }
    Ok(summary)
}

// Wait for completions in rounds of at most `poll_interval`, logging progress after each round.
fn collect_outcomes(
    receiver: Receiver<JobOutcome>,
    total: usize,
    poll_interval: Duration,
) -> Result<RunSummary> {
    let mut summary = RunSummary::default();
    let mut waiting = total;
    while waiting > 0 {
        let deadline = Instant::now() + poll_interval;
        while waiting > 0 {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match receiver.recv_timeout(deadline - now) {
                Ok(outcome) => {
                    waiting -= 1;
                    summary.record(outcome);
                }
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => {
                    bail!("Worker pool stopped with {} tasks still waiting", waiting)
                }
            }
        }
        log::info!(
            "Tasks finished: {}, tasks waiting: {}.",
            summary.finished(),
            waiting
        );
    }
    Ok(summary)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Input and output directories must exist, and the output must be writable,
/// before any job is submitted.
pub fn validate_directories(config: &RunnerConfig) -> Result<()> {
    if !config.input_dir.is_dir() {
        bail!(
            "Input directory does not exist: {}",
            config.input_dir.display()
        );
    }
    if !config.output_dir.is_dir() {
        bail!(
            "Output directory does not exist: {}",
            config.output_dir.display()
        );
    }
    let probe = config.output_dir.join(".predict-language-write-check");
    File::create(&probe).with_context(|| {
        format!(
            "Output directory is not writable: {}",
            config.output_dir.display()
        )
    })?;
    std::fs::remove_file(&probe)?;
    Ok(())
}

/// Files in `input_dir` whose names match `file_pattern`, sorted by path.
/// Hidden files only match when the pattern itself starts with a dot.
pub fn find_archives(input_dir: &Path, file_pattern: &str) -> Result<Vec<PathBuf>> {
    let dir = input_dir
        .to_str()
        .with_context(|| format!("Input directory {:?} is not valid UTF-8", input_dir))?;
    let pattern = PathBuf::from(Pattern::escape(dir)).join(file_pattern);
    let pattern = pattern.to_string_lossy();

    let options = MatchOptions {
        require_literal_leading_dot: true,
        ..MatchOptions::new()
    };
    let mut archives = Vec::new();
    for entry in glob_with(&pattern, options).with_context(|| format!("Invalid file pattern: {}", file_pattern))? {
        let path = entry?;
        if path.is_file() {
            archives.push(path);
        }
    }
    archives.sort();
    Ok(archives)
}

pub mod runner_config {
    use std::path::PathBuf;
    use std::time::Duration;

    pub const DEFAULT_FILE_PATTERN: &str = "*.csv.gz";
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

    #[derive(Clone, Debug)]
    pub struct RunnerConfig {
        pub input_dir: PathBuf,
        pub output_dir: PathBuf,
        // Glob matched against file names inside input_dir
        pub file_pattern: String,
        // Number of archives processed at once. Each one holds its own model in memory.
        pub processes: usize,
        // Upper bound on how long the runner waits before logging progress
        pub poll_interval: Duration,
    }

    impl RunnerConfig {
        pub fn new(input_dir: PathBuf, output_dir: PathBuf) -> RunnerConfig {
            RunnerConfig {
                input_dir,
                output_dir,
                file_pattern: DEFAULT_FILE_PATTERN.to_string(),
                processes: num_cpus::get(),
                poll_interval: DEFAULT_POLL_INTERVAL,
            }
        }
    }
}

#[cfg(test)]
mod runner_tests {
    use super::*;
    use crate::classifier::{LanguageClassifier, Prediction};

    struct EnglishLoader;
    struct English;

    impl LanguageClassifier for English {
        fn predict(&self, _text: &str) -> Result<Prediction> {
            Ok(Prediction {
                language: "en".to_string(),
                score: 1.0,
            })
        }
    }

    impl ClassifierLoader for EnglishLoader {
        type Classifier = English;

        fn load(&self) -> Result<English> {
            Ok(English)
        }
    }

    struct PanickingLoader;

    impl ClassifierLoader for PanickingLoader {
        type Classifier = English;

        fn load(&self) -> Result<English> {
            panic!("no model today")
        }
    }

    fn copy_sample(dir: &Path, name: &str) {
        std::fs::copy("tests/data/archives/sample.csv.gz", dir.join(name)).unwrap();
    }

    fn config(input: &Path, output: &Path) -> RunnerConfig {
        RunnerConfig {
            processes: 2,
            poll_interval: Duration::from_millis(50),
            ..RunnerConfig::new(input.to_path_buf(), output.to_path_buf())
        }
    }

    #[test]
    fn test_find_archives_matches_pattern() {
        let input = tempfile::tempdir().unwrap();
        copy_sample(input.path(), "b.csv.gz");
        copy_sample(input.path(), "a.csv.gz");
        std::fs::write(input.path().join("notes.txt"), b"ignore me").unwrap();
        std::fs::create_dir(input.path().join("dir.csv.gz")).unwrap();
        copy_sample(input.path(), ".partial.csv.gz");

        let found = find_archives(input.path(), DEFAULT_FILE_PATTERN).unwrap();
        assert_eq!(
            found,
            vec![input.path().join("a.csv.gz"), input.path().join("b.csv.gz")]
        );
        assert_eq!(find_archives(input.path(), "a*").unwrap().len(), 1);
        assert_eq!(
            find_archives(input.path(), ".*.csv.gz").unwrap(),
            vec![input.path().join(".partial.csv.gz")]
        );
        assert!(find_archives(input.path(), "[").is_err());
    }

    #[test]
    fn test_find_archives_escapes_directory() {
        let root = tempfile::tempdir().unwrap();
        let input = root.path().join("batch[1]");
        std::fs::create_dir(&input).unwrap();
        copy_sample(&input, "a.csv.gz");

        assert_eq!(find_archives(&input, "*.csv.gz").unwrap().len(), 1);
    }

    #[test]
    fn test_run_reports_every_archive() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        for i in 0..5 {
            copy_sample(input.path(), &format!("part-{:04}.csv.gz", i));
        }

        let summary = run(&config(input.path(), output.path()), Arc::new(EnglishLoader)).unwrap();
        assert!(summary.is_success());
        assert_eq!(summary.finished(), 5);
        for i in 0..5 {
            assert!(output.path().join(format!("part-{:04}.csv.gz", i)).exists());
        }
    }

    #[test]
    fn test_failed_archive_does_not_stop_others() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        copy_sample(input.path(), "good.csv.gz");
        std::fs::write(input.path().join("bad.csv.gz"), b"not gzip").unwrap();

        let summary = run(&config(input.path(), output.path()), Arc::new(EnglishLoader)).unwrap();
        assert!(!summary.is_success());
        assert_eq!(summary.succeeded.len(), 1);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].0, input.path().join("bad.csv.gz"));
        assert!(output.path().join("good.csv.gz").exists());
        assert!(!output.path().join("bad.csv.gz").exists());
    }

    #[test]
    fn test_panicking_job_is_reported() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        copy_sample(input.path(), "a.csv.gz");
        copy_sample(input.path(), "b.csv.gz");

        let summary = run(&config(input.path(), output.path()), Arc::new(PanickingLoader)).unwrap();
        assert_eq!(summary.failed.len(), 2);
        assert!(summary.failed[0].1.contains("no model today"));
    }

    #[test]
    fn test_missing_directories_are_fatal() {
        let existing = tempfile::tempdir().unwrap();
        let missing = existing.path().join("missing");

        assert!(run(&config(&missing, existing.path()), Arc::new(EnglishLoader)).is_err());
        assert!(run(&config(existing.path(), &missing), Arc::new(EnglishLoader)).is_err());
    }

    #[test]
    fn test_empty_input_directory() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();

        let summary = run(&config(input.path(), output.path()), Arc::new(EnglishLoader)).unwrap();
        assert!(summary.is_success());
        assert_eq!(summary.finished(), 0);
    }
}
