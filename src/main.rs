use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use predict_language::runner::runner_config::{RunnerConfig, DEFAULT_FILE_PATTERN};
use predict_language::RunSummary;

fn existing_dir(s: &str) -> Result<PathBuf, String> {
    let path = PathBuf::from(s);
    if path.is_dir() {
        Ok(path)
    } else {
        Err(format!("{} is not an existing directory", s))
    }
}

/// Predict the language of titles and abstracts in gzipped CSV archives
#[derive(Parser, Debug)]
#[command(name = "predict-language", version, about, long_about = None)]
struct Args {
    /// Directory containing the input archives
    #[arg(value_parser = existing_dir)]
    input_path: PathBuf,

    /// Directory the labeled archives are written to
    #[arg(value_parser = existing_dir)]
    output_path: PathBuf,

    /// The file pattern to use when searching for files
    #[arg(long, default_value = DEFAULT_FILE_PATTERN)]
    file_pattern: String,

    /// fastText language identification model, e.g. lid.176.bin
    #[arg(long, env = "PREDICT_LANGUAGE_MODEL")]
    model_path: PathBuf,

    /// Number of archives processed in parallel; each loads its own copy of the model
    #[arg(long, default_value_t = num_cpus::get())]
    processes: usize,

    /// How long to wait for tasks between progress reports
    #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
    poll_interval: Duration,
}

impl Args {
    fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            file_pattern: self.file_pattern.clone(),
            processes: self.processes,
            poll_interval: self.poll_interval,
            ..RunnerConfig::new(self.input_path.clone(), self.output_path.clone())
        }
    }
}

#[cfg(feature = "fasttext")]
fn predict(args: &Args) -> Result<RunSummary> {
    use std::sync::Arc;

    use predict_language::classifier::FastTextLoader;

    if !args.model_path.is_file() {
        anyhow::bail!("Model file not found: {}", args.model_path.display());
    }
    let loader = Arc::new(FastTextLoader::new(args.model_path.clone()));
    predict_language::run(&args.runner_config(), loader)
}

#[cfg(not(feature = "fasttext"))]
fn predict(_args: &Args) -> Result<RunSummary> {
    anyhow::bail!("predict-language was built without the `fasttext` feature")
}

fn main() -> ExitCode {
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "predict_language=info");
    }
    env_logger::init();

    let args = Args::parse();
    match predict(&args) {
        Ok(summary) if summary.is_success() => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
