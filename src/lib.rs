//! Language prediction for scholarly metadata archives.
//!
//! Gzipped CSV archives of DOIs with titles and abstracts from two sources
//! are cleaned, classified with a language identification model and written
//! back out as `doi,title,language,score` archives, one job per archive.

pub mod archive;
pub mod classifier;
pub mod entities;
pub mod io;
pub mod normalize;
pub mod record;
pub mod runner;

pub use crate::normalize::normalize;
pub use crate::runner::runner_config::RunnerConfig;
pub use crate::runner::{run, RunSummary};
