//! Language identification seam.
//!
//! Archive jobs only see [`LanguageClassifier`]; which model backs it is
//! decided by the [`ClassifierLoader`] handed to the runner. Each job loads
//! its own classifier on its worker thread.

use anyhow::Result;

/// Length of the `__label__` prefix fastText puts in front of every label.
pub const LABEL_PREFIX_LEN: usize = 9;

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub language: String,
    pub score: f32,
}

impl Prediction {
    /// Build a prediction from a raw model label and probability.
    pub fn from_label(label: &str, prob: f32) -> Prediction {
        Prediction {
            language: strip_label_prefix(label),
            // softmax output can overshoot 1.0 by a rounding error
            score: prob.min(1.0),
        }
    }
}

pub trait LanguageClassifier {
    /// Most likely language for a non-empty, normalized text.
    fn predict(&self, text: &str) -> Result<Prediction>;
}

pub trait ClassifierLoader: Send + Sync + 'static {
    type Classifier: LanguageClassifier;

    fn load(&self) -> Result<Self::Classifier>;
}

pub fn strip_label_prefix(label: &str) -> String {
    label.chars().skip(LABEL_PREFIX_LEN).collect()
}

#[cfg(feature = "fasttext")]
pub use self::fasttext_model::{FastTextClassifier, FastTextLoader};

#[cfg(feature = "fasttext")]
pub mod fasttext_model {
    use std::path::PathBuf;

    use anyhow::{anyhow, bail, Result};
    use fasttext::FastText;

    use super::{ClassifierLoader, LanguageClassifier, Prediction};

    pub struct FastTextClassifier {
        model: FastText,
    }

    impl LanguageClassifier for FastTextClassifier {
        fn predict(&self, text: &str) -> Result<Prediction> {
            let predictions = self
                .model
                .predict(text, 1, 0.0)
                .map_err(|e| anyhow!("fastText prediction failed: {}", e))?;
            let top = predictions
                .into_iter()
                .next()
                .ok_or_else(|| anyhow!("fastText returned no prediction"))?;
            Ok(Prediction::from_label(&top.label, top.prob))
        }
    }

    /// Loads a fastText language-identification model such as `lid.176.bin`.
    #[derive(Clone)]
    pub struct FastTextLoader {
        pub model_path: PathBuf,
    }

    impl FastTextLoader {
        pub fn new(model_path: PathBuf) -> Self {
            Self { model_path }
        }
    }

    impl ClassifierLoader for FastTextLoader {
        type Classifier = FastTextClassifier;

        fn load(&self) -> Result<FastTextClassifier> {
            if !self.model_path.is_file() {
                bail!("Model file not found: {}", self.model_path.display());
            }
            let path = self
                .model_path
                .to_str()
                .ok_or_else(|| anyhow!("Model path {:?} is not valid UTF-8", self.model_path))?;
            let mut model = FastText::new();
            model
                .load_model(path)
                .map_err(|e| anyhow!("Failed to load model {}: {}", path, e))?;
            Ok(FastTextClassifier { model })
        }
    }
}

#[cfg(test)]
mod classifier_tests {
    use super::*;

    #[test]
    fn test_strip_label_prefix() {
        assert_eq!(strip_label_prefix("__label__en"), "en");
        assert_eq!(strip_label_prefix("__label__zh-Hans"), "zh-Hans");
        assert_eq!(strip_label_prefix("__label__"), "");
        assert_eq!(strip_label_prefix("short"), "");
    }

    #[test]
    fn test_prediction_from_label() {
        let prediction = Prediction::from_label("__label__de", 0.73);
        assert_eq!(prediction.language, "de");
        assert_eq!(prediction.score, 0.73);

        assert_eq!(Prediction::from_label("__label__en", 1.00001).score, 1.0);
        assert_eq!(Prediction::from_label("__label__en", 1.0).score, 1.0);
    }

    #[cfg(feature = "fasttext")]
    #[test]
    fn test_missing_model_fails_to_load() {
        let loader = FastTextLoader::new(std::path::PathBuf::from("tests/data/no-such-model.bin"));
        assert!(loader.load().is_err());
    }
}
