use mzdeisotope::deconv_traits::DeconvolutionError;
use thiserror::Error;

/// An error that might occur while quantifying feature groups.
///
/// Groups that fail a scoring gate are not errors, they are dropped silently.
#[derive(Debug, Error)]
pub enum QuantError {
    #[error("The deconvolution engine failed: {0}")]
    Deconvolution(#[from] DeconvolutionError),
    #[error("A deconvolution result referenced peak {index} at m/z {mz} which is not in its window")]
    DataConsistency { index: usize, mz: f64 },
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),
    #[error("Failed to load configuration: {0}")]
    Config(#[from] Box<figment::Error>),
    #[error("An IO error occurred: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to write report: {0}")]
    Csv(#[from] csv::Error),
}

impl From<figment::Error> for QuantError {
    fn from(value: figment::Error) -> Self {
        Self::Config(Box::new(value))
    }
}
