use crate::assemble::AssemblyError;
use crate::config::ConfigError;
use crate::encode::EncodingError;
use crate::fit::FitError;
use crate::rank::RankError;
use crate::split::SplitError;
use polars::prelude::PolarsError;
use std::fmt;
use thiserror::Error;

/// The coarse failure category of a run, for callers that branch on cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Schema,
    InsufficientData,
    UnseenCategory,
    DegenerateTarget,
    Configuration,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Schema => "schema error",
            Self::InsufficientData => "insufficient data",
            Self::UnseenCategory => "unseen category",
            Self::DegenerateTarget => "degenerate target",
            Self::Configuration => "configuration error",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum ValueAddedError {
    #[error(transparent)]
    Assembly(#[from] AssemblyError),
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    #[error(transparent)]
    Fit(#[from] FitError),
    #[error(transparent)]
    Rank(#[from] RankError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<SplitError> for ValueAddedError {
    fn from(err: SplitError) -> Self {
        Self::Fit(FitError::Split(err))
    }
}

impl From<PolarsError> for ValueAddedError {
    fn from(err: PolarsError) -> Self {
        Self::Assembly(AssemblyError::PolarsError(err))
    }
}

impl ValueAddedError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Assembly(AssemblyError::InsufficientData { .. }) => ErrorKind::InsufficientData,
            Self::Assembly(_) => ErrorKind::Schema,
            Self::Encoding(EncodingError::UnseenCategory { .. }) => ErrorKind::UnseenCategory,
            Self::Encoding(_) => ErrorKind::Schema,
            Self::Fit(FitError::DegenerateTarget { .. }) => ErrorKind::DegenerateTarget,
            Self::Fit(FitError::Split(SplitError::EmptyPartition { .. })) => {
                ErrorKind::InsufficientData
            }
            Self::Fit(FitError::ShapeMismatch { .. } | FitError::SplitMismatch { .. }) => {
                ErrorKind::Schema
            }
            Self::Fit(_) => ErrorKind::Configuration,
            Self::Rank(_) => ErrorKind::Schema,
            Self::Config(_) => ErrorKind::Configuration,
        }
    }
}
