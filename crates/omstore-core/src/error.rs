//! Error types for `omstore-core`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  /// A malformed write: no fields, unknown procedure reference, or a field
  /// whose type disagrees with the column it was placed in.
  #[error("validation error: {0}")]
  Validation(String),

  /// A filter combination with no defined semantics.
  #[error("unsupported filter: {0}")]
  UnsupportedFilter(String),

  #[error("decimation unsupported: {0}")]
  DecimationUnsupported(String),

  #[error("invalid property path: {0:?}")]
  InvalidPropertyPath(String),

  #[error("geometry error: {0}")]
  Geometry(String),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

impl Error {
  pub(crate) fn validation(msg: impl Into<String>) -> Self {
    Self::Validation(msg.into())
  }

  pub fn is_validation(&self) -> bool { matches!(self, Self::Validation(_)) }

  pub fn is_unsupported_filter(&self) -> bool {
    matches!(self, Self::UnsupportedFilter(_) | Self::InvalidPropertyPath(_))
  }

  pub fn is_decimation_unsupported(&self) -> bool {
    matches!(self, Self::DecimationUnsupported(_))
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
