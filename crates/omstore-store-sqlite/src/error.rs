//! Error type for `omstore-store-sqlite`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("core error: {0}")]
  Core(#[from] omstore_core::Error),

  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("date/time parse error: {0}")]
  DateParse(String),

  /// Stored data that cannot be decoded back into the domain model.
  #[error("corrupt store: {0}")]
  Corrupt(String),
}

impl Error {
  pub fn is_validation(&self) -> bool {
    matches!(self, Self::Core(e) if e.is_validation())
  }

  pub fn is_unsupported_filter(&self) -> bool {
    matches!(self, Self::Core(e) if e.is_unsupported_filter())
  }

  pub fn is_decimation_unsupported(&self) -> bool {
    matches!(self, Self::Core(e) if e.is_decimation_unsupported())
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
