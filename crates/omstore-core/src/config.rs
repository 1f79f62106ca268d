//! Store tuning knobs shared by every backend.

use serde::Deserialize;

use crate::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
  /// Maximum flat columns per physical measure table.
  pub max_fields_per_table: usize,
  /// Page size applied when a query carries no limit.
  pub default_limit:        usize,
}

impl Default for StoreConfig {
  fn default() -> Self {
    Self { max_fields_per_table: 10, default_limit: 1000 }
  }
}

impl StoreConfig {
  pub fn validate(&self) -> Result<()> {
    if self.max_fields_per_table == 0 {
      return Err(Error::validation("max_fields_per_table must be at least 1"));
    }
    Ok(())
  }
}
