//! Query parameters and result shapes of the store's read operations.

use serde::{Deserialize, Serialize};

use crate::{
  filter::Filter,
  observation::{ComplexResult, MeasureResult},
  snapshot::ObservationHeader,
  time::TemporalExtent,
};

// ─── Observations ────────────────────────────────────────────────────────────

#[derive(
  Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EntityKind {
  #[default]
  Observation,
  Measurement,
}

#[derive(
  Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ResponseMode {
  /// Full data.
  #[default]
  Inline,
  /// One data-less template per procedure.
  ResultTemplate,
}

/// Parameters of `get_observations`, `get_identifiers` and `get_count`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservationQuery {
  pub entity:                        EntityKind,
  pub mode:                          ResponseMode,
  pub filter:                        Option<Filter>,
  pub limit:                         Option<usize>,
  pub offset:                        usize,
  pub include_foi_in_template:       bool,
  pub include_time_in_template:      bool,
  pub include_quality_fields:        bool,
  pub include_parameter_fields:      bool,
  /// Keep every profile its own observation. When unset, the profiles of a
  /// procedure and feature are returned as one observation with a time column.
  pub separated_profile_observation: bool,
  /// One measurement per (row, field). When unset, one per row.
  pub separated_measure:             bool,
}

impl Default for ObservationQuery {
  fn default() -> Self {
    Self {
      entity:                        EntityKind::Observation,
      mode:                          ResponseMode::Inline,
      filter:                        None,
      limit:                         None,
      offset:                        0,
      include_foi_in_template:       true,
      include_time_in_template:      false,
      include_quality_fields:        true,
      include_parameter_fields:      true,
      separated_profile_observation: true,
      separated_measure:             true,
    }
  }
}

impl ObservationQuery {
  pub fn with_filter(filter: Filter) -> Self {
    Self { filter: Some(filter), ..Self::default() }
  }

  pub fn templates() -> Self {
    Self { mode: ResponseMode::ResultTemplate, ..Self::default() }
  }
}

// ─── Results ─────────────────────────────────────────────────────────────────

#[derive(
  Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::EnumString,
)]
pub enum ResultFormat {
  /// Header line, then one comma-separated line per row.
  #[default]
  #[serde(rename = "csv")]
  #[strum(serialize = "csv")]
  Csv,
  /// One `time,procedure,field,value,unit` line per non-null value.
  #[serde(rename = "text/csv-flat")]
  #[strum(serialize = "text/csv-flat", serialize = "csv-flat")]
  CsvFlat,
  #[serde(rename = "count")]
  #[strum(serialize = "count")]
  Count,
  #[serde(rename = "data-array")]
  #[strum(serialize = "data-array")]
  DataArray,
}

/// Parameters of `get_results`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultQuery {
  pub procedure:                String,
  #[serde(default)]
  pub filter:                   Option<Filter>,
  #[serde(default)]
  pub format:                   ResultFormat,
  #[serde(default)]
  pub entity:                   EntityKind,
  /// Target point count.
  #[serde(default)]
  pub decimation:               Option<usize>,
  #[serde(default)]
  pub include_id_in_data_block: bool,
  #[serde(default)]
  pub include_time_for_profile: bool,
  #[serde(default = "yes")]
  pub include_quality_fields:   bool,
  #[serde(default = "yes")]
  pub include_parameter_fields: bool,
}

fn yes() -> bool { true }

impl ResultQuery {
  pub fn new(procedure: impl Into<String>) -> Self {
    Self {
      procedure:                procedure.into(),
      filter:                   None,
      format:                   ResultFormat::default(),
      entity:                   EntityKind::default(),
      decimation:               None,
      include_id_in_data_block: false,
      include_time_for_profile: false,
      include_quality_fields:   true,
      include_parameter_fields: true,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResultSet {
  /// `csv` and `text/csv-flat`.
  Text { content: String, row_count: usize },
  Count { count: usize },
  /// A matrix, leading `id` and `time` columns included when requested.
  DataArray { result: ComplexResult },
  /// One entry per measurement, for measurement entities.
  Measures { measures: Vec<MeasureResult> },
}

// ─── Entities ────────────────────────────────────────────────────────────────

/// Parameters of the entity listings (phenomena, procedures, features,
/// offerings).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityQuery {
  pub filter: Option<Filter>,
  pub limit:  Option<usize>,
  pub offset: usize,
}

impl EntityQuery {
  pub fn with_filter(filter: Filter) -> Self {
    Self { filter: Some(filter), ..Self::default() }
  }
}

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  strum::Display,
  strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EntityType {
  Procedure,
  Phenomenon,
  Feature,
  Observation,
  Offering,
}

// ─── Datasets ────────────────────────────────────────────────────────────────

/// Selection for `remove_dataset` and `extract_results`. Empty lists select
/// everything along that axis.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetQuery {
  pub procedures: Vec<String>,
  pub features:   Vec<String>,
  pub time:       Option<TemporalExtent>,
}

impl DatasetQuery {
  pub fn is_empty(&self) -> bool {
    self.procedures.is_empty() && self.features.is_empty() && self.time.is_none()
  }

  pub fn for_procedure(id: impl Into<String>) -> Self {
    Self { procedures: vec![id.into()], ..Self::default() }
  }

  /// Whether the observation falls in the selection. A time selection only
  /// needs to intersect the observation; rows are trimmed separately.
  pub fn selects(&self, header: &ObservationHeader) -> bool {
    (self.procedures.is_empty() || self.procedures.contains(&header.procedure))
      && (self.features.is_empty()
        || header.feature.as_ref().is_some_and(|f| self.features.contains(f)))
      && self.time.is_none_or(|t| t.intersects(&header.extent))
  }
}

/// Apply offset and limit to an id-sorted list.
pub fn page<T>(items: Vec<T>, offset: usize, limit: usize) -> Vec<T> {
  items.into_iter().skip(offset).take(limit).collect()
}
