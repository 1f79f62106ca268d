//! Procedures: the sensors (or processes) that produce observations.
//!
//! A procedure is created on its first write and destroyed once its last
//! observation is removed. It owns the ordered list of fields it has ever
//! recorded and its location history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Properties, field::Field, geometry::Geometry};

#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  strum::Display,
  strum::EnumString,
  strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SensorType {
  #[default]
  System,
  Component,
}

/// How the rows of a procedure's observations are indexed.
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
  strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ObservationShape {
  /// Rows indexed by time.
  Timeseries,
  /// Rows indexed by a vertical quantity (depth, pressure) at one instant.
  Profile,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalLocation {
  pub time:     DateTime<Utc>,
  pub geometry: Geometry,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Procedure {
  pub id:          String,
  pub name:        Option<String>,
  pub description: Option<String>,
  pub sensor_type: SensorType,
  pub shape:       ObservationShape,
  pub properties:  Properties,
  /// Main field first, then every measured field in placement order.
  pub fields:      Vec<Field>,
  /// Id of the phenomenon covering every measured field.
  pub phenomenon:  Option<String>,
  /// Ordered by time.
  pub locations:   Vec<HistoricalLocation>,
}

impl Procedure {
  pub fn main_field(&self) -> Option<&Field> { self.fields.first() }

  pub fn measured_fields(&self) -> &[Field] {
    self.fields.get(1..).unwrap_or_default()
  }

  pub fn is_profile(&self) -> bool { self.shape == ObservationShape::Profile }

  /// Name of the main field when it is itself a measured phenomenon
  /// component, which is the case for profiles only.
  pub fn main_component(&self) -> Option<&str> {
    if self.is_profile() {
      self.main_field().map(|f| f.name.as_str())
    } else {
      None
    }
  }

  pub fn last_location(&self) -> Option<&HistoricalLocation> { self.locations.last() }

  /// The offering published for this procedure.
  pub fn offering_id(&self) -> String { offering_id(&self.id) }
}

pub fn offering_id(procedure_id: &str) -> String { format!("offering-{procedure_id}") }
