//! Field model: the description of one measured quantity and the values it
//! can take.
//!
//! A field's identity is its name. Its position in a procedure's field list is
//! significant: it decides the column a value lands in.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Field type ──────────────────────────────────────────────────────────────

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  Serialize,
  Deserialize,
  strum::Display,
  strum::EnumString,
  strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FieldType {
  Quantity,
  Text,
  Boolean,
  Time,
}

impl FieldType {
  pub fn is_numeric(self) -> bool { matches!(self, Self::Quantity) }

  /// Whether `value` may be stored in a column of this type. `Null` fits
  /// everywhere.
  pub fn accepts(self, value: &FieldValue) -> bool {
    matches!(
      (self, value),
      (_, FieldValue::Null)
        | (Self::Quantity, FieldValue::Number(_))
        | (Self::Text, FieldValue::Text(_))
        | (Self::Boolean, FieldValue::Boolean(_))
        | (Self::Time, FieldValue::Time(_))
    )
  }
}

// ─── Field ───────────────────────────────────────────────────────────────────

/// One measured quantity. Quality and parameter sub-fields are carried next to
/// the value and never nest further.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
  pub name:             String,
  pub field_type:       FieldType,
  #[serde(default)]
  pub label:            Option<String>,
  #[serde(default)]
  pub description:      Option<String>,
  #[serde(default)]
  pub unit:             Option<String>,
  #[serde(default)]
  pub quality_fields:   Vec<Field>,
  #[serde(default)]
  pub parameter_fields: Vec<Field>,
}

impl Field {
  pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
    Self {
      name: name.into(),
      field_type,
      label: None,
      description: None,
      unit: None,
      quality_fields: Vec::new(),
      parameter_fields: Vec::new(),
    }
  }

  pub fn quantity(name: impl Into<String>) -> Self {
    Self::new(name, FieldType::Quantity)
  }

  pub fn time(name: impl Into<String>) -> Self { Self::new(name, FieldType::Time) }

  pub fn text(name: impl Into<String>) -> Self { Self::new(name, FieldType::Text) }

  pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
    self.unit = Some(unit.into());
    self
  }

  pub fn with_label(mut self, label: impl Into<String>) -> Self {
    self.label = Some(label.into());
    self
  }

  pub fn with_quality(mut self, quality: Field) -> Self {
    self.quality_fields.push(quality);
    self
  }

  pub fn with_parameter(mut self, parameter: Field) -> Self {
    self.parameter_fields.push(parameter);
    self
  }

  /// Number of physical columns this field occupies: the value, then each
  /// quality sub-field, then each parameter sub-field.
  pub fn flat_width(&self) -> usize {
    1 + self.quality_fields.len() + self.parameter_fields.len()
  }

  /// The types of the flat columns, in storage order.
  pub fn flat_types(&self) -> Vec<FieldType> {
    std::iter::once(self.field_type)
      .chain(self.quality_fields.iter().map(|q| q.field_type))
      .chain(self.parameter_fields.iter().map(|p| p.field_type))
      .collect()
  }

  /// Column labels used by flat text outputs.
  pub fn flat_names(&self) -> Vec<String> {
    std::iter::once(self.name.clone())
      .chain(
        self
          .quality_fields
          .iter()
          .map(|q| format!("{}_quality_{}", self.name, q.name)),
      )
      .chain(
        self
          .parameter_fields
          .iter()
          .map(|p| format!("{}_parameter_{}", self.name, p.name)),
      )
      .collect()
  }

  pub fn quality_index(&self, name: &str) -> Option<usize> {
    self.quality_fields.iter().position(|q| q.name == name)
  }

  /// A copy with the requested sub-field families removed.
  pub fn restricted(&self, keep_quality: bool, keep_parameters: bool) -> Field {
    let mut field = self.clone();
    if !keep_quality {
      field.quality_fields.clear();
    }
    if !keep_parameters {
      field.parameter_fields.clear();
    }
    field
  }
}

// ─── Values ──────────────────────────────────────────────────────────────────

/// A single cell of a result row. `Null` stands for an absent (or NaN) value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
  #[default]
  Null,
  Boolean(bool),
  Number(f64),
  Time(DateTime<Utc>),
  Text(String),
}

impl FieldValue {
  /// Numbers are normalised so NaN is never stored.
  pub fn number(v: f64) -> Self {
    if v.is_nan() { Self::Null } else { Self::Number(v) }
  }

  pub fn is_null(&self) -> bool { matches!(self, Self::Null) }

  /// Numeric projection used for bucketing: numbers as-is, times as epoch
  /// milliseconds.
  pub fn as_f64(&self) -> Option<f64> {
    match self {
      Self::Number(v) => Some(*v),
      Self::Time(t) => Some(t.timestamp_millis() as f64),
      _ => None,
    }
  }

  pub fn as_time(&self) -> Option<DateTime<Utc>> {
    match self {
      Self::Time(t) => Some(*t),
      _ => None,
    }
  }

  /// Text rendering used by CSV output and `like` matching. Null renders as
  /// the empty string.
  pub fn render(&self) -> String {
    match self {
      Self::Null => String::new(),
      Self::Boolean(b) => b.to_string(),
      Self::Number(v) => v.to_string(),
      Self::Time(t) => crate::time::format_instant(*t),
      Self::Text(s) => s.clone(),
    }
  }

  /// Order two values of compatible kinds. Text is coerced when the other side
  /// is a number or a time.
  pub fn compare(&self, other: &FieldValue) -> Option<Ordering> {
    use FieldValue::*;
    match (self, other) {
      (Number(a), Number(b)) => a.partial_cmp(b),
      (Time(a), Time(b)) => Some(a.cmp(b)),
      (Text(a), Text(b)) => Some(a.cmp(b)),
      (Boolean(a), Boolean(b)) => Some(a.cmp(b)),
      (Number(a), Text(b)) => b.trim().parse::<f64>().ok().and_then(|b| a.partial_cmp(&b)),
      (Text(a), Number(b)) => a.trim().parse::<f64>().ok().and_then(|a| a.partial_cmp(b)),
      (Time(a), Text(b)) => crate::time::parse_instant(b).map(|b| a.cmp(&b)),
      (Text(a), Time(b)) => crate::time::parse_instant(a).map(|a| a.cmp(b)),
      (Boolean(a), Text(b)) => b.parse::<bool>().ok().map(|b| a.cmp(&b)),
      _ => None,
    }
  }
}

// ─── Main key ────────────────────────────────────────────────────────────────

/// A totally-ordered wrapper over the main (indexing) value of a row: a time
/// for timeseries, a depth for profiles.
#[derive(Debug, Clone, PartialEq)]
pub struct MainKey(pub FieldValue);

impl MainKey {
  fn rank(&self) -> u8 {
    match self.0 {
      FieldValue::Null => 0,
      FieldValue::Boolean(_) => 1,
      FieldValue::Number(_) => 2,
      FieldValue::Time(_) => 3,
      FieldValue::Text(_) => 4,
    }
  }
}

impl Eq for MainKey {}

impl PartialOrd for MainKey {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}

impl Ord for MainKey {
  fn cmp(&self, other: &Self) -> Ordering {
    use FieldValue::*;
    match (&self.0, &other.0) {
      (Number(a), Number(b)) => a.total_cmp(b),
      (Time(a), Time(b)) => a.cmp(b),
      (Text(a), Text(b)) => a.cmp(b),
      (Boolean(a), Boolean(b)) => a.cmp(b),
      _ => self.rank().cmp(&other.rank()),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn nan_is_absent() {
    assert!(FieldValue::number(f64::NAN).is_null());
    assert_eq!(FieldValue::number(1.5), FieldValue::Number(1.5));
  }

  #[test]
  fn flat_layout_orders_value_quality_parameters() {
    let field = Field::quantity("temp")
      .with_quality(Field::text("qflag"))
      .with_parameter(Field::quantity("gain"));
    assert_eq!(field.flat_width(), 3);
    assert_eq!(
      field.flat_names(),
      ["temp", "temp_quality_qflag", "temp_parameter_gain"]
    );
    assert_eq!(
      field.flat_types(),
      [FieldType::Quantity, FieldType::Text, FieldType::Quantity]
    );
  }

  #[test]
  fn numbers_render_without_trailing_zero() {
    assert_eq!(FieldValue::Number(12.0).render(), "12");
    assert_eq!(FieldValue::Number(0.25).render(), "0.25");
  }

  #[test]
  fn text_coerces_against_numbers() {
    let v = FieldValue::Number(10.0);
    assert_eq!(v.compare(&FieldValue::Text("9.5".into())), Some(Ordering::Greater));
    assert_eq!(v.compare(&FieldValue::Text("abc".into())), None);
  }

  #[test]
  fn type_acceptance() {
    assert!(FieldType::Quantity.accepts(&FieldValue::Number(1.0)));
    assert!(FieldType::Text.accepts(&FieldValue::Null));
    assert!(!FieldType::Boolean.accepts(&FieldValue::Text("x".into())));
  }
}
