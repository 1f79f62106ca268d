//! The filter expression tree callers hand to queries.

use serde::{Deserialize, Serialize};

use crate::{field::FieldValue, time::TemporalExtent};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Literal {
  Boolean(bool),
  Number(f64),
  Text(String),
}

impl Literal {
  pub fn to_value(&self) -> FieldValue {
    match self {
      Self::Boolean(b) => FieldValue::Boolean(*b),
      Self::Number(n) => FieldValue::number(*n),
      Self::Text(s) => FieldValue::Text(s.clone()),
    }
  }
}

impl From<&str> for Literal {
  fn from(s: &str) -> Self { Self::Text(s.to_owned()) }
}

impl From<String> for Literal {
  fn from(s: String) -> Self { Self::Text(s) }
}

impl From<f64> for Literal {
  fn from(n: f64) -> Self { Self::Number(n) }
}

impl From<bool> for Literal {
  fn from(b: bool) -> Self { Self::Boolean(b) }
}

/// A parsed filter. Property names are resolved when the filter is compiled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Filter {
  Equal { property: String, value: Literal },
  NotEqual { property: String, value: Literal },
  Less { property: String, value: Literal },
  LessOrEqual { property: String, value: Literal },
  Greater { property: String, value: Literal },
  GreaterOrEqual { property: String, value: Literal },
  Like { property: String, pattern: String },
  And { filters: Vec<Filter> },
  Or { filters: Vec<Filter> },
  Not { filter: Box<Filter> },
  /// Envelope corners `[x1, y1, x2, y2]` in `crs` (CRS:84 when absent),
  /// tested against the feature of interest geometry.
  #[serde(rename = "bbox")]
  BBox {
    #[serde(default)]
    property: Option<String>,
    envelope: [f64; 4],
    #[serde(default)]
    crs:      Option<String>,
  },
  #[serde(rename = "tequals")]
  TEquals { property: String, time: TemporalExtent },
  During { property: String, time: TemporalExtent },
  Before { property: String, time: TemporalExtent },
  After { property: String, time: TemporalExtent },
  ResourceId { ids: Vec<String> },
}

impl Filter {
  pub fn equal(property: impl Into<String>, value: impl Into<Literal>) -> Self {
    Self::Equal { property: property.into(), value: value.into() }
  }

  pub fn not_equal(property: impl Into<String>, value: impl Into<Literal>) -> Self {
    Self::NotEqual { property: property.into(), value: value.into() }
  }

  pub fn greater(property: impl Into<String>, value: impl Into<Literal>) -> Self {
    Self::Greater { property: property.into(), value: value.into() }
  }

  pub fn less(property: impl Into<String>, value: impl Into<Literal>) -> Self {
    Self::Less { property: property.into(), value: value.into() }
  }

  pub fn like(property: impl Into<String>, pattern: impl Into<String>) -> Self {
    Self::Like { property: property.into(), pattern: pattern.into() }
  }

  pub fn and(filters: impl IntoIterator<Item = Filter>) -> Self {
    Self::And { filters: filters.into_iter().collect() }
  }

  pub fn or(filters: impl IntoIterator<Item = Filter>) -> Self {
    Self::Or { filters: filters.into_iter().collect() }
  }

  #[allow(clippy::should_implement_trait)]
  pub fn not(filter: Filter) -> Self { Self::Not { filter: Box::new(filter) } }

  pub fn during(time: TemporalExtent) -> Self {
    Self::During { property: "phenomenonTime".into(), time }
  }

  pub fn tequals(time: TemporalExtent) -> Self {
    Self::TEquals { property: "phenomenonTime".into(), time }
  }

  pub fn before(time: TemporalExtent) -> Self {
    Self::Before { property: "phenomenonTime".into(), time }
  }

  pub fn after(time: TemporalExtent) -> Self {
    Self::After { property: "phenomenonTime".into(), time }
  }

  pub fn bbox(envelope: [f64; 4], crs: Option<&str>) -> Self {
    Self::BBox { property: None, envelope, crs: crs.map(str::to_owned) }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn decodes_from_json() {
    let json = r#"{
      "op": "and",
      "filters": [
        { "op": "equal", "property": "procedure", "value": "sensor-1" },
        { "op": "greater", "property": "result[0]", "value": 12.5 },
        { "op": "bbox", "envelope": [0, 40, 10, 50], "crs": "EPSG:4326" }
      ]
    }"#;
    let filter: Filter = serde_json::from_str(json).unwrap();
    let Filter::And { filters } = filter else { panic!("expected and") };
    assert_eq!(filters[0], Filter::equal("procedure", "sensor-1"));
    assert_eq!(filters[1], Filter::greater("result[0]", 12.5));
    assert!(matches!(filters[2], Filter::BBox { crs: Some(ref c), .. } if c == "EPSG:4326"));
  }
}
