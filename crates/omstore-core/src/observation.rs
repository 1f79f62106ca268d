//! Observations and their results.
//!
//! A complex result is an ordered matrix: one row per main value (time or
//! depth), one group of flat columns per field. The first field is always the
//! main field and occupies exactly one column.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
  Properties,
  feature::SamplingFeature,
  field::{Field, FieldValue, MainKey},
  phenomenon::Phenomenon,
  time::TemporalExtent,
};

// ─── Rows ────────────────────────────────────────────────────────────────────

/// One row of a complex result, in flat-column order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultRow {
  pub values: Vec<FieldValue>,
}

impl ResultRow {
  pub fn new(values: Vec<FieldValue>) -> Self { Self { values } }

  pub fn main(&self) -> &FieldValue { self.values.first().unwrap_or(&FieldValue::Null) }
}

impl From<Vec<FieldValue>> for ResultRow {
  fn from(values: Vec<FieldValue>) -> Self { Self { values } }
}

// ─── Complex result ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComplexResult {
  pub fields: Vec<Field>,
  #[serde(default)]
  pub rows:   Vec<ResultRow>,
}

impl ComplexResult {
  pub fn new(fields: Vec<Field>) -> Self { Self { fields, rows: Vec::new() } }

  pub fn with_rows(fields: Vec<Field>, rows: Vec<ResultRow>) -> Self { Self { fields, rows } }

  pub fn main_field(&self) -> Option<&Field> { self.fields.first() }

  pub fn measured_fields(&self) -> &[Field] { self.fields.get(1..).unwrap_or_default() }

  pub fn flat_width(&self) -> usize { self.fields.iter().map(Field::flat_width).sum() }

  /// Flat offset of each field's value column.
  pub fn offsets(&self) -> Vec<usize> {
    let mut offsets = Vec::with_capacity(self.fields.len());
    let mut at = 0;
    for f in &self.fields {
      offsets.push(at);
      at += f.flat_width();
    }
    offsets
  }

  pub fn row_count(&self) -> usize { self.rows.len() }

  pub fn is_template(&self) -> bool { self.rows.is_empty() }

  /// Value of the `measured`-th non-main field in `row`.
  pub fn measured_value(&self, row: usize, measured: usize) -> Option<&FieldValue> {
    let offset = *self.offsets().get(measured + 1)?;
    self.rows.get(row)?.values.get(offset)
  }

  /// Value of quality sub-field `quality` of the `measured`-th field in `row`.
  pub fn quality_value(
    &self,
    row: usize,
    measured: usize,
    quality: &str,
  ) -> Option<&FieldValue> {
    let field = self.fields.get(measured + 1)?;
    let q = field.quality_index(quality)?;
    let offset = *self.offsets().get(measured + 1)?;
    self.rows.get(row)?.values.get(offset + 1 + q)
  }

  /// The time extent covered by the rows when the main field is a time.
  pub fn main_extent(&self) -> Option<TemporalExtent> {
    let times = self.rows.iter().filter_map(|r| r.main().as_time());
    let (min, max) = times.fold(None, |acc, t| match acc {
      None => Some((t, t)),
      Some((lo, hi)) => Some((t.min(lo), t.max(hi))),
    })?;
    Some(TemporalExtent::between(min, max))
  }

  pub fn sort_by_main(&mut self) {
    self.rows.sort_by(|a, b| MainKey(a.main().clone()).cmp(&MainKey(b.main().clone())));
  }

  /// Field-level outer merge keyed by main value.
  ///
  /// Fields unknown to `self` are appended after its own; sub-fields unknown
  /// to a shared field are appended to that field. On a key collision a
  /// non-null incoming value overwrites, a null one keeps the stored value.
  /// The merged rows are sorted by main value.
  pub fn merge(&self, incoming: &ComplexResult) -> ComplexResult {
    let mut fields = self.fields.clone();
    for f in &incoming.fields {
      match fields.iter_mut().find(|e| e.name == f.name) {
        Some(existing) => union_sub_fields(existing, f),
        None => fields.push(f.clone()),
      }
    }

    let width: usize = fields.iter().map(Field::flat_width).sum();
    let mut by_key: BTreeMap<MainKey, Vec<FieldValue>> = BTreeMap::new();
    for source in [self, incoming] {
      let mapping = column_mapping(&source.fields, &fields);
      for row in &source.rows {
        let key = MainKey(row.main().clone());
        let target = by_key
          .entry(key)
          .or_insert_with(|| vec![FieldValue::Null; width]);
        for (from, to) in mapping.iter().enumerate() {
          if let (Some(to), Some(v)) = (to, row.values.get(from))
            && !v.is_null()
          {
            target[*to] = v.clone();
          }
        }
      }
    }

    ComplexResult {
      fields,
      rows: by_key.into_values().map(ResultRow::new).collect(),
    }
  }

  /// Re-lay the result onto `fields` (matched by name, sub-fields by name).
  /// Columns absent from `self` come out null.
  pub fn project(&self, fields: &[Field]) -> ComplexResult {
    let width: usize = fields.iter().map(Field::flat_width).sum();
    let mapping = column_mapping(&self.fields, fields);
    let rows = self
      .rows
      .iter()
      .map(|row| {
        let mut values = vec![FieldValue::Null; width];
        for (from, to) in mapping.iter().enumerate() {
          if let (Some(to), Some(v)) = (to, row.values.get(from)) {
            values[*to] = v.clone();
          }
        }
        ResultRow::new(values)
      })
      .collect();
    ComplexResult { fields: fields.to_vec(), rows }
  }
}

fn union_sub_fields(existing: &mut Field, incoming: &Field) {
  for q in &incoming.quality_fields {
    if !existing.quality_fields.iter().any(|e| e.name == q.name) {
      existing.quality_fields.push(q.clone());
    }
  }
  for p in &incoming.parameter_fields {
    if !existing.parameter_fields.iter().any(|e| e.name == p.name) {
      existing.parameter_fields.push(p.clone());
    }
  }
}

/// For each flat column of `from`, the flat column of `to` holding the same
/// value, if any.
fn column_mapping(from: &[Field], to: &[Field]) -> Vec<Option<usize>> {
  let mut to_offsets = BTreeMap::new();
  let mut at = 0;
  for f in to {
    to_offsets.insert(f.name.as_str(), (at, f));
    at += f.flat_width();
  }

  let mut mapping = Vec::new();
  for f in from {
    let target = to_offsets.get(f.name.as_str());
    mapping.push(target.map(|(off, _)| *off));
    for q in &f.quality_fields {
      mapping.push(target.and_then(|(off, t)| {
        t.quality_index(&q.name).map(|i| off + 1 + i)
      }));
    }
    for p in &f.parameter_fields {
      mapping.push(target.and_then(|(off, t)| {
        t.parameter_fields
          .iter()
          .position(|e| e.name == p.name)
          .map(|i| off + 1 + t.quality_fields.len() + i)
      }));
    }
  }
  mapping
}

// ─── Measure result ──────────────────────────────────────────────────────────

/// The result of a measurement: one value of one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasureResult {
  pub field: Field,
  pub value: FieldValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ObservationResult {
  Measure(MeasureResult),
  Complex(ComplexResult),
}

impl ObservationResult {
  pub fn as_complex(&self) -> Option<&ComplexResult> {
    match self {
      Self::Complex(c) => Some(c),
      Self::Measure(_) => None,
    }
  }
}

// ─── Observation ─────────────────────────────────────────────────────────────

/// An observation as returned by reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
  pub id:                  String,
  pub name:                String,
  pub procedure:           String,
  pub phenomenon:          Option<Phenomenon>,
  pub feature_of_interest: Option<SamplingFeature>,
  pub sampling_time:       Option<TemporalExtent>,
  pub result:              ObservationResult,
  #[serde(default)]
  pub result_quality:      Properties,
}

impl Observation {
  pub fn complex_result(&self) -> Option<&ComplexResult> { self.result.as_complex() }
}

#[cfg(test)]
mod tests {
  use chrono::{TimeZone, Utc};

  use super::*;

  fn t(m: u32) -> FieldValue {
    FieldValue::Time(Utc.with_ymd_and_hms(2024, 3, 1, 0, m, 0).unwrap())
  }

  fn n(v: f64) -> FieldValue { FieldValue::Number(v) }

  fn result(names: &[&str], rows: Vec<Vec<FieldValue>>) -> ComplexResult {
    let mut fields = vec![Field::time("time")];
    fields.extend(names.iter().map(|n| Field::quantity(*n)));
    ComplexResult::with_rows(fields, rows.into_iter().map(ResultRow::new).collect())
  }

  #[test]
  fn merge_is_field_level_on_collisions() {
    let a = result(&["temp", "sal"], vec![vec![t(0), n(1.0), n(10.0)]]);
    let b = result(&["temp"], vec![vec![t(0), n(2.0)]]);
    let merged = a.merge(&b);
    assert_eq!(merged.rows.len(), 1);
    assert_eq!(merged.rows[0].values, [t(0), n(2.0), n(10.0)]);
  }

  #[test]
  fn merge_unions_partially_overlapping_fields() {
    let a = result(&["a", "b"], vec![vec![t(0), n(1.0), n(2.0)]]);
    let b = result(&["b", "c"], vec![vec![t(1), n(3.0), n(4.0)]]);
    let merged = a.merge(&b);
    let names: Vec<_> = merged.fields.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, ["time", "a", "b", "c"]);
    assert_eq!(merged.rows[0].values, [t(0), n(1.0), n(2.0), FieldValue::Null]);
    assert_eq!(merged.rows[1].values, [t(1), FieldValue::Null, n(3.0), n(4.0)]);
  }

  #[test]
  fn merge_sorts_disjoint_rows() {
    let a = result(&["a"], vec![vec![t(5), n(1.0)]]);
    let b = result(&["a"], vec![vec![t(1), n(2.0)]]);
    let merged = a.merge(&b);
    assert_eq!(merged.rows[0].main(), &t(1));
    assert_eq!(merged.main_extent().unwrap().begin(), t(1).as_time().unwrap());
  }

  #[test]
  fn quality_values_are_addressed_by_name() {
    let mut r = result(&[], vec![]);
    r.fields.push(Field::quantity("temp").with_quality(Field::text("flag")));
    r.rows.push(ResultRow::new(vec![t(0), n(4.0), FieldValue::Text("good".into())]));
    assert_eq!(r.measured_value(0, 0), Some(&n(4.0)));
    assert_eq!(r.quality_value(0, 0, "flag"), Some(&FieldValue::Text("good".into())));
    assert_eq!(r.quality_value(0, 0, "other"), None);
  }

  #[test]
  fn project_fills_missing_columns_with_null() {
    let a = result(&["a"], vec![vec![t(0), n(1.0)]]);
    let target = vec![Field::time("time"), Field::quantity("b"), Field::quantity("a")];
    let p = a.project(&target);
    assert_eq!(p.rows[0].values, [t(0), FieldValue::Null, n(1.0)]);
  }
}
