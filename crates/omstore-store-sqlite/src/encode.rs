//! Encoding and decoding helpers between the domain model and the plain
//! representations stored in SQLite columns.
//!
//! Instants are stored as fixed-width RFC 3339 strings so text order is time
//! order. Structured values (fields, geometries, result quality) are stored as
//! compact JSON. Measure values keep their natural SQLite storage class and
//! are decoded against the type of the column they were placed in.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rusqlite::types::Value;

use omstore_core::{
  Properties,
  allocator::{FieldLedger, Placement, TableRows},
  composer::PhenomenonRegistry,
  feature::SamplingFeature,
  field::{Field, FieldType, FieldValue},
  geometry::Geometry,
  observation::ResultRow,
  phenomenon::{CompositePhenomenon, Phenomenon, SimplePhenomenon},
  procedure::{HistoricalLocation, Procedure},
  snapshot::ObservationHeader,
  time::{TemporalExtent, format_instant, parse_instant},
};

use crate::{Error, Result, schema::value_column};

// ─── DateTime<Utc> ───────────────────────────────────────────────────────────

pub fn encode_dt(dt: DateTime<Utc>) -> String { format_instant(dt) }

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  parse_instant(s).ok_or_else(|| Error::DateParse(s.to_owned()))
}

pub fn encode_extent(extent: &TemporalExtent) -> (String, String) {
  (encode_dt(extent.begin()), encode_dt(extent.end()))
}

pub fn decode_extent(begin: &str, end: &str) -> Result<TemporalExtent> {
  Ok(TemporalExtent::between(decode_dt(begin)?, decode_dt(end)?))
}

// ─── Measure values ──────────────────────────────────────────────────────────

pub fn encode_value(value: &FieldValue) -> Value {
  match value {
    FieldValue::Null => Value::Null,
    FieldValue::Boolean(b) => Value::Integer(i64::from(*b)),
    FieldValue::Number(v) => Value::Real(*v),
    FieldValue::Time(t) => Value::Text(encode_dt(*t)),
    FieldValue::Text(s) => Value::Text(s.clone()),
  }
}

pub fn decode_value(value: Value, ty: FieldType) -> Result<FieldValue> {
  Ok(match (ty, value) {
    (_, Value::Null) => FieldValue::Null,
    (FieldType::Quantity, Value::Real(v)) => FieldValue::number(v),
    (FieldType::Quantity, Value::Integer(v)) => FieldValue::Number(v as f64),
    (FieldType::Boolean, Value::Integer(v)) => FieldValue::Boolean(v != 0),
    (FieldType::Time, Value::Text(s)) => FieldValue::Time(decode_dt(&s)?),
    (FieldType::Text, Value::Text(s)) => FieldValue::Text(s),
    (ty, other) => {
      return Err(Error::Corrupt(format!("{other:?} stored in a {ty} column")));
    }
  })
}

// ─── Properties ──────────────────────────────────────────────────────────────

/// One row of a `*_properties` table.
pub struct RawProperty {
  pub owner: String,
  pub key:   String,
  pub value: String,
}

/// Flattened `(key, value, position)` rows of a property multimap.
pub fn encode_properties(properties: &Properties) -> Vec<(String, String, i64)> {
  properties
    .iter()
    .flat_map(|(key, values)| {
      values
        .iter()
        .enumerate()
        .map(move |(i, v)| (key.clone(), v.clone(), i as i64))
    })
    .collect()
}

/// Group property rows by owner. Rows must arrive ordered by position.
pub fn collect_properties(raws: Vec<RawProperty>) -> BTreeMap<String, Properties> {
  let mut by_owner: BTreeMap<String, Properties> = BTreeMap::new();
  for raw in raws {
    by_owner
      .entry(raw.owner)
      .or_default()
      .entry(raw.key)
      .or_default()
      .push(raw.value);
  }
  by_owner
}

// ─── Procedures ──────────────────────────────────────────────────────────────

pub struct RawProcedure {
  pub pid:           i64,
  pub procedure_id:  String,
  pub name:          Option<String>,
  pub description:   Option<String>,
  pub sensor_type:   String,
  pub shape:         String,
  pub phenomenon_id: Option<String>,
  pub max_width:     i64,
  pub main_field:    Option<String>,
}

pub struct RawField {
  pub procedure_id: String,
  pub table_index:  i64,
  pub column_index: i64,
  pub field:        String,
}

pub struct RawWidth {
  pub procedure_id: String,
  pub table_index:  i64,
  pub width:        i64,
}

pub struct RawLocation {
  pub procedure_id: String,
  pub time:         String,
  pub geometry:     String,
}

impl RawProcedure {
  /// Rebuild the procedure's ledger. `fields` must be this procedure's rows in
  /// position order.
  pub fn ledger(&self, fields: &[RawField], widths: &[RawWidth]) -> Result<FieldLedger> {
    let main = self
      .main_field
      .as_deref()
      .map(serde_json::from_str::<Field>)
      .transpose()?;
    let placements = fields
      .iter()
      .map(|raw| {
        Ok(Placement {
          field:  serde_json::from_str(&raw.field)?,
          table:  usize::try_from(raw.table_index)
            .map_err(|_| Error::Corrupt(format!("table index {}", raw.table_index)))?,
          column: usize::try_from(raw.column_index)
            .map_err(|_| Error::Corrupt(format!("column index {}", raw.column_index)))?,
        })
      })
      .collect::<Result<Vec<_>>>()?;
    let max_width = usize::try_from(self.max_width)
      .map_err(|_| Error::Corrupt(format!("max width {}", self.max_width)))?;
    let widths = widths
      .iter()
      .map(|raw| {
        let table = usize::try_from(raw.table_index)
          .map_err(|_| Error::Corrupt(format!("table index {}", raw.table_index)))?;
        let width = usize::try_from(raw.width)
          .map_err(|_| Error::Corrupt(format!("table width {}", raw.width)))?;
        Ok((table, width))
      })
      .collect::<Result<Vec<_>>>()?;
    Ok(FieldLedger::with_placements(max_width, main, placements).with_widths(widths))
  }

  pub fn into_procedure(
    self,
    ledger: &FieldLedger,
    properties: Properties,
    locations: Vec<RawLocation>,
  ) -> Result<Procedure> {
    let locations = locations
      .into_iter()
      .map(|raw| {
        Ok(HistoricalLocation {
          time:     decode_dt(&raw.time)?,
          geometry: serde_json::from_str::<Geometry>(&raw.geometry)?,
        })
      })
      .collect::<Result<Vec<_>>>()?;
    Ok(Procedure {
      sensor_type: self
        .sensor_type
        .parse()
        .map_err(|_| Error::Corrupt(format!("sensor type {:?}", self.sensor_type)))?,
      shape: self
        .shape
        .parse()
        .map_err(|_| Error::Corrupt(format!("observation shape {:?}", self.shape)))?,
      id: self.procedure_id,
      name: self.name,
      description: self.description,
      properties,
      fields: ledger.fields(),
      phenomenon: self.phenomenon_id,
      locations,
    })
  }
}

// ─── Phenomena ───────────────────────────────────────────────────────────────

pub struct RawPhenomenon {
  pub id:          String,
  pub kind:        String,
  pub name:        Option<String>,
  pub definition:  Option<String>,
  pub description: Option<String>,
}

pub struct RawComponent {
  pub composite_id: String,
  pub component_id: String,
}

pub fn encode_phenomenon_kind(p: &Phenomenon) -> &'static str {
  if p.is_composite() { "composite" } else { "simple" }
}

/// Rebuild the registry. Components must arrive ordered by position.
pub fn decode_phenomena(
  raws: Vec<RawPhenomenon>,
  components: Vec<RawComponent>,
  mut properties: BTreeMap<String, Properties>,
) -> Result<PhenomenonRegistry> {
  let mut simple: BTreeMap<String, SimplePhenomenon> = BTreeMap::new();
  let mut composite: Vec<RawPhenomenon> = Vec::new();
  for raw in raws {
    match raw.kind.as_str() {
      "simple" => {
        simple.insert(raw.id.clone(), SimplePhenomenon {
          properties:  properties.remove(&raw.id).unwrap_or_default(),
          id:          raw.id,
          name:        raw.name,
          definition:  raw.definition,
          description: raw.description,
        });
      }
      "composite" => composite.push(raw),
      other => return Err(Error::Corrupt(format!("phenomenon kind {other:?}"))),
    }
  }

  let mut members: BTreeMap<String, Vec<SimplePhenomenon>> = BTreeMap::new();
  for raw in components {
    let component = simple.get(&raw.component_id).cloned().ok_or_else(|| {
      Error::Corrupt(format!(
        "composite {} refers to unknown component {}",
        raw.composite_id, raw.component_id
      ))
    })?;
    members.entry(raw.composite_id).or_default().push(component);
  }

  let composites: Vec<Phenomenon> = composite
    .into_iter()
    .map(|raw| {
      let components = members.remove(&raw.id).unwrap_or_default();
      let mut c = CompositePhenomenon::new(raw.id.clone(), components);
      c.name = raw.name;
      c.definition = raw.definition;
      c.description = raw.description;
      c.properties = properties.remove(&raw.id).unwrap_or_default();
      Phenomenon::Composite(c)
    })
    .collect();

  Ok(simple.into_values().map(Phenomenon::Simple).chain(composites).collect())
}

// ─── Features ────────────────────────────────────────────────────────────────

pub struct RawFeature {
  pub id:              String,
  pub name:            Option<String>,
  pub description:     Option<String>,
  pub geometry:        Option<String>,
  pub sampled_feature: Option<String>,
}

impl RawFeature {
  pub fn into_feature(self, properties: Properties) -> Result<SamplingFeature> {
    Ok(SamplingFeature {
      id: self.id,
      name: self.name,
      description: self.description,
      geometry: self.geometry.as_deref().map(serde_json::from_str).transpose()?,
      sampled_feature: self.sampled_feature,
      properties,
    })
  }
}

// ─── Observations ────────────────────────────────────────────────────────────

pub struct RawObservation {
  pub id:             String,
  pub procedure_id:   String,
  pub name:           String,
  pub phenomenon_id:  Option<String>,
  pub feature_id:     Option<String>,
  pub begin_time:     String,
  pub end_time:       String,
  pub result_quality: String,
}

impl RawObservation {
  pub fn into_header(self) -> Result<ObservationHeader> {
    Ok(ObservationHeader {
      extent:         decode_extent(&self.begin_time, &self.end_time)?,
      result_quality: serde_json::from_str(&self.result_quality)?,
      id:             self.id,
      name:           self.name,
      procedure:      self.procedure_id,
      phenomenon:     self.phenomenon_id,
      feature:        self.feature_id,
    })
  }
}

// ─── Measure rows ────────────────────────────────────────────────────────────

/// Every row of one physical measure table, as stored.
pub struct RawMeasureTable {
  pub pid:     i64,
  pub table:   usize,
  /// Names of the stored columns after `observation_id`: `main`, then the
  /// value columns.
  pub columns: Vec<String>,
  /// `(observation_id, values)` with values laid out as `columns`.
  pub rows:    Vec<(String, Vec<Value>)>,
}

impl RawMeasureTable {
  /// Decode the placed columns of this table, grouped by observation id.
  /// Unplaced columns (left behind by a removed field) are ignored.
  pub fn decode(self, ledger: &FieldLedger) -> Result<BTreeMap<String, TableRows>> {
    let main_type = ledger
      .main
      .as_ref()
      .map(|f| f.field_type)
      .ok_or_else(|| Error::Corrupt(format!("measure table {} has no main field", self.table)))?;
    let placed = ledger.table_columns(self.table);
    let positions: Vec<Option<usize>> = placed
      .iter()
      .map(|(c, _)| {
        let name = value_column(*c);
        self.columns.iter().position(|n| *n == name)
      })
      .collect();
    let columns: Vec<usize> = placed.iter().map(|(c, _)| *c).collect();

    let mut by_observation: BTreeMap<String, TableRows> = BTreeMap::new();
    for (observation, mut values) in self.rows {
      let main = values.first_mut().map(|v| std::mem::replace(v, Value::Null)).unwrap_or(Value::Null);
      let mut row = Vec::with_capacity(placed.len() + 1);
      row.push(decode_value(main, main_type)?);
      for ((_, ty), at) in placed.iter().zip(&positions) {
        let value = match at.and_then(|i| values.get_mut(i)) {
          Some(v) => decode_value(std::mem::replace(v, Value::Null), *ty)?,
          None => FieldValue::Null,
        };
        row.push(value);
      }
      by_observation
        .entry(observation)
        .or_insert_with(|| TableRows {
          table:   self.table,
          columns: columns.clone(),
          rows:    Vec::new(),
        })
        .rows
        .push(ResultRow::new(row));
    }
    Ok(by_observation)
  }
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone;

  use super::*;

  #[test]
  fn values_decode_against_column_type() {
    let t = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
    assert_eq!(decode_value(encode_value(&FieldValue::Time(t)), FieldType::Time).unwrap(), FieldValue::Time(t));
    assert_eq!(decode_value(Value::Integer(3), FieldType::Quantity).unwrap(), FieldValue::Number(3.0));
    assert_eq!(decode_value(Value::Integer(0), FieldType::Boolean).unwrap(), FieldValue::Boolean(false));
    assert!(decode_value(Value::Text("x".into()), FieldType::Quantity).is_err());
  }

  #[test]
  fn properties_keep_value_order() {
    let raws = vec![
      RawProperty { owner: "p".into(), key: "k".into(), value: "b".into() },
      RawProperty { owner: "p".into(), key: "k".into(), value: "a".into() },
    ];
    let by_owner = collect_properties(raws);
    assert_eq!(by_owner["p"]["k"], ["b", "a"]);
  }
}
