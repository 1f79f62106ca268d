//! Builders for the writes the integration tests feed the store.

use chrono::{DateTime, TimeZone, Utc};
use omstore_core::{
  feature::SamplingFeature,
  field::{Field, FieldValue},
  geometry::{Crs, Geometry},
  merge::{NewObservation, NewProcedure},
  observation::{ComplexResult, MeasureResult, ObservationResult, ResultRow},
  time::TemporalExtent,
};

pub fn t(minute: u32) -> DateTime<Utc> {
  Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, 0).unwrap()
}

pub fn station(id: &str) -> SamplingFeature {
  SamplingFeature::new(id).with_geometry(Geometry::point(Crs::Crs84, 10.5, 59.9))
}

/// A timeseries at `station-1`: a time column, then one quantity per name,
/// every quantity of a row carrying the same value.
pub fn series(procedure: &str, names: &[&str], rows: &[(u32, f64)]) -> NewObservation {
  let mut fields = vec![Field::time("time")];
  fields.extend(names.iter().map(|n| Field::quantity(*n).with_unit("degC")));
  let rows = rows
    .iter()
    .map(|(m, v)| {
      let mut values = vec![FieldValue::Time(t(*m))];
      values.extend(names.iter().map(|_| FieldValue::Number(*v)));
      ResultRow::new(values)
    })
    .collect();
  NewObservation {
    id:                  None,
    name:                None,
    procedure:           NewProcedure::new(procedure),
    phenomenon:          None,
    feature_of_interest: Some(station("station-1")),
    sampling_time:       None,
    result:              ObservationResult::Complex(ComplexResult::with_rows(fields, rows)),
    result_quality:      Default::default(),
  }
}

/// A depth profile sampled at minute `at`: `(depth, temp)` rows.
pub fn profile(procedure: &str, at: u32, rows: &[(f64, f64)]) -> NewObservation {
  let fields = vec![Field::quantity("depth").with_unit("m"), Field::quantity("temp")];
  let rows = rows
    .iter()
    .map(|(d, v)| ResultRow::new(vec![FieldValue::Number(*d), FieldValue::Number(*v)]))
    .collect();
  NewObservation {
    sampling_time: Some(TemporalExtent::instant(t(at))),
    result: ObservationResult::Complex(ComplexResult::with_rows(fields, rows)),
    ..series(procedure, &[], &[])
  }
}

/// A single value of `field` at minute `at`.
pub fn measurement(procedure: &str, field: &str, at: u32, value: f64) -> NewObservation {
  NewObservation {
    sampling_time: Some(TemporalExtent::instant(t(at))),
    result: ObservationResult::Measure(MeasureResult {
      field: Field::quantity(field),
      value: FieldValue::Number(value),
    }),
    ..series(procedure, &[], &[])
  }
}
