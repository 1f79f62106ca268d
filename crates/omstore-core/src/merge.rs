//! The write merge planner.
//!
//! A write is normalised into a sorted, de-duplicated complex result, then
//! planned against what the store already holds for its procedure: which
//! observation it lands in, how the ledger grows, which phenomenon covers the
//! procedure afterwards, and the per-table rows to upsert. The plan is pure
//! data; the backend applies it in one transaction.
//!
//! Timeseries observations are keyed by (procedure, feature of interest), so
//! overlapping, adjacent and disjoint writes all land in the same
//! observation. Profiles are keyed by (procedure, feature, instant).

use serde::{Deserialize, Serialize};

use crate::{
  Error, Properties, Result,
  allocator::{Allocation, FieldLedger, TableRows},
  composer::{Composition, PhenomenonRegistry, compose_for},
  config::StoreConfig,
  feature::SamplingFeature,
  field::{Field, FieldType, FieldValue},
  observation::{ComplexResult, ObservationResult, ResultRow},
  phenomenon::{Phenomenon, SimplePhenomenon},
  procedure::{HistoricalLocation, ObservationShape, Procedure, SensorType},
  snapshot::ObservationHeader,
  time::{self, TemporalExtent, TemporalRelation},
};

// ─── Input ───────────────────────────────────────────────────────────────────

/// The procedure a write is attributed to. Metadata given here is merged into
/// the stored record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewProcedure {
  pub id:          String,
  #[serde(default)]
  pub name:        Option<String>,
  #[serde(default)]
  pub description: Option<String>,
  #[serde(default)]
  pub sensor_type: SensorType,
  #[serde(default)]
  pub properties:  Properties,
  #[serde(default)]
  pub location:    Option<HistoricalLocation>,
}

impl NewProcedure {
  pub fn new(id: impl Into<String>) -> Self {
    Self {
      id:          id.into(),
      name:        None,
      description: None,
      sensor_type: SensorType::default(),
      properties:  Properties::new(),
      location:    None,
    }
  }
}

/// Input to `write_observation`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewObservation {
  /// Used only when the write creates a new observation.
  #[serde(default)]
  pub id:                  Option<String>,
  #[serde(default)]
  pub name:                Option<String>,
  pub procedure:           NewProcedure,
  /// A phenomenon the caller declares; used when its components match.
  #[serde(default)]
  pub phenomenon:          Option<Phenomenon>,
  #[serde(default)]
  pub feature_of_interest: Option<SamplingFeature>,
  /// Required for measurements and profiles; derived from the rows for
  /// timeseries.
  #[serde(default)]
  pub sampling_time:       Option<TemporalExtent>,
  pub result:              ObservationResult,
  #[serde(default)]
  pub result_quality:      Properties,
}

// ─── Normalisation ───────────────────────────────────────────────────────────

/// A validated write: rows sorted by main value with duplicate keys merged.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedWrite {
  pub result: ComplexResult,
  pub shape:  ObservationShape,
  pub extent: TemporalExtent,
}

/// Validate `input` and bring it to complex form. `stored_main` is the main
/// field already recorded for the procedure, if any; a measurement adopts it.
pub fn normalize(input: &NewObservation, stored_main: Option<&Field>) -> Result<NormalizedWrite> {
  if input.procedure.id.trim().is_empty() {
    return Err(Error::validation("observation has no procedure"));
  }

  let result = match &input.result {
    ObservationResult::Measure(measure) => {
      let at = input
        .sampling_time
        .map(|t| t.begin())
        .ok_or_else(|| Error::validation("measurement has no sampling time"))?;
      let main = match stored_main {
        Some(f) if f.field_type == FieldType::Time => f.clone(),
        Some(f) => {
          return Err(Error::validation(format!(
            "procedure {} records profiles indexed by {}; measurements need a time index",
            input.procedure.id, f.name
          )));
        }
        None => Field::time("time"),
      };
      let fields = vec![main, measure.field.clone()];
      let mut row = vec![FieldValue::Time(at), measure.value.clone()];
      row.resize(fields.iter().map(Field::flat_width).sum(), FieldValue::Null);
      ComplexResult::with_rows(fields, vec![ResultRow::new(row)])
    }
    ObservationResult::Complex(complex) => complex.clone(),
  };

  let main = result
    .main_field()
    .ok_or_else(|| Error::validation("observation has no fields"))?;
  if result.measured_fields().is_empty() {
    return Err(Error::validation("observation has no measured field"));
  }
  let shape = match main.field_type {
    FieldType::Time => ObservationShape::Timeseries,
    FieldType::Quantity => ObservationShape::Profile,
    other => {
      return Err(Error::validation(format!(
        "main field {} must be a time or a quantity, got {other}",
        main.name
      )));
    }
  };
  if main.flat_width() != 1 {
    return Err(Error::validation(format!(
      "main field {} cannot carry quality or parameter fields",
      main.name
    )));
  }
  for (i, f) in result.fields.iter().enumerate() {
    if f.name.trim().is_empty() {
      return Err(Error::validation("field with an empty name"));
    }
    if result.fields[..i].iter().any(|g| g.name == f.name) {
      return Err(Error::validation(format!("duplicate field {}", f.name)));
    }
  }
  if result.rows.is_empty() {
    return Err(Error::validation("observation has no rows"));
  }

  let types: Vec<FieldType> = result.fields.iter().flat_map(Field::flat_types).collect();
  let mut rows = Vec::with_capacity(result.rows.len());
  for (r, row) in result.rows.iter().enumerate() {
    if row.values.len() != types.len() {
      return Err(Error::validation(format!(
        "row {r} has {} values, expected {}",
        row.values.len(),
        types.len()
      )));
    }
    let values = row
      .values
      .iter()
      .zip(&types)
      .map(|(v, ty)| coerce(v, *ty))
      .collect::<Result<Vec<_>>>()?;
    if values[0].is_null() {
      return Err(Error::validation(format!("row {r} has no {} value", main.name)));
    }
    rows.push(ResultRow::new(values));
  }

  // Duplicate keys within one write merge field by field.
  let incoming = ComplexResult::with_rows(result.fields.clone(), rows);
  let result = ComplexResult::new(result.fields.clone()).merge(&incoming);

  let extent = match shape {
    ObservationShape::Timeseries => result
      .main_extent()
      .ok_or_else(|| Error::validation("timeseries rows carry no time"))?,
    ObservationShape::Profile => input
      .sampling_time
      .map(|t| TemporalExtent::instant(t.begin()))
      .ok_or_else(|| Error::validation("profile has no sampling time"))?,
  };

  Ok(NormalizedWrite { result, shape, extent })
}

fn coerce(value: &FieldValue, ty: FieldType) -> Result<FieldValue> {
  let coerced = match (value, ty) {
    (FieldValue::Number(v), FieldType::Quantity) => FieldValue::number(*v),
    (FieldValue::Text(s), FieldType::Time) => match time::parse_instant(s) {
      Some(t) => FieldValue::Time(t),
      None => value.clone(),
    },
    // Untagged decoding reads time-shaped text as a time.
    (FieldValue::Time(t), FieldType::Text) => FieldValue::Text(time::format_instant(*t)),
    _ => value.clone(),
  };
  if ty.accepts(&coerced) {
    Ok(coerced)
  } else {
    Err(Error::validation(format!("value {} does not fit a {ty} column", value.render())))
  }
}

// ─── Planning ────────────────────────────────────────────────────────────────

/// What the store holds for a write's procedure.
#[derive(Debug, Clone)]
pub struct WriteContext {
  pub procedure:  Option<Procedure>,
  pub ledger:     FieldLedger,
  pub phenomena:  PhenomenonRegistry,
  /// Stored observations of the procedure sharing the write's feature of
  /// interest.
  pub candidates: Vec<ObservationHeader>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteTarget {
  Create { id: Option<String> },
  Merge { id: String, relation: TemporalRelation },
}

#[derive(Debug, Clone, PartialEq)]
pub struct WritePlan {
  /// The procedure record as it must be stored afterwards.
  pub procedure:         Procedure,
  pub procedure_created: bool,
  /// The ledger after `allocation`.
  pub ledger:            FieldLedger,
  pub allocation:        Allocation,
  pub composition:       Composition,
  pub target:            WriteTarget,
  pub name:              Option<String>,
  pub feature:           Option<SamplingFeature>,
  pub extent:            TemporalExtent,
  pub result_quality:    Properties,
  /// Rows to upsert, per physical table.
  pub tables:            Vec<TableRows>,
  /// Phenomena that may have lost their last reference.
  pub retire:            Vec<String>,
}

impl WritePlan {
  pub fn phenomenon_id(&self) -> &str { self.composition.phenomenon.id() }
}

pub fn plan_write(
  ctx: &WriteContext,
  input: &NewObservation,
  config: &StoreConfig,
) -> Result<WritePlan> {
  let write = normalize(input, ctx.ledger.main.as_ref())?;
  let pid = input.procedure.id.as_str();

  if let Some(existing) = &ctx.procedure
    && existing.shape != write.shape
  {
    return Err(Error::validation(format!(
      "procedure {pid} records {} observations, got a {}",
      existing.shape, write.shape
    )));
  }

  let mut ledger = if ctx.ledger.is_empty() {
    FieldLedger::new(config.max_fields_per_table)
  } else {
    ctx.ledger.clone()
  };
  let main = write.result.fields[0].clone();
  let allocation = ledger.allocate(&main, write.result.measured_fields())?;
  ledger.apply(&allocation);

  let mut incoming: Vec<SimplePhenomenon> = Vec::new();
  if write.shape == ObservationShape::Profile {
    incoming.push(SimplePhenomenon::from_field(&main));
  }
  incoming.extend(write.result.measured_fields().iter().map(SimplePhenomenon::from_field));

  let prior = ctx
    .procedure
    .as_ref()
    .and_then(|p| p.phenomenon.as_deref())
    .and_then(|id| ctx.phenomena.get(id));
  let composition =
    compose_for(&ctx.phenomena, pid, prior, input.phenomenon.as_ref(), &incoming)?;

  let target_header = match write.shape {
    ObservationShape::Timeseries => ctx.candidates.iter().min_by(|a, b| a.id.cmp(&b.id)),
    ObservationShape::Profile => ctx
      .candidates
      .iter()
      .filter(|c| c.extent == write.extent)
      .min_by(|a, b| a.id.cmp(&b.id)),
  };

  let (target, extent, result_quality) = match target_header {
    Some(header) => {
      let relation = header.extent.relation(&write.extent);
      tracing::debug!(
        procedure = pid,
        observation = %header.id,
        ?relation,
        "merging into existing observation"
      );
      let mut quality = header.result_quality.clone();
      merge_properties(&mut quality, &input.result_quality);
      (
        WriteTarget::Merge { id: header.id.clone(), relation },
        header.extent.union(&write.extent),
        quality,
      )
    }
    None => {
      tracing::debug!(procedure = pid, "creating observation");
      (
        WriteTarget::Create { id: input.id.clone() },
        write.extent,
        input.result_quality.clone(),
      )
    }
  };

  let mut retire: Vec<String> = composition.replaced.iter().cloned().collect();
  if let Some(old) = target_header.and_then(|h| h.phenomenon.as_deref())
    && old != composition.phenomenon.id()
    && !retire.iter().any(|r| r == old)
  {
    retire.push(old.to_owned());
  }

  let procedure_created = ctx.procedure.is_none();
  let procedure = updated_procedure(
    ctx.procedure.as_ref(),
    &input.procedure,
    write.shape,
    ledger.fields(),
    composition.phenomenon.id(),
  );
  let tables = ledger.partition(&write.result)?;

  Ok(WritePlan {
    procedure,
    procedure_created,
    ledger,
    allocation,
    composition,
    target,
    name: input.name.clone(),
    feature: input.feature_of_interest.clone(),
    extent,
    result_quality,
    tables,
    retire,
  })
}

fn updated_procedure(
  stored: Option<&Procedure>,
  incoming: &NewProcedure,
  shape: ObservationShape,
  fields: Vec<Field>,
  phenomenon: &str,
) -> Procedure {
  let mut procedure = stored.cloned().unwrap_or_else(|| Procedure {
    id: incoming.id.clone(),
    name: None,
    description: None,
    sensor_type: incoming.sensor_type,
    shape,
    properties: Properties::new(),
    fields: Vec::new(),
    phenomenon: None,
    locations: Vec::new(),
  });

  if incoming.name.is_some() {
    procedure.name = incoming.name.clone();
  }
  if incoming.description.is_some() {
    procedure.description = incoming.description.clone();
  }
  merge_properties(&mut procedure.properties, &incoming.properties);
  if let Some(location) = &incoming.location {
    add_location(&mut procedure.locations, location);
  }
  procedure.fields = fields;
  procedure.phenomenon = Some(phenomenon.to_owned());
  procedure
}

/// Insert `location` keeping the history sorted by time; a location at an
/// already recorded time replaces it.
fn add_location(history: &mut Vec<HistoricalLocation>, location: &HistoricalLocation) {
  match history.binary_search_by_key(&location.time, |l| l.time) {
    Ok(at) => history[at] = location.clone(),
    Err(at) => history.insert(at, location.clone()),
  }
}

/// Union of multimap values, keeping first-seen order.
pub fn merge_properties(into: &mut Properties, from: &Properties) {
  for (key, values) in from {
    let slot = into.entry(key.clone()).or_default();
    for v in values {
      if !slot.contains(v) {
        slot.push(v.clone());
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use chrono::{DateTime, TimeZone, Utc};

  use super::*;
  use crate::{
    field::FieldValue as V,
    geometry::{Crs, Geometry},
    observation::MeasureResult,
  };

  fn t(m: u32) -> DateTime<Utc> { Utc.with_ymd_and_hms(2024, 5, 1, 12, m, 0).unwrap() }

  fn series(pid: &str, names: &[&str], rows: &[(u32, f64)]) -> NewObservation {
    let mut fields = vec![Field::time("time")];
    fields.extend(names.iter().map(|n| Field::quantity(*n)));
    let rows = rows
      .iter()
      .map(|(m, v)| {
        let mut values = vec![V::Time(t(*m))];
        values.extend(names.iter().map(|_| V::Number(*v)));
        ResultRow::new(values)
      })
      .collect();
    NewObservation {
      id:                  None,
      name:                None,
      procedure:           NewProcedure::new(pid),
      phenomenon:          None,
      feature_of_interest: Some(SamplingFeature::new("station-1")),
      sampling_time:       None,
      result:              ObservationResult::Complex(ComplexResult::with_rows(fields, rows)),
      result_quality:      Properties::new(),
    }
  }

  fn empty_ctx() -> WriteContext {
    WriteContext {
      procedure:  None,
      ledger:     FieldLedger::new(10),
      phenomena:  PhenomenonRegistry::new(),
      candidates: Vec::new(),
    }
  }

  /// Apply a plan the way a backend would, for chaining writes.
  fn commit(ctx: &mut WriteContext, plan: &WritePlan, next_id: &str) {
    for p in &plan.composition.created {
      ctx.phenomena.insert(p.clone());
    }
    ctx.procedure = Some(plan.procedure.clone());
    ctx.ledger = plan.ledger.clone();
    let id = match &plan.target {
      WriteTarget::Create { id } => id.clone().unwrap_or_else(|| next_id.to_owned()),
      WriteTarget::Merge { id, .. } => id.clone(),
    };
    ctx.candidates.retain(|c| c.id != id);
    ctx.candidates.push(ObservationHeader {
      id:             id.clone(),
      name:           id,
      procedure:      plan.procedure.id.clone(),
      phenomenon:     Some(plan.phenomenon_id().to_owned()),
      feature:        plan.feature.as_ref().map(|f| f.id.clone()),
      extent:         plan.extent,
      result_quality: plan.result_quality.clone(),
    });
  }

  #[test]
  fn first_write_creates_everything() {
    let ctx = empty_ctx();
    let plan = plan_write(&ctx, &series("s1", &["temp"], &[(0, 1.0)]), &StoreConfig::default())
      .unwrap();
    assert!(plan.procedure_created);
    assert_eq!(plan.target, WriteTarget::Create { id: None });
    assert_eq!(plan.phenomenon_id(), "temp");
    assert_eq!(plan.allocation.opened_tables, [0]);
    assert_eq!(plan.procedure.fields.len(), 2);
  }

  #[test]
  fn rewrite_merges_into_same_observation() {
    let mut ctx = empty_ctx();
    let input = series("s1", &["temp", "sal"], &[(0, 1.0), (1, 2.0)]);
    let first = plan_write(&ctx, &input, &StoreConfig::default()).unwrap();
    commit(&mut ctx, &first, "s1-obs-1");

    let second = plan_write(&ctx, &input, &StoreConfig::default()).unwrap();
    assert!(matches!(
      second.target,
      WriteTarget::Merge { ref id, relation: TemporalRelation::Overlapping } if id == "s1-obs-1"
    ));
    assert!(second.allocation.is_empty());
    assert_eq!(second.phenomenon_id(), first.phenomenon_id());
    assert!(second.retire.is_empty());
  }

  #[test]
  fn disjoint_write_still_merges_and_extends_extent() {
    let mut ctx = empty_ctx();
    let first = plan_write(&ctx, &series("s1", &["temp"], &[(0, 1.0), (1, 1.0)]), &StoreConfig::default()).unwrap();
    commit(&mut ctx, &first, "s1-obs-1");
    let second = plan_write(&ctx, &series("s1", &["temp"], &[(30, 1.0), (40, 1.0)]), &StoreConfig::default()).unwrap();
    assert!(matches!(
      second.target,
      WriteTarget::Merge { relation: TemporalRelation::Disjoint, .. }
    ));
    assert_eq!(second.extent, TemporalExtent::between(t(0), t(40)));
  }

  #[test]
  fn partially_overlapping_fields_extend_phenomenon() {
    let mut ctx = empty_ctx();
    let first = plan_write(&ctx, &series("s1", &["a", "b"], &[(0, 1.0)]), &StoreConfig::default()).unwrap();
    assert_eq!(first.phenomenon_id(), "computed-phen-s1");
    commit(&mut ctx, &first, "s1-obs-1");

    let second = plan_write(&ctx, &series("s1", &["b", "c"], &[(1, 1.0)]), &StoreConfig::default()).unwrap();
    assert_eq!(second.composition.phenomenon.component_ids(), ["a", "b", "c"]);
    assert_ne!(second.phenomenon_id(), "computed-phen-s1");
    assert_eq!(second.retire, ["computed-phen-s1"]);
    let names: Vec<_> = second.procedure.fields.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, ["time", "a", "b", "c"]);
  }

  #[test]
  fn profiles_merge_per_instant() {
    let profile = |at: u32| {
      let fields = vec![Field::quantity("depth"), Field::quantity("temp")];
      NewObservation {
        sampling_time: Some(TemporalExtent::instant(t(at))),
        result: ObservationResult::Complex(ComplexResult::with_rows(fields, vec![
          ResultRow::new(vec![V::Number(1.0), V::Number(10.0)]),
          ResultRow::new(vec![V::Number(5.0), V::Number(9.0)]),
        ])),
        ..series("p1", &[], &[])
      }
    };
    let mut ctx = empty_ctx();
    let first = plan_write(&ctx, &profile(0), &StoreConfig::default()).unwrap();
    assert_eq!(first.procedure.shape, ObservationShape::Profile);
    assert_eq!(first.composition.phenomenon.component_ids(), ["depth", "temp"]);
    commit(&mut ctx, &first, "p1-obs-1");

    let other_instant = plan_write(&ctx, &profile(10), &StoreConfig::default()).unwrap();
    assert_eq!(other_instant.target, WriteTarget::Create { id: None });
    let same_instant = plan_write(&ctx, &profile(0), &StoreConfig::default()).unwrap();
    assert!(matches!(same_instant.target, WriteTarget::Merge { .. }));
  }

  #[test]
  fn measurement_becomes_single_row() {
    let input = NewObservation {
      sampling_time: Some(TemporalExtent::instant(t(3))),
      result: ObservationResult::Measure(MeasureResult {
        field: Field::quantity("temp").with_unit("degC"),
        value: V::Number(12.5),
      }),
      ..series("m1", &[], &[])
    };
    let write = normalize(&input, None).unwrap();
    assert_eq!(write.result.rows.len(), 1);
    assert_eq!(write.extent, TemporalExtent::instant(t(3)));
    assert_eq!(write.result.rows[0].values[1], V::Number(12.5));
  }

  #[test]
  fn duplicate_keys_in_one_write_collapse() {
    let input = series("s1", &["temp"], &[(0, 1.0), (0, 2.0), (1, 3.0)]);
    let write = normalize(&input, None).unwrap();
    assert_eq!(write.result.rows.len(), 2);
    assert_eq!(write.result.rows[0].values[1], V::Number(2.0));
  }

  #[test]
  fn invalid_writes_are_rejected() {
    let cfg = StoreConfig::default();
    let ctx = empty_ctx();

    let no_fields = series("s1", &[], &[(0, 1.0)]);
    assert!(plan_write(&ctx, &no_fields, &cfg).unwrap_err().is_validation());

    let no_procedure = series(" ", &["temp"], &[(0, 1.0)]);
    assert!(plan_write(&ctx, &no_procedure, &cfg).unwrap_err().is_validation());

    let mut wrong_type = series("s1", &["temp"], &[(0, 1.0)]);
    if let ObservationResult::Complex(c) = &mut wrong_type.result {
      c.rows[0].values[1] = V::Boolean(true);
    }
    assert!(plan_write(&ctx, &wrong_type, &cfg).unwrap_err().is_validation());
  }

  #[test]
  fn stored_type_mismatch_is_rejected() {
    let cfg = StoreConfig::default();
    let mut ctx = empty_ctx();
    let first = plan_write(&ctx, &series("s1", &["temp"], &[(0, 1.0)]), &cfg).unwrap();
    commit(&mut ctx, &first, "s1-obs-1");

    let mut text = series("s1", &[], &[]);
    text.result = ObservationResult::Complex(ComplexResult::with_rows(
      vec![Field::time("time"), Field::text("temp")],
      vec![ResultRow::new(vec![V::Time(t(5)), V::Text("warm".into())])],
    ));
    assert!(plan_write(&ctx, &text, &cfg).unwrap_err().is_validation());
  }

  #[test]
  fn locations_are_kept_in_time_order() {
    let mut history = Vec::new();
    let at = |m| HistoricalLocation { time: t(m), geometry: Geometry::point(Crs::Crs84, 1.0, 2.0) };
    add_location(&mut history, &at(5));
    add_location(&mut history, &at(1));
    add_location(&mut history, &at(5));
    let times: Vec<_> = history.iter().map(|l| l.time).collect();
    assert_eq!(times, [t(1), t(5)]);
  }
}
