//! Read-side assembly over a loaded snapshot.
//!
//! Every read the store offers is answered here: observation and measurement
//! listings, result templates, result blocks in each output format, the
//! entity listings and dataset extracts. Backends only decide what to load.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::{
  Result,
  allocator::FieldLedger,
  config::StoreConfig,
  decimate::decimate,
  feature::SamplingFeature,
  field::{Field, FieldValue},
  filter::{self, EvalContext, Predicate},
  format::{self, FlatBlock},
  observation::{ComplexResult, MeasureResult, Observation, ObservationResult, ResultRow},
  offering::{DatasetExtract, Offering},
  phenomenon::{Phenomenon, SimplePhenomenon},
  procedure::Procedure,
  query::{
    DatasetQuery, EntityKind, EntityQuery, ObservationQuery, ResponseMode, ResultFormat,
    ResultQuery, ResultSet, page,
  },
  snapshot::{StoreSnapshot, StoredObservation},
  template::{TemplateOptions, build_template, measurement_templates, template_phenomenon},
  time::TemporalExtent,
};

// ─── Contexts ────────────────────────────────────────────────────────────────

fn observation_context<'a>(
  snapshot: &'a StoreSnapshot,
  stored: &'a StoredObservation,
) -> EvalContext<'a> {
  EvalContext {
    entity_id:        Some(&stored.header.id),
    observation_id:   Some(&stored.header.id),
    procedure:        snapshot.procedure(&stored.header.procedure),
    phenomenon:       snapshot.phenomenon_of(&stored.header),
    feature:          snapshot.feature_of(&stored.header),
    extent:           Some(&stored.header.extent),
    result:           stored.result.as_ref(),
    measured_field:   None,
    locate_procedure: false,
  }
}

/// Rows kept by `predicate`, or `None` when the observation is filtered out.
fn selected_rows(predicate: Option<&Predicate>, ctx: &EvalContext<'_>) -> Option<Vec<usize>> {
  let all = || (0..ctx.result.map_or(0, ComplexResult::row_count)).collect::<Vec<_>>();
  match predicate {
    None => Some(all()),
    Some(p) if p.has_row_terms() && ctx.result.is_some() => {
      let rows = p.matching_rows(ctx);
      (!rows.is_empty()).then_some(rows)
    }
    Some(p) => p.matches(ctx).then(all),
  }
}

/// An entity is kept when any observation referring to it matches, or, when
/// nothing refers to it, when it matches on its own.
fn entity_matches<'a>(
  predicate: Option<&Predicate>,
  alone: EvalContext<'a>,
  related: impl Iterator<Item = EvalContext<'a>>,
) -> bool {
  let Some(predicate) = predicate else {
    return true;
  };
  let mut referenced = false;
  for ctx in related {
    if predicate.matches(&ctx) {
      return true;
    }
    referenced = true;
  }
  !referenced && predicate.matches(&alone)
}

fn subset(result: &ComplexResult, rows: &[usize]) -> ComplexResult {
  ComplexResult::with_rows(
    result.fields.clone(),
    rows.iter().filter_map(|r| result.rows.get(*r).cloned()).collect(),
  )
}

fn limit(query_limit: Option<usize>, config: &StoreConfig) -> usize {
  query_limit.unwrap_or(config.default_limit)
}

// ─── Observations ────────────────────────────────────────────────────────────

/// `get_observations`: matching observations (or measurements, or templates)
/// in id order, paged.
pub fn observations(
  snapshot: &StoreSnapshot,
  query: &ObservationQuery,
  config: &StoreConfig,
) -> Result<Vec<Observation>> {
  let all = select(snapshot, query)?;
  Ok(page(all, query.offset, limit(query.limit, config)))
}

/// `get_identifiers`: the ids of the page `observations` would return.
pub fn identifiers(
  snapshot: &StoreSnapshot,
  query: &ObservationQuery,
  config: &StoreConfig,
) -> Result<Vec<String>> {
  Ok(observations(snapshot, query, config)?.into_iter().map(|o| o.id).collect())
}

/// `get_count`: the number of matches, ignoring paging.
pub fn count(snapshot: &StoreSnapshot, query: &ObservationQuery) -> Result<usize> {
  Ok(select(snapshot, query)?.len())
}

fn select(snapshot: &StoreSnapshot, query: &ObservationQuery) -> Result<Vec<Observation>> {
  let predicate = filter::compile(query.filter.as_ref())?;
  let options = TemplateOptions::from(query);
  if query.mode == ResponseMode::ResultTemplate {
    return Ok(templates(snapshot, predicate.as_ref(), query.entity, &options));
  }

  let selected: Vec<(&StoredObservation, Vec<usize>)> = snapshot
    .observations
    .values()
    .filter_map(|stored| {
      selected_rows(predicate.as_ref(), &observation_context(snapshot, stored))
        .map(|rows| (stored, rows))
    })
    .collect();

  let mut observations: Vec<Observation> = match query.entity {
    EntityKind::Observation => {
      let presented = selected
        .iter()
        .map(|(stored, rows)| present(snapshot, stored, rows, &options))
        .collect();
      if query.separated_profile_observation {
        presented
      } else {
        combine_profiles(snapshot, presented)
      }
    }
    EntityKind::Measurement => selected
      .iter()
      .flat_map(|(stored, rows)| {
        measurements(snapshot, stored, rows, predicate.as_ref(), &options, query.separated_measure)
      })
      .collect(),
  };
  observations.sort_by(|a, b| a.id.cmp(&b.id));
  debug!(count = observations.len(), "observations selected");
  Ok(observations)
}

/// One template per procedure with at least one matching observation, in
/// id order.
fn templates(
  snapshot: &StoreSnapshot,
  predicate: Option<&Predicate>,
  entity: EntityKind,
  options: &TemplateOptions,
) -> Vec<Observation> {
  let procedures: BTreeSet<&str> = snapshot
    .observations
    .values()
    .filter(|stored| predicate.is_none_or(|p| p.matches(&observation_context(snapshot, stored))))
    .map(|stored| stored.header.procedure.as_str())
    .collect();
  let mut out: Vec<Observation> = procedures
    .into_iter()
    .filter_map(|id| snapshot.procedure(id))
    .flat_map(|procedure| match entity {
      EntityKind::Observation => vec![build_template(snapshot, procedure, options)],
      EntityKind::Measurement => measurement_templates(snapshot, procedure, options),
    })
    .collect();
  out.sort_by(|a, b| a.id.cmp(&b.id));
  out
}

/// The observation restricted to `rows`, laid out over its own fields.
fn present(
  snapshot: &StoreSnapshot,
  stored: &StoredObservation,
  rows: &[usize],
  options: &TemplateOptions,
) -> Observation {
  let fields: Vec<Field> = snapshot
    .observation_fields(&stored.header)
    .iter()
    .map(|f| f.restricted(options.include_quality, options.include_parameters))
    .collect();
  let result = match &stored.result {
    Some(all) => subset(all, rows).project(&fields),
    None => ComplexResult::new(fields),
  };
  Observation {
    result: ObservationResult::Complex(result),
    ..snapshot.resolve(&StoredObservation { header: stored.header.clone(), result: None })
  }
}

/// Joins the profiles of each (procedure, feature) into one observation,
/// ordered by profile time, with a `time` column after the main field. The
/// first profile lends its id. Timeseries pass through unchanged.
fn combine_profiles(snapshot: &StoreSnapshot, observations: Vec<Observation>) -> Vec<Observation> {
  let mut out = Vec::new();
  let mut groups: BTreeMap<(String, Option<String>), Vec<Observation>> = BTreeMap::new();
  for observation in observations {
    if snapshot.procedure(&observation.procedure).is_some_and(Procedure::is_profile) {
      let feature = observation.feature_of_interest.as_ref().map(|f| f.id.clone());
      groups.entry((observation.procedure.clone(), feature)).or_default().push(observation);
    } else {
      out.push(observation);
    }
  }

  for ((procedure_id, _), mut profiles) in groups {
    profiles.sort_by_key(|p| p.sampling_time.map(|t| t.begin()));

    let mut fields: Vec<Field> = Vec::new();
    for field in profiles.iter().filter_map(Observation::complex_result).flat_map(|r| &r.fields) {
      if !fields.iter().any(|f| f.name == field.name) {
        fields.push(field.clone());
      }
    }
    let mut rows = Vec::new();
    for profile in &profiles {
      let Some(result) = profile.complex_result() else { continue };
      let time = profile.sampling_time.map_or(FieldValue::Null, |t| FieldValue::Time(t.begin()));
      for mut row in result.project(&fields).rows {
        row.values.insert(1.min(row.values.len()), time.clone());
        rows.push(row);
      }
    }
    fields.insert(1.min(fields.len()), Field::time("time"));

    let Some(first) = profiles.first() else { continue };
    let phenomenon = snapshot
      .procedure(&procedure_id)
      .and_then(|p| template_phenomenon(snapshot, p))
      .or_else(|| first.phenomenon.clone());
    out.push(Observation {
      phenomenon,
      sampling_time: TemporalExtent::union_all(profiles.iter().filter_map(|p| p.sampling_time.as_ref())),
      result: ObservationResult::Complex(ComplexResult::with_rows(fields, rows)),
      ..first.clone()
    });
  }
  out
}

/// Measurements of one observation. Separated: one per non-null (row,
/// measured field), id `<observation>-<field>-<row>`. Otherwise one per row,
/// id `<observation>-<row>`. Field indices are 0-based over the procedure's
/// measured fields, rows 1-based.
fn measurements(
  snapshot: &StoreSnapshot,
  stored: &StoredObservation,
  rows: &[usize],
  predicate: Option<&Predicate>,
  options: &TemplateOptions,
  separated: bool,
) -> Vec<Observation> {
  let Some(all) = &stored.result else {
    return Vec::new();
  };
  let header = &stored.header;
  let base = snapshot.resolve(&StoredObservation { header: header.clone(), result: None });
  let timeseries = snapshot.procedure(&header.procedure).is_some_and(|p| !p.is_profile());
  let sampling = |row: usize| -> Option<TemporalExtent> {
    let instant = all.rows.get(row).and_then(|r| r.main().as_time());
    match (timeseries, instant) {
      (true, Some(t)) => Some(TemporalExtent::instant(t)),
      _ => Some(header.extent),
    }
  };
  let fields = snapshot.observation_fields(header);

  if !separated {
    let restricted: Vec<Field> = fields
      .iter()
      .map(|f| f.restricted(options.include_quality, options.include_parameters))
      .collect();
    return rows
      .iter()
      .map(|&r| {
        let id = format!("{}-{}", header.id, r + 1);
        Observation {
          name: id.clone(),
          id,
          sampling_time: sampling(r),
          result: ObservationResult::Complex(subset(all, &[r]).project(&restricted)),
          ..base.clone()
        }
      })
      .collect();
  }

  let mut out = Vec::new();
  for (index, field) in all.measured_fields().iter().enumerate() {
    if !fields.iter().any(|f| f.name == field.name) {
      continue;
    }
    let component: Phenomenon = base
      .phenomenon
      .as_ref()
      .and_then(|p| p.components().into_iter().find(|c| c.id == field.name).cloned())
      .unwrap_or_else(|| SimplePhenomenon::from_field(field))
      .into();
    let ctx = EvalContext {
      phenomenon: Some(&component),
      measured_field: Some(index),
      ..observation_context(snapshot, stored)
    };
    for &r in rows {
      let Some(value) = all.measured_value(r, index).filter(|v| !v.is_null()) else {
        continue;
      };
      if let Some(p) = predicate
        && !p.matches_row(&ctx, r)
      {
        continue;
      }
      let id = format!("{}-{index}-{}", header.id, r + 1);
      out.push(Observation {
        name: id.clone(),
        id,
        phenomenon: Some(component.clone()),
        sampling_time: sampling(r),
        result: ObservationResult::Measure(MeasureResult {
          field: field.restricted(options.include_quality, options.include_parameters),
          value: value.clone(),
        }),
        ..base.clone()
      });
    }
  }
  out
}

/// `get_template`: the complex template of one procedure.
pub fn template(
  snapshot: &StoreSnapshot,
  procedure_id: &str,
  options: &TemplateOptions,
) -> Option<Observation> {
  snapshot.procedure(procedure_id).map(|p| build_template(snapshot, p, options))
}

// ─── Results ─────────────────────────────────────────────────────────────────

/// A run of result rows sharing one profile instant.
struct Part {
  result:  ComplexResult,
  ids:     Vec<String>,
  /// Profile instant.
  instant: Option<DateTime<Utc>>,
}

type Block<'a> = (&'a StoredObservation, ComplexResult, Vec<usize>);

fn row_ids(stored: &StoredObservation, rows: &[usize]) -> Vec<String> {
  rows.iter().map(|r| format!("{}-{}", stored.header.id, r + 1)).collect()
}

fn profile_instant(procedure: &Procedure, stored: &StoredObservation) -> Option<DateTime<Utc>> {
  procedure.is_profile().then(|| stored.header.extent.begin())
}

/// `get_results`: the rows of one procedure's matching observations, in
/// observation order, rendered in the requested format. A decimated result
/// is one series over every matching row, ordered by the main field.
pub fn results(snapshot: &StoreSnapshot, query: &ResultQuery) -> Result<ResultSet> {
  let predicate = filter::compile(query.filter.as_ref())?;
  let Some(procedure) = snapshot.procedure(&query.procedure) else {
    return Ok(empty(query));
  };
  let ledger = snapshot.ledgers.get(&procedure.id);
  let fields: Vec<Field> = ledger
    .map(FieldLedger::fields)
    .unwrap_or_else(|| procedure.fields.clone())
    .iter()
    .map(|f| f.restricted(query.include_quality_fields, query.include_parameter_fields))
    .collect();

  let blocks: Vec<Block<'_>> = snapshot
    .observations_of(&procedure.id)
    .filter_map(|stored| {
      let all = stored.result.as_ref()?;
      let rows = selected_rows(predicate.as_ref(), &observation_context(snapshot, stored))?;
      Some((stored, subset(all, &rows).project(&fields), rows))
    })
    .collect();

  if query.entity == EntityKind::Measurement {
    let measures: Vec<MeasureResult> = blocks
      .iter()
      .flat_map(|(_, result, _)| measures_of(result))
      .collect();
    return Ok(match query.format {
      ResultFormat::Count => ResultSet::Count { count: measures.len() },
      _ => ResultSet::Measures { measures },
    });
  }

  let (parts, columns) = match query.decimation {
    Some(k) => {
      if ledger.is_some_and(|l| l.table_count() > 1) {
        warn!(
          procedure = %procedure.id,
          "decimating a multi-table procedure: a bucket absent from one table reads as unmeasured"
        );
      }
      decimated_parts(procedure, &fields, blocks, k)?
    }
    None => {
      let parts = blocks
        .into_iter()
        .map(|(stored, result, rows)| Part {
          ids: row_ids(stored, &rows),
          instant: profile_instant(procedure, stored),
          result,
        })
        .collect();
      (parts, fields)
    }
  };

  let with_time = query.include_time_for_profile && procedure.is_profile();

  Ok(match query.format {
    ResultFormat::Count => {
      ResultSet::Count { count: parts.iter().map(|p| p.result.row_count()).sum() }
    }
    ResultFormat::CsvFlat => {
      let blocks: Vec<FlatBlock<'_>> = parts
        .iter()
        .map(|p| FlatBlock { result: &p.result, instant: p.instant })
        .collect();
      let (content, row_count) = format::csv_flat(&procedure.id, &blocks);
      ResultSet::Text { content, row_count }
    }
    ResultFormat::Csv => {
      let block = data_block(&parts, &columns, query.include_id_in_data_block, with_time);
      ResultSet::Text { content: format::csv(&block), row_count: block.row_count() }
    }
    ResultFormat::DataArray => ResultSet::DataArray {
      result: data_block(&parts, &columns, query.include_id_in_data_block, with_time),
    },
  })
}

fn main_key(row: &ResultRow) -> f64 { row.main().as_f64().unwrap_or(f64::NAN) }

/// Merge every block into one series ordered by the main field, decimate it
/// once to `k` points and split the outcome back into runs of one instant.
/// Reduced rows are numbered `<procedure>-dec-<n>` in output order.
fn decimated_parts(
  procedure: &Procedure,
  fields: &[Field],
  blocks: Vec<Block<'_>>,
  k: usize,
) -> Result<(Vec<Part>, Vec<Field>)> {
  let mut merged: Vec<(ResultRow, String, Option<DateTime<Utc>>)> = Vec::new();
  for (stored, result, rows) in blocks {
    let instant = profile_instant(procedure, stored);
    let ids = row_ids(stored, &rows);
    merged.extend(result.rows.into_iter().zip(ids).map(|(row, id)| (row, id, instant)));
  }
  if merged.is_empty() {
    return Ok((Vec::new(), fields.to_vec()));
  }
  merged.sort_by(|a, b| main_key(&a.0).total_cmp(&main_key(&b.0)));

  let mut rows = Vec::with_capacity(merged.len());
  let mut origins = Vec::with_capacity(merged.len());
  for (row, id, instant) in merged {
    rows.push(row);
    origins.push((id, instant));
  }
  let decimated = decimate(&ComplexResult::with_rows(fields.to_vec(), rows), k)?;
  let reduced = decimated.buckets.is_some();
  let columns = decimated.result.fields.clone();

  let mut parts: Vec<Part> = Vec::new();
  for (n, (row, source)) in decimated.result.rows.into_iter().zip(&decimated.sources).enumerate() {
    let Some((id, instant)) = origins.get(*source) else { continue };
    let id = if reduced { format!("{}-dec-{n}", procedure.id) } else { id.clone() };
    match parts.last_mut() {
      Some(part) if part.instant == *instant => {
        part.result.rows.push(row);
        part.ids.push(id);
      }
      _ => parts.push(Part {
        result:  ComplexResult::with_rows(columns.clone(), vec![row]),
        ids:     vec![id],
        instant: *instant,
      }),
    }
  }
  Ok((parts, columns))
}

fn empty(query: &ResultQuery) -> ResultSet {
  match (query.entity, query.format) {
    (_, ResultFormat::Count) => ResultSet::Count { count: 0 },
    (EntityKind::Measurement, _) => ResultSet::Measures { measures: Vec::new() },
    (_, ResultFormat::DataArray) => ResultSet::DataArray { result: ComplexResult::default() },
    _ => ResultSet::Text { content: String::new(), row_count: 0 },
  }
}

fn measures_of(result: &ComplexResult) -> Vec<MeasureResult> {
  let mut measures = Vec::new();
  for row in 0..result.row_count() {
    for (index, field) in result.measured_fields().iter().enumerate() {
      if let Some(value) = result.measured_value(row, index).filter(|v| !v.is_null()) {
        measures.push(MeasureResult { field: field.clone(), value: value.clone() });
      }
    }
  }
  measures
}

/// Concatenate parts over `columns`: `id` first when requested, then the
/// main column, then the profile `time` when requested.
fn data_block(parts: &[Part], columns: &[Field], with_id: bool, with_time: bool) -> ComplexResult {
  let mut fields = columns.to_vec();
  if with_time {
    fields.insert(1.min(fields.len()), Field::time("time"));
  }
  if with_id {
    fields.insert(0, Field::text("id"));
  }

  let mut rows = Vec::new();
  for part in parts {
    let time = part.instant.map_or(FieldValue::Null, FieldValue::Time);
    for (row, id) in part.result.project(columns).rows.into_iter().zip(&part.ids) {
      let mut values = row.values;
      if with_time {
        values.insert(1.min(values.len()), time.clone());
      }
      if with_id {
        values.insert(0, FieldValue::Text(id.clone()));
      }
      rows.push(ResultRow::new(values));
    }
  }
  ComplexResult::with_rows(fields, rows)
}

// ─── Entities ────────────────────────────────────────────────────────────────

pub fn phenomena(
  snapshot: &StoreSnapshot,
  query: &EntityQuery,
  config: &StoreConfig,
) -> Result<Vec<Phenomenon>> {
  let predicate = filter::compile(query.filter.as_ref())?;
  let kept: Vec<Phenomenon> = snapshot
    .phenomena
    .iter()
    .filter(|phenomenon| {
      let id = phenomenon.id();
      let alone = EvalContext {
        entity_id: Some(id),
        phenomenon: Some(phenomenon),
        ..Default::default()
      };
      let related = snapshot
        .observations
        .values()
        .filter(|o| snapshot.phenomenon_of(&o.header).is_some_and(|p| p.has_component(id) || p.id() == id))
        .map(|o| EvalContext {
          entity_id: Some(id),
          phenomenon: Some(phenomenon),
          ..observation_context(snapshot, o)
        });
      entity_matches(predicate.as_ref(), alone, related)
    })
    .cloned()
    .collect();
  Ok(page(kept, query.offset, limit(query.limit, config)))
}

/// A procedure, or its offering, judged through its observations. `bbox`
/// looks at the procedure's last location.
fn procedure_matches(
  snapshot: &StoreSnapshot,
  predicate: Option<&Predicate>,
  procedure: &Procedure,
  entity_id: &str,
) -> bool {
  let alone = EvalContext {
    entity_id: Some(entity_id),
    procedure: Some(procedure),
    locate_procedure: true,
    ..Default::default()
  };
  let related = snapshot.observations_of(&procedure.id).map(|o| EvalContext {
    entity_id: Some(entity_id),
    locate_procedure: true,
    ..observation_context(snapshot, o)
  });
  entity_matches(predicate, alone, related)
}

pub fn procedures(
  snapshot: &StoreSnapshot,
  query: &EntityQuery,
  config: &StoreConfig,
) -> Result<Vec<Procedure>> {
  let predicate = filter::compile(query.filter.as_ref())?;
  let kept: Vec<Procedure> = snapshot
    .procedures
    .values()
    .filter(|p| procedure_matches(snapshot, predicate.as_ref(), p, &p.id))
    .cloned()
    .collect();
  Ok(page(kept, query.offset, limit(query.limit, config)))
}

pub fn features(
  snapshot: &StoreSnapshot,
  query: &EntityQuery,
  config: &StoreConfig,
) -> Result<Vec<SamplingFeature>> {
  let predicate = filter::compile(query.filter.as_ref())?;
  let kept: Vec<SamplingFeature> = snapshot
    .features
    .values()
    .filter(|feature| {
      let alone = EvalContext {
        entity_id: Some(&feature.id),
        feature: Some(feature),
        ..Default::default()
      };
      let related = snapshot
        .observations
        .values()
        .filter(|o| o.header.feature.as_deref() == Some(feature.id.as_str()))
        .map(|o| EvalContext { entity_id: Some(&feature.id), ..observation_context(snapshot, o) });
      entity_matches(predicate.as_ref(), alone, related)
    })
    .cloned()
    .collect();
  Ok(page(kept, query.offset, limit(query.limit, config)))
}

/// The offering derived from `procedure`'s observations.
pub fn offering_of(snapshot: &StoreSnapshot, procedure: &Procedure) -> Offering {
  let observations: Vec<&StoredObservation> = snapshot.observations_of(&procedure.id).collect();
  let phenomena: BTreeSet<&str> = observations
    .iter()
    .filter_map(|o| o.header.phenomenon.as_deref())
    .collect();
  Offering {
    id:        procedure.offering_id(),
    procedure: procedure.id.clone(),
    time:      TemporalExtent::union_all(observations.iter().map(|o| &o.header.extent)),
    phenomena: phenomena.into_iter().map(str::to_owned).collect(),
    features:  snapshot.feature_ids_of(&procedure.id).into_iter().map(str::to_owned).collect(),
  }
}

pub fn offerings(
  snapshot: &StoreSnapshot,
  query: &EntityQuery,
  config: &StoreConfig,
) -> Result<Vec<Offering>> {
  let predicate = filter::compile(query.filter.as_ref())?;
  let mut kept: Vec<Offering> = snapshot
    .procedures
    .values()
    .filter(|p| procedure_matches(snapshot, predicate.as_ref(), p, &p.offering_id()))
    .map(|p| offering_of(snapshot, p))
    .collect();
  kept.sort_by(|a, b| a.id.cmp(&b.id));
  Ok(page(kept, query.offset, limit(query.limit, config)))
}

// ─── Extracts ────────────────────────────────────────────────────────────────

/// `extract_results`: the selected observations with everything they refer
/// to. Timeseries rows outside a time selection are left out.
pub fn extract(snapshot: &StoreSnapshot, query: &DatasetQuery) -> DatasetExtract {
  let mut extract = DatasetExtract::default();
  let mut procedures = BTreeSet::new();
  let mut phenomena: BTreeMap<&str, Phenomenon> = BTreeMap::new();
  let mut features = BTreeSet::new();

  for stored in snapshot.observations.values().filter(|o| query.selects(&o.header)) {
    let mut observation = snapshot.resolve(stored);
    let timeseries = snapshot.procedure(&stored.header.procedure).is_some_and(|p| !p.is_profile());
    if let (Some(window), true, ObservationResult::Complex(result)) =
      (query.time, timeseries, &mut observation.result)
    {
      result.rows.retain(|r| r.main().as_time().is_some_and(|t| window.contains(t)));
      if result.rows.is_empty() {
        continue;
      }
      observation.sampling_time = result.main_extent();
    }

    procedures.insert(stored.header.procedure.as_str());
    if let Some(feature) = stored.header.feature.as_deref() {
      features.insert(feature);
    }
    if let Some(phenomenon) = snapshot.phenomenon_of(&stored.header) {
      for component in phenomenon.components() {
        let record = snapshot.phenomena.get(&component.id).cloned();
        phenomena
          .entry(component.id.as_str())
          .or_insert_with(|| record.unwrap_or_else(|| component.clone().into()));
      }
      phenomena.insert(phenomenon.id(), phenomenon.clone());
    }
    extract.time = match (extract.time, observation.sampling_time) {
      (Some(a), Some(b)) => Some(a.union(&b)),
      (a, b) => a.or(b),
    };
    extract.observations.push(observation);
  }

  extract.procedures = procedures.into_iter().filter_map(|id| snapshot.procedure(id).cloned()).collect();
  extract.phenomena = phenomena.into_values().collect();
  extract.features = features.into_iter().filter_map(|id| snapshot.features.get(id).cloned()).collect();
  extract.spatial_bound = extract
    .features
    .iter()
    .filter_map(|f| f.geometry.as_ref()?.envelope())
    .reduce(|a, b| a.union(&b));
  extract
}
