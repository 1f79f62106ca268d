//! [`SqliteStore`]: the SQLite implementation of [`ObservationStore`].
//!
//! Every call follows the same shape: load the part of the store it needs
//! into a [`StoreSnapshot`] in one connection call, let `omstore-core` decide,
//! then (for mutations) apply the decision in one transaction.

use std::{
  collections::{BTreeMap, BTreeSet},
  path::Path,
  sync::Arc,
};

use rusqlite::{OptionalExtension as _, types::Value};
use tracing::{debug, info};

use omstore_core::{
  allocator::FieldLedger,
  assemble,
  config::StoreConfig,
  feature::SamplingFeature,
  filter::{self, Predicate, Pushdown},
  merge::{self, NewObservation, WriteContext, WritePlan, WriteTarget},
  observation::Observation,
  offering::{DatasetExtract, Offering},
  phenomenon::Phenomenon,
  procedure::{self, Procedure},
  query::{
    DatasetQuery, EntityQuery, EntityType, ObservationQuery, ResponseMode, ResultQuery, ResultSet,
  },
  removal::{self, DatasetRemoval, PhenomenonRemoval},
  snapshot::{StoreSnapshot, StoredObservation},
  store::ObservationStore,
  template::TemplateOptions,
};

use crate::{
  Error, Result,
  encode::{
    RawComponent, RawFeature, RawField, RawLocation, RawMeasureTable, RawObservation,
    RawPhenomenon, RawProcedure, RawProperty, RawWidth, collect_properties, decode_phenomena, encode_dt,
    encode_extent, encode_phenomenon_kind, encode_properties, encode_value,
  },
  lock::WriteGate,
  schema::{
    MEASURE_PREFIX, SCHEMA, create_measure_table, measure_table, parse_measure_table, value_column,
  },
};

// ─── Store ───────────────────────────────────────────────────────────────────

/// An observation store backed by a single SQLite file.
///
/// Cloning is cheap: the connection and the write gate are shared.
#[derive(Clone)]
pub struct SqliteStore {
  conn:   tokio_rusqlite::Connection,
  config: StoreConfig,
  gate:   Arc<WriteGate>,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    Self::init(conn).await
  }

  /// Open an in-memory store, useful for testing.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    Self::init(conn).await
  }

  /// Replace the default tuning knobs.
  pub fn with_config(mut self, config: StoreConfig) -> Result<Self> {
    config.validate()?;
    self.config = config;
    Ok(self)
  }

  pub fn config(&self) -> &StoreConfig { &self.config }

  async fn init(conn: tokio_rusqlite::Connection) -> Result<Self> {
    conn
      .call(|conn| {
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(Self {
      conn,
      config: StoreConfig::default(),
      gate: Arc::new(WriteGate::new()),
    })
  }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// What a call loads. Phenomena and features are always loaded whole.
#[derive(Debug, Clone, Default)]
struct Scope {
  /// Restrict procedures (and their observations); `None` loads them all.
  procedures: Option<BTreeSet<String>>,
  /// Load the rows of the observations this pushdown admits. `None` loads
  /// headers only.
  rows:       Option<Pushdown>,
}

impl Scope {
  fn all() -> Self { Self::default() }

  fn procedure(id: &str) -> Self {
    Self { procedures: Some(BTreeSet::from([id.to_owned()])), rows: None }
  }

  fn with_rows(mut self, rows: Option<Pushdown>) -> Self {
    self.rows = rows;
    self
  }
}

/// Rows are needed when the answer carries data or when the predicate looks
/// at individual rows.
fn rows_for(predicate: Option<&Predicate>, carries_data: bool) -> Option<Pushdown> {
  match predicate {
    Some(p) if carries_data || p.has_row_terms() => Some(Pushdown::of(p)),
    Some(_) => None,
    None => carries_data.then(Pushdown::default),
  }
}

fn dataset_pushdown(query: &DatasetQuery) -> Pushdown {
  let set = |ids: &[String]| (!ids.is_empty()).then(|| ids.iter().cloned().collect());
  Pushdown {
    procedures:   set(&query.procedures),
    observations: None,
    features:     set(&query.features),
    begins_by:    query.time.map(|t| t.end()),
    ends_from:    query.time.map(|t| t.begin()),
  }
}

fn placeholders(n: usize) -> String {
  if n == 0 { "NULL".to_owned() } else { vec!["?"; n].join(", ") }
}

/// `WHERE` conditions on `observations o` matching `pushdown`.
fn pushdown_conditions(pushdown: &Pushdown, conds: &mut Vec<String>, params: &mut Vec<Value>) {
  let sets = [
    ("o.procedure_id", &pushdown.procedures),
    ("o.observation_id", &pushdown.observations),
    ("o.feature_id", &pushdown.features),
  ];
  for (column, set) in sets {
    if let Some(set) = set {
      conds.push(format!("{column} IN ({})", placeholders(set.len())));
      params.extend(set.iter().cloned().map(Value::Text));
    }
  }
  if let Some(t) = pushdown.begins_by {
    conds.push("o.begin_time <= ?".to_owned());
    params.push(Value::Text(encode_dt(t)));
  }
  if let Some(t) = pushdown.ends_from {
    conds.push("o.end_time >= ?".to_owned());
    params.push(Value::Text(encode_dt(t)));
  }
}

fn where_clause(conds: &[String]) -> String {
  if conds.is_empty() { String::new() } else { format!("WHERE {}", conds.join(" AND ")) }
}

/// Everything a snapshot is built from, as stored.
#[derive(Default)]
struct RawSnapshot {
  procedures:            Vec<RawProcedure>,
  fields:                Vec<RawField>,
  widths:                Vec<RawWidth>,
  procedure_properties:  Vec<RawProperty>,
  locations:             Vec<RawLocation>,
  phenomena:             Vec<RawPhenomenon>,
  components:            Vec<RawComponent>,
  phenomenon_properties: Vec<RawProperty>,
  features:              Vec<RawFeature>,
  feature_properties:    Vec<RawProperty>,
  observations:          Vec<RawObservation>,
  /// Observations whose rows were loaded.
  with_rows:             BTreeSet<String>,
  measures:              Vec<RawMeasureTable>,
}

fn read_properties(conn: &rusqlite::Connection, table: &str, owner: &str) -> rusqlite::Result<Vec<RawProperty>> {
  let mut stmt = conn.prepare(&format!(
    "SELECT {owner}, key, value FROM {table} ORDER BY {owner}, key, position, rowid"
  ))?;
  stmt
    .query_map([], |row| {
      Ok(RawProperty { owner: row.get(0)?, key: row.get(1)?, value: row.get(2)? })
    })?
    .collect()
}

fn read_raw(conn: &rusqlite::Connection, scope: &Scope) -> rusqlite::Result<RawSnapshot> {
  let mut raw = RawSnapshot::default();

  let (proc_cond, proc_params): (Option<String>, Vec<Value>) = match &scope.procedures {
    Some(ids) => (
      Some(format!("procedure_id IN ({})", placeholders(ids.len()))),
      ids.iter().cloned().map(Value::Text).collect(),
    ),
    None => (None, Vec::new()),
  };

  let mut stmt = conn.prepare(&format!(
    "SELECT pid, procedure_id, name, description, sensor_type, shape, phenomenon_id,
            max_width, main_field
     FROM procedures {}
     ORDER BY procedure_id",
    where_clause(proc_cond.as_slice())
  ))?;
  raw.procedures = stmt
    .query_map(rusqlite::params_from_iter(proc_params.iter()), |row| {
      Ok(RawProcedure {
        pid:           row.get(0)?,
        procedure_id:  row.get(1)?,
        name:          row.get(2)?,
        description:   row.get(3)?,
        sensor_type:   row.get(4)?,
        shape:         row.get(5)?,
        phenomenon_id: row.get(6)?,
        max_width:     row.get(7)?,
        main_field:    row.get(8)?,
      })
    })?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  let loaded: BTreeSet<String> = raw.procedures.iter().map(|p| p.procedure_id.clone()).collect();
  let pids: BTreeSet<i64> = raw.procedures.iter().map(|p| p.pid).collect();

  let mut stmt = conn.prepare(
    "SELECT procedure_id, table_index, column_index, field
     FROM procedure_fields ORDER BY procedure_id, position",
  )?;
  raw.fields = stmt
    .query_map([], |row| {
      Ok(RawField {
        procedure_id: row.get(0)?,
        table_index:  row.get(1)?,
        column_index: row.get(2)?,
        field:        row.get(3)?,
      })
    })?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  raw.fields.retain(|f| loaded.contains(&f.procedure_id));

  let mut stmt = conn.prepare(
    "SELECT procedure_id, table_index, width FROM measure_widths ORDER BY procedure_id, table_index",
  )?;
  raw.widths = stmt
    .query_map([], |row| {
      Ok(RawWidth { procedure_id: row.get(0)?, table_index: row.get(1)?, width: row.get(2)? })
    })?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  raw.widths.retain(|w| loaded.contains(&w.procedure_id));

  raw.procedure_properties = read_properties(conn, "procedure_properties", "procedure_id")?;
  raw.procedure_properties.retain(|p| loaded.contains(&p.owner));

  let mut stmt = conn.prepare(
    "SELECT procedure_id, time, geometry FROM historical_locations ORDER BY procedure_id, time",
  )?;
  raw.locations = stmt
    .query_map([], |row| {
      Ok(RawLocation { procedure_id: row.get(0)?, time: row.get(1)?, geometry: row.get(2)? })
    })?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  raw.locations.retain(|l| loaded.contains(&l.procedure_id));

  let mut stmt = conn.prepare(
    "SELECT phenomenon_id, kind, name, definition, description FROM phenomena ORDER BY phenomenon_id",
  )?;
  raw.phenomena = stmt
    .query_map([], |row| {
      Ok(RawPhenomenon {
        id:          row.get(0)?,
        kind:        row.get(1)?,
        name:        row.get(2)?,
        definition:  row.get(3)?,
        description: row.get(4)?,
      })
    })?
    .collect::<rusqlite::Result<Vec<_>>>()?;

  let mut stmt = conn.prepare(
    "SELECT composite_id, component_id FROM phenomenon_components ORDER BY composite_id, position",
  )?;
  raw.components = stmt
    .query_map([], |row| Ok(RawComponent { composite_id: row.get(0)?, component_id: row.get(1)? }))?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  raw.phenomenon_properties = read_properties(conn, "phenomenon_properties", "phenomenon_id")?;

  let mut stmt = conn.prepare(
    "SELECT feature_id, name, description, geometry, sampled_feature
     FROM sampling_features ORDER BY feature_id",
  )?;
  raw.features = stmt
    .query_map([], |row| {
      Ok(RawFeature {
        id:              row.get(0)?,
        name:            row.get(1)?,
        description:     row.get(2)?,
        geometry:        row.get(3)?,
        sampled_feature: row.get(4)?,
      })
    })?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  raw.feature_properties = read_properties(conn, "feature_properties", "feature_id")?;

  let obs_cond: Vec<String> = proc_cond.iter().map(|c| format!("o.{c}")).collect();
  let mut stmt = conn.prepare(&format!(
    "SELECT o.observation_id, o.procedure_id, o.name, o.phenomenon_id, o.feature_id,
            o.begin_time, o.end_time, o.result_quality
     FROM observations o {}
     ORDER BY o.observation_id",
    where_clause(&obs_cond)
  ))?;
  raw.observations = stmt
    .query_map(rusqlite::params_from_iter(proc_params.iter()), |row| {
      Ok(RawObservation {
        id:             row.get(0)?,
        procedure_id:   row.get(1)?,
        name:           row.get(2)?,
        phenomenon_id:  row.get(3)?,
        feature_id:     row.get(4)?,
        begin_time:     row.get(5)?,
        end_time:       row.get(6)?,
        result_quality: row.get(7)?,
      })
    })?
    .collect::<rusqlite::Result<Vec<_>>>()?;

  let Some(pushdown) = &scope.rows else {
    return Ok(raw);
  };

  let mut conds = obs_cond;
  let mut params = proc_params;
  pushdown_conditions(pushdown, &mut conds, &mut params);
  let filter = where_clause(&conds);

  let mut stmt = conn.prepare(&format!("SELECT o.observation_id FROM observations o {filter}"))?;
  raw.with_rows = stmt
    .query_map(rusqlite::params_from_iter(params.iter()), |row| row.get(0))?
    .collect::<rusqlite::Result<BTreeSet<String>>>()?;
  if raw.with_rows.is_empty() {
    return Ok(raw);
  }

  for (pid, table) in measure_tables(conn)? {
    if !pids.contains(&pid) {
      continue;
    }
    let mut stmt = conn.prepare(&format!(
      "SELECT m.* FROM {} m JOIN observations o ON o.observation_id = m.observation_id {filter}",
      measure_table(pid, table)
    ))?;
    let columns: Vec<String> = stmt.column_names().iter().skip(1).map(|c| (*c).to_owned()).collect();
    let width = columns.len();
    let rows = stmt
      .query_map(rusqlite::params_from_iter(params.iter()), |row| {
        let observation: String = row.get(0)?;
        let values = (1..=width).map(|i| row.get::<_, Value>(i)).collect::<rusqlite::Result<Vec<_>>>()?;
        Ok((observation, values))
      })?
      .collect::<rusqlite::Result<Vec<_>>>()?;
    raw.measures.push(RawMeasureTable { pid, table, columns, rows });
  }

  Ok(raw)
}

/// Every measure table in the database, as `(pid, table)`.
fn measure_tables(conn: &rusqlite::Connection) -> rusqlite::Result<Vec<(i64, usize)>> {
  let mut stmt = conn.prepare(
    "SELECT name FROM sqlite_master WHERE type = 'table' AND substr(name, 1, ?1) = ?2 ORDER BY name",
  )?;
  let names = stmt
    .query_map(rusqlite::params![MEASURE_PREFIX.len() as i64, MEASURE_PREFIX], |row| {
      row.get::<_, String>(0)
    })?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  Ok(names.iter().filter_map(|n| parse_measure_table(n)).collect())
}

impl RawSnapshot {
  fn into_snapshot(self) -> Result<StoreSnapshot> {
    let mut snapshot = StoreSnapshot::default();

    let mut fields: BTreeMap<String, Vec<RawField>> = BTreeMap::new();
    for f in self.fields {
      fields.entry(f.procedure_id.clone()).or_default().push(f);
    }
    let mut widths: BTreeMap<String, Vec<RawWidth>> = BTreeMap::new();
    for w in self.widths {
      widths.entry(w.procedure_id.clone()).or_default().push(w);
    }
    let mut locations: BTreeMap<String, Vec<RawLocation>> = BTreeMap::new();
    for l in self.locations {
      locations.entry(l.procedure_id.clone()).or_default().push(l);
    }
    let mut properties = collect_properties(self.procedure_properties);

    let mut by_pid: BTreeMap<i64, String> = BTreeMap::new();
    for raw in self.procedures {
      let id = raw.procedure_id.clone();
      let ledger = raw.ledger(
        fields.get(&id).map(Vec::as_slice).unwrap_or_default(),
        widths.get(&id).map(Vec::as_slice).unwrap_or_default(),
      )?;
      by_pid.insert(raw.pid, id.clone());
      let procedure = raw.into_procedure(
        &ledger,
        properties.remove(&id).unwrap_or_default(),
        locations.remove(&id).unwrap_or_default(),
      )?;
      snapshot.procedures.insert(id.clone(), procedure);
      snapshot.ledgers.insert(id, ledger);
    }

    snapshot.phenomena = decode_phenomena(
      self.phenomena,
      self.components,
      collect_properties(self.phenomenon_properties),
    )?;

    let mut feature_properties = collect_properties(self.feature_properties);
    for raw in self.features {
      let props = feature_properties.remove(&raw.id).unwrap_or_default();
      let feature = raw.into_feature(props)?;
      snapshot.features.insert(feature.id.clone(), feature);
    }

    let mut tables: BTreeMap<String, Vec<_>> = BTreeMap::new();
    for measure in self.measures {
      let Some(ledger) = by_pid.get(&measure.pid).and_then(|id| snapshot.ledgers.get(id)) else {
        continue;
      };
      for (observation, rows) in measure.decode(ledger)? {
        tables.entry(observation).or_default().push(rows);
      }
    }

    for raw in self.observations {
      let header = raw.into_header()?;
      let result = match snapshot.ledgers.get(&header.procedure) {
        Some(ledger) if self.with_rows.contains(&header.id) => {
          Some(ledger.reconstruct(tables.get(&header.id).map(Vec::as_slice).unwrap_or_default()))
        }
        _ => None,
      };
      snapshot.observations.insert(header.id.clone(), StoredObservation { header, result });
    }

    Ok(snapshot)
  }
}

impl SqliteStore {
  /// Load a consistent snapshot: every read happens in one connection call.
  async fn load(&self, scope: Scope) -> Result<StoreSnapshot> {
    let raw = self.conn.call(move |conn| Ok(read_raw(conn, &scope)?)).await?;
    let snapshot = raw.into_snapshot()?;
    debug!(
      procedures = snapshot.procedures.len(),
      observations = snapshot.observations.len(),
      "loaded snapshot"
    );
    Ok(snapshot)
  }

  /// Snapshot for an observation query: rows only when needed, and then only
  /// for observations the filter's storage-side conditions admit.
  async fn load_for(&self, query: &ObservationQuery) -> Result<StoreSnapshot> {
    let predicate = filter::compile(query.filter.as_ref())?;
    let inline = query.mode == ResponseMode::Inline;
    self.load(Scope::all().with_rows(rows_for(predicate.as_ref(), inline))).await
  }

  async fn load_for_entities(&self, query: &EntityQuery) -> Result<StoreSnapshot> {
    let predicate = filter::compile(query.filter.as_ref())?;
    self.load(Scope::all().with_rows(rows_for(predicate.as_ref(), false))).await
  }
}

// ─── Writing ─────────────────────────────────────────────────────────────────

struct EncodedPhenomenon {
  id:          String,
  kind:        &'static str,
  name:        Option<String>,
  definition:  Option<String>,
  description: Option<String>,
  components:  Vec<String>,
  properties:  Vec<(String, String, i64)>,
}

impl From<&Phenomenon> for EncodedPhenomenon {
  fn from(p: &Phenomenon) -> Self {
    let (definition, description, components) = match p {
      Phenomenon::Simple(s) => (s.definition.clone(), s.description.clone(), Vec::new()),
      Phenomenon::Composite(c) => (
        c.definition.clone(),
        c.description.clone(),
        c.components.iter().map(|s| s.id.clone()).collect(),
      ),
    };
    Self {
      id: p.id().to_owned(),
      kind: encode_phenomenon_kind(p),
      name: p.name().map(str::to_owned),
      definition,
      description,
      components,
      properties: encode_properties(p.properties()),
    }
  }
}

/// Phenomena a write must find stored: the records it created, then the
/// covering phenomenon and its components. Simple records come first.
fn phenomena_to_store(plan: &WritePlan) -> Vec<EncodedPhenomenon> {
  let covering = &plan.composition.phenomenon;
  let mut all: Vec<Phenomenon> = plan.composition.created.clone();
  all.extend(covering.components().into_iter().cloned().map(Phenomenon::Simple));
  all.push(covering.clone());

  let mut seen = BTreeSet::new();
  all.sort_by_key(Phenomenon::is_composite);
  all
    .iter()
    .filter(|p| seen.insert(p.id().to_owned()))
    .map(EncodedPhenomenon::from)
    .collect()
}

struct EncodedFeature {
  id:              String,
  name:            Option<String>,
  description:     Option<String>,
  geometry:        Option<String>,
  sampled_feature: Option<String>,
  properties:      Vec<(String, String, i64)>,
}

impl EncodedFeature {
  fn new(feature: &SamplingFeature) -> Result<Self> {
    Ok(Self {
      id:              feature.id.clone(),
      name:            feature.name.clone(),
      description:     feature.description.clone(),
      geometry:        feature.geometry.as_ref().map(serde_json::to_string).transpose()?,
      sampled_feature: feature.sampled_feature.clone(),
      properties:      encode_properties(&feature.properties),
    })
  }
}

struct EncodedRows {
  table:   usize,
  width:   usize,
  columns: Vec<usize>,
  rows:    Vec<Vec<Value>>,
}

/// A [`WritePlan`] reduced to SQL parameters.
struct EncodedWrite {
  procedure_id:   String,
  name:           Option<String>,
  description:    Option<String>,
  sensor_type:    String,
  shape:          String,
  phenomenon_id:  String,
  max_width:      i64,
  main_field:     Option<String>,
  properties:     Vec<(String, String, i64)>,
  locations:      Vec<(String, String)>,
  /// `(name, table, column, field)`, in field order.
  placements:     Vec<(String, i64, i64, String)>,
  phenomena:      Vec<EncodedPhenomenon>,
  feature:        Option<EncodedFeature>,
  target:         WriteTarget,
  obs_name:       Option<String>,
  begin:          String,
  end:            String,
  result_quality: String,
  tables:         Vec<EncodedRows>,
  retire:         Vec<String>,
}

impl EncodedWrite {
  fn new(plan: &WritePlan) -> Result<Self> {
    let procedure = &plan.procedure;
    let placements = plan
      .allocation
      .new_placements
      .iter()
      .map(|p| {
        Ok((
          p.field.name.clone(),
          p.table as i64,
          p.column as i64,
          serde_json::to_string(&p.field)?,
        ))
      })
      .collect::<Result<Vec<_>>>()?;
    let locations = procedure
      .locations
      .iter()
      .map(|l| Ok((encode_dt(l.time), serde_json::to_string(&l.geometry)?)))
      .collect::<Result<Vec<_>>>()?;

    let mut tables: Vec<EncodedRows> = plan
      .tables
      .iter()
      .map(|slice| EncodedRows {
        table:   slice.table,
        width:   plan.ledger.table_width(slice.table),
        columns: slice.columns.clone(),
        rows:    slice
          .rows
          .iter()
          .map(|r| r.values.iter().map(encode_value).collect())
          .collect(),
      })
      .collect();
    for table in &plan.allocation.opened_tables {
      if !tables.iter().any(|t| t.table == *table) {
        tables.push(EncodedRows {
          table:   *table,
          width:   plan.ledger.table_width(*table),
          columns: Vec::new(),
          rows:    Vec::new(),
        });
      }
    }

    let (begin, end) = encode_extent(&plan.extent);
    Ok(Self {
      procedure_id: procedure.id.clone(),
      name: procedure.name.clone(),
      description: procedure.description.clone(),
      sensor_type: procedure.sensor_type.to_string(),
      shape: procedure.shape.to_string(),
      phenomenon_id: plan.phenomenon_id().to_owned(),
      max_width: plan.ledger.max_width as i64,
      main_field: plan.ledger.main.as_ref().map(serde_json::to_string).transpose()?,
      properties: encode_properties(&procedure.properties),
      locations,
      placements,
      phenomena: phenomena_to_store(plan),
      feature: plan.feature.as_ref().map(EncodedFeature::new).transpose()?,
      target: plan.target.clone(),
      obs_name: plan.name.clone(),
      begin,
      end,
      result_quality: serde_json::to_string(&plan.result_quality)?,
      tables,
      retire: plan.retire.clone(),
    })
  }
}

fn insert_properties(
  conn: &rusqlite::Connection,
  table: &str,
  owner_column: &str,
  owner: &str,
  properties: &[(String, String, i64)],
) -> rusqlite::Result<()> {
  let mut stmt = conn.prepare(&format!(
    "INSERT OR IGNORE INTO {table} ({owner_column}, key, value, position) VALUES (?1, ?2, ?3, ?4)"
  ))?;
  for (key, value, position) in properties {
    stmt.execute(rusqlite::params![owner, key, value, position])?;
  }
  Ok(())
}

fn ensure_phenomenon(conn: &rusqlite::Connection, p: &EncodedPhenomenon) -> rusqlite::Result<()> {
  let inserted = conn.execute(
    "INSERT OR IGNORE INTO phenomena (phenomenon_id, kind, name, definition, description)
     VALUES (?1, ?2, ?3, ?4, ?5)",
    rusqlite::params![p.id, p.kind, p.name, p.definition, p.description],
  )?;
  if inserted == 0 {
    return Ok(());
  }
  for (position, component) in p.components.iter().enumerate() {
    conn.execute(
      "INSERT OR IGNORE INTO phenomenon_components (composite_id, component_id, position)
       VALUES (?1, ?2, ?3)",
      rusqlite::params![p.id, component, position as i64],
    )?;
  }
  insert_properties(conn, "phenomenon_properties", "phenomenon_id", &p.id, &p.properties)
}

fn upsert_feature(conn: &rusqlite::Connection, f: &EncodedFeature) -> rusqlite::Result<()> {
  conn.execute(
    "INSERT INTO sampling_features (feature_id, name, description, geometry, sampled_feature)
     VALUES (?1, ?2, ?3, ?4, ?5)
     ON CONFLICT (feature_id) DO UPDATE SET
       name            = COALESCE(excluded.name, name),
       description     = COALESCE(excluded.description, description),
       geometry        = COALESCE(excluded.geometry, geometry),
       sampled_feature = COALESCE(excluded.sampled_feature, sampled_feature)",
    rusqlite::params![f.id, f.name, f.description, f.geometry, f.sampled_feature],
  )?;
  insert_properties(conn, "feature_properties", "feature_id", &f.id, &f.properties)
}

/// Add the value columns `c0..c{width}` a measure table lacks.
fn ensure_columns(conn: &rusqlite::Connection, table: &str, width: usize) -> rusqlite::Result<()> {
  let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
  let existing = stmt
    .query_map([], |row| row.get::<_, String>(1))?
    .collect::<rusqlite::Result<BTreeSet<_>>>()?;
  for column in (0..width).map(value_column) {
    if !existing.contains(&column) {
      conn.execute(&format!("ALTER TABLE {table} ADD COLUMN {column}"), [])?;
    }
  }
  Ok(())
}

/// Upsert rows keyed by (observation, main). A null incoming value keeps
/// the stored one.
fn upsert_rows(
  conn: &rusqlite::Connection,
  table: &str,
  observation: &str,
  rows: &EncodedRows,
) -> rusqlite::Result<()> {
  let names: Vec<String> = rows.columns.iter().map(|c| value_column(*c)).collect();
  let conflict = if names.is_empty() {
    "DO NOTHING".to_owned()
  } else {
    let sets: Vec<String> = names.iter().map(|n| format!("{n} = COALESCE(excluded.{n}, {n})")).collect();
    format!("DO UPDATE SET {}", sets.join(", "))
  };
  let sql = format!(
    "INSERT INTO {table} (observation_id, main{}) VALUES (?{}) ON CONFLICT (observation_id, main) {conflict}",
    names.iter().map(|n| format!(", {n}")).collect::<String>(),
    ", ?".repeat(names.len() + 1),
  );
  let mut stmt = conn.prepare(&sql)?;
  for values in &rows.rows {
    let params = std::iter::once(Value::Text(observation.to_owned())).chain(values.iter().cloned());
    stmt.execute(rusqlite::params_from_iter(params))?;
  }
  Ok(())
}

fn next_sequence(conn: &rusqlite::Connection, name: &str) -> rusqlite::Result<i64> {
  conn.query_row(
    "INSERT INTO id_sequences (name, next) VALUES (?1, 1)
     ON CONFLICT (name) DO UPDATE SET next = next + 1
     RETURNING next",
    rusqlite::params![name],
    |row| row.get(0),
  )
}

fn observation_exists(conn: &rusqlite::Connection, id: &str) -> rusqlite::Result<bool> {
  Ok(conn
    .query_row("SELECT 1 FROM observations WHERE observation_id = ?1", rusqlite::params![id], |_| Ok(()))
    .optional()?
    .is_some())
}

/// First unused `<procedure>-obs-<n>`.
fn generate_observation_id(conn: &rusqlite::Connection, procedure: &str) -> rusqlite::Result<String> {
  loop {
    let n = next_sequence(conn, &format!("observation:{procedure}"))?;
    let id = format!("{procedure}-obs-{n}");
    if !observation_exists(conn, &id)? {
      return Ok(id);
    }
  }
}

/// Delete `id` unless an observation, a procedure or a composite still uses it.
fn retire_phenomenon(conn: &rusqlite::Connection, id: &str) -> rusqlite::Result<bool> {
  let deleted = conn.execute(
    "DELETE FROM phenomena WHERE phenomenon_id = ?1
       AND NOT EXISTS (SELECT 1 FROM observations WHERE phenomenon_id = ?1)
       AND NOT EXISTS (SELECT 1 FROM procedures WHERE phenomenon_id = ?1)
       AND NOT EXISTS (SELECT 1 FROM phenomenon_components WHERE component_id = ?1)",
    rusqlite::params![id],
  )?;
  Ok(deleted > 0)
}

/// Apply a planned write. `None` when the caller-chosen observation id is
/// taken; nothing is written then.
fn apply_write(conn: &mut rusqlite::Connection, w: &EncodedWrite) -> rusqlite::Result<Option<String>> {
  let tx = conn.transaction()?;

  if let WriteTarget::Create { id: Some(id) } = &w.target
    && observation_exists(&tx, id)?
  {
    return Ok(None);
  }

  for p in &w.phenomena {
    ensure_phenomenon(&tx, p)?;
  }

  let pid: i64 = tx.query_row(
    "INSERT INTO procedures
       (procedure_id, name, description, sensor_type, shape, phenomenon_id, max_width, main_field)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
     ON CONFLICT (procedure_id) DO UPDATE SET
       name          = excluded.name,
       description   = excluded.description,
       phenomenon_id = excluded.phenomenon_id,
       main_field    = excluded.main_field
     RETURNING pid",
    rusqlite::params![
      w.procedure_id,
      w.name,
      w.description,
      w.sensor_type,
      w.shape,
      w.phenomenon_id,
      w.max_width,
      w.main_field,
    ],
    |row| row.get(0),
  )?;

  tx.execute(
    "DELETE FROM procedure_properties WHERE procedure_id = ?1",
    rusqlite::params![w.procedure_id],
  )?;
  insert_properties(&tx, "procedure_properties", "procedure_id", &w.procedure_id, &w.properties)?;
  tx.execute(
    "DELETE FROM historical_locations WHERE procedure_id = ?1",
    rusqlite::params![w.procedure_id],
  )?;
  for (time, geometry) in &w.locations {
    tx.execute(
      "INSERT INTO historical_locations (procedure_id, time, geometry) VALUES (?1, ?2, ?3)",
      rusqlite::params![w.procedure_id, time, geometry],
    )?;
  }

  // Positions only grow: a removed field leaves a gap, never a slot to reuse.
  let next_position: i64 = tx.query_row(
    "SELECT COALESCE(MAX(position) + 1, 0) FROM procedure_fields WHERE procedure_id = ?1",
    rusqlite::params![w.procedure_id],
    |row| row.get(0),
  )?;
  for (offset, (name, table, column, field)) in w.placements.iter().enumerate() {
    tx.execute(
      "INSERT INTO procedure_fields (procedure_id, name, position, table_index, column_index, field)
       VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
      rusqlite::params![w.procedure_id, name, next_position + offset as i64, table, column, field],
    )?;
  }

  if let Some(feature) = &w.feature {
    upsert_feature(&tx, feature)?;
  }
  let feature_id = w.feature.as_ref().map(|f| f.id.as_str());

  let observation = match &w.target {
    WriteTarget::Create { id } => {
      let id = match id {
        Some(id) => id.clone(),
        None => generate_observation_id(&tx, &w.procedure_id)?,
      };
      tx.execute(
        "INSERT INTO observations
           (observation_id, procedure_id, name, phenomenon_id, feature_id,
            begin_time, end_time, result_quality)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        rusqlite::params![
          id,
          w.procedure_id,
          w.obs_name.as_deref().unwrap_or(&id),
          w.phenomenon_id,
          feature_id,
          w.begin,
          w.end,
          w.result_quality,
        ],
      )?;
      id
    }
    WriteTarget::Merge { id, .. } => {
      tx.execute(
        "UPDATE observations SET
           name           = COALESCE(?2, name),
           phenomenon_id  = ?3,
           begin_time     = ?4,
           end_time       = ?5,
           result_quality = ?6
         WHERE observation_id = ?1",
        rusqlite::params![id, w.obs_name, w.phenomenon_id, w.begin, w.end, w.result_quality],
      )?;
      id.clone()
    }
  };

  for rows in &w.tables {
    let table = measure_table(pid, rows.table);
    tx.execute(&create_measure_table(&table), [])?;
    ensure_columns(&tx, &table, rows.width)?;
    tx.execute(
      "INSERT INTO measure_widths (procedure_id, table_index, width) VALUES (?1, ?2, ?3)
       ON CONFLICT (procedure_id, table_index) DO UPDATE SET width = MAX(width, excluded.width)",
      rusqlite::params![w.procedure_id, rows.table as i64, rows.width as i64],
    )?;
    upsert_rows(&tx, &table, &observation, rows)?;
  }

  for id in &w.retire {
    if retire_phenomenon(&tx, id)? {
      debug!(phenomenon = %id, "retired phenomenon");
    }
  }

  tx.commit()?;
  Ok(Some(observation))
}

// ─── Removal ─────────────────────────────────────────────────────────────────

fn procedure_pid(conn: &rusqlite::Connection, procedure: &str) -> rusqlite::Result<Option<i64>> {
  conn
    .query_row(
      "SELECT pid FROM procedures WHERE procedure_id = ?1",
      rusqlite::params![procedure],
      |row| row.get(0),
    )
    .optional()
}

fn tables_of(conn: &rusqlite::Connection, pid: i64) -> rusqlite::Result<Vec<String>> {
  Ok(measure_tables(conn)?
    .into_iter()
    .filter(|(p, _)| *p == pid)
    .map(|(p, t)| measure_table(p, t))
    .collect())
}

fn delete_procedure(conn: &rusqlite::Connection, procedure: &str) -> rusqlite::Result<()> {
  if let Some(pid) = procedure_pid(conn, procedure)? {
    for table in tables_of(conn, pid)? {
      conn.execute(&format!("DROP TABLE IF EXISTS {table}"), [])?;
    }
  }
  conn.execute("DELETE FROM procedures WHERE procedure_id = ?1", rusqlite::params![procedure])?;
  Ok(())
}

fn delete_observation(conn: &rusqlite::Connection, id: &str) -> rusqlite::Result<()> {
  conn.execute("DELETE FROM observations WHERE observation_id = ?1", rusqlite::params![id])?;
  Ok(())
}

fn delete_feature(conn: &rusqlite::Connection, id: &str) -> rusqlite::Result<()> {
  conn.execute("DELETE FROM sampling_features WHERE feature_id = ?1", rusqlite::params![id])?;
  Ok(())
}

/// A removed field: its ledger row goes, its columns are nulled.
struct EncodedDrop {
  procedure: String,
  field:     String,
  table:     usize,
  columns:   Vec<usize>,
}

struct EncodedPhenomenonRemoval {
  delete_observations:   Vec<String>,
  reassign_observations: Vec<(String, String)>,
  create_phenomena:      Vec<EncodedPhenomenon>,
  delete_phenomena:      Vec<String>,
  drop_fields:           Vec<EncodedDrop>,
  /// `(procedure, phenomenon)`.
  update_procedures:     Vec<(String, Option<String>)>,
  delete_procedures:     Vec<String>,
  delete_features:       Vec<String>,
}

impl EncodedPhenomenonRemoval {
  fn new(plan: &PhenomenonRemoval, snapshot: &StoreSnapshot) -> Result<Self> {
    let drop_fields = plan
      .drop_fields
      .iter()
      .map(|drop| {
        let placement = snapshot
          .ledgers
          .get(&drop.procedure)
          .and_then(|l| l.placement(&drop.field))
          .ok_or_else(|| {
            Error::Corrupt(format!("procedure {} has no field {}", drop.procedure, drop.field))
          })?;
        Ok(EncodedDrop {
          procedure: drop.procedure.clone(),
          field:     drop.field.clone(),
          table:     placement.table,
          columns:   placement.columns().collect(),
        })
      })
      .collect::<Result<Vec<_>>>()?;
    let mut create_phenomena = plan.create_phenomena.clone();
    create_phenomena.sort_by_key(Phenomenon::is_composite);
    Ok(Self {
      delete_observations: plan.delete_observations.clone(),
      reassign_observations: plan.reassign_observations.clone(),
      create_phenomena: create_phenomena.iter().map(EncodedPhenomenon::from).collect(),
      delete_phenomena: plan.delete_phenomena.clone(),
      drop_fields,
      update_procedures: plan
        .update_procedures
        .iter()
        .map(|p| (p.id.clone(), p.phenomenon.clone()))
        .collect(),
      delete_procedures: plan.delete_procedures.clone(),
      delete_features: plan.delete_features.clone(),
    })
  }
}

fn apply_phenomenon_removal(
  conn: &mut rusqlite::Connection,
  r: &EncodedPhenomenonRemoval,
) -> rusqlite::Result<()> {
  let tx = conn.transaction()?;

  for id in &r.delete_observations {
    delete_observation(&tx, id)?;
  }
  for p in &r.create_phenomena {
    ensure_phenomenon(&tx, p)?;
  }
  for (observation, phenomenon) in &r.reassign_observations {
    tx.execute(
      "UPDATE observations SET phenomenon_id = ?2 WHERE observation_id = ?1",
      rusqlite::params![observation, phenomenon],
    )?;
  }
  for drop in &r.drop_fields {
    let Some(pid) = procedure_pid(&tx, &drop.procedure)? else {
      continue;
    };
    let table = measure_table(pid, drop.table);
    if tables_of(&tx, pid)?.contains(&table) {
      let sets: Vec<String> = drop.columns.iter().map(|c| format!("{} = NULL", value_column(*c))).collect();
      tx.execute(&format!("UPDATE {table} SET {}", sets.join(", ")), [])?;
    }
    tx.execute(
      "DELETE FROM procedure_fields WHERE procedure_id = ?1 AND name = ?2",
      rusqlite::params![drop.procedure, drop.field],
    )?;
  }
  for (procedure, phenomenon) in &r.update_procedures {
    tx.execute(
      "UPDATE procedures SET phenomenon_id = ?2 WHERE procedure_id = ?1",
      rusqlite::params![procedure, phenomenon],
    )?;
  }
  for procedure in &r.delete_procedures {
    delete_procedure(&tx, procedure)?;
  }
  for id in &r.delete_phenomena {
    tx.execute("DELETE FROM phenomena WHERE phenomenon_id = ?1", rusqlite::params![id])?;
  }
  for id in &r.delete_features {
    delete_feature(&tx, id)?;
  }

  tx.commit()
}

/// Rows a trim deletes from every measure table of a procedure.
struct EncodedTrim {
  observation: String,
  procedure:   String,
  mains:       Vec<Value>,
  begin:       String,
  end:         String,
}

fn apply_dataset_removal(
  conn: &mut rusqlite::Connection,
  trims: &[EncodedTrim],
  r: &DatasetRemoval,
) -> rusqlite::Result<()> {
  let tx = conn.transaction()?;

  for trim in trims {
    let Some(pid) = procedure_pid(&tx, &trim.procedure)? else {
      continue;
    };
    for table in tables_of(&tx, pid)? {
      let mut stmt = tx.prepare(&format!(
        "DELETE FROM {table} WHERE observation_id = ?1 AND main = ?2"
      ))?;
      for main in &trim.mains {
        stmt.execute(rusqlite::params![trim.observation, main])?;
      }
    }
    tx.execute(
      "UPDATE observations SET begin_time = ?2, end_time = ?3 WHERE observation_id = ?1",
      rusqlite::params![trim.observation, trim.begin, trim.end],
    )?;
  }
  for id in &r.delete_observations {
    delete_observation(&tx, id)?;
  }
  for procedure in &r.delete_procedures {
    delete_procedure(&tx, procedure)?;
  }
  for id in &r.delete_features {
    delete_feature(&tx, id)?;
  }

  tx.commit()
}

// ─── ObservationStore impl ───────────────────────────────────────────────────

impl ObservationStore for SqliteStore {
  type Error = Error;

  // ── Writes ────────────────────────────────────────────────────────────

  async fn write_observation(&self, input: NewObservation) -> Result<String> {
    let pid = input.procedure.id.clone();
    let _guard = self.gate.procedure(&pid).await;

    let mut snapshot = self.load(Scope::procedure(&pid)).await?;
    let feature = input.feature_of_interest.as_ref().map(|f| f.id.as_str());
    let candidates = snapshot
      .observations_of(&pid)
      .filter(|o| o.header.feature.as_deref() == feature)
      .map(|o| o.header.clone())
      .collect();
    let ctx = WriteContext {
      procedure: snapshot.procedures.remove(&pid),
      ledger: snapshot
        .ledgers
        .remove(&pid)
        .unwrap_or_else(|| FieldLedger::new(self.config.max_fields_per_table)),
      phenomena: snapshot.phenomena,
      candidates,
    };

    let plan = merge::plan_write(&ctx, &input, &self.config)?;

    let encoded = EncodedWrite::new(&plan)?;
    let written = self.conn.call(move |conn| Ok(apply_write(conn, &encoded)?)).await?;
    let Some(id) = written else {
      let id = input.id.unwrap_or_default();
      return Err(omstore_core::Error::Validation(format!("observation id {id} is already taken")).into());
    };
    debug!(
      procedure = %pid,
      observation = %id,
      phenomenon = plan.phenomenon_id(),
      rows = plan.tables.first().map_or(0, |t| t.rows.len()),
      "observation written"
    );
    Ok(id)
  }

  // ── Observations ──────────────────────────────────────────────────────

  async fn get_observations(&self, query: &ObservationQuery) -> Result<Vec<Observation>> {
    let snapshot = self.load_for(query).await?;
    Ok(assemble::observations(&snapshot, query, &self.config)?)
  }

  async fn get_identifiers(&self, query: &ObservationQuery) -> Result<Vec<String>> {
    let snapshot = self.load_for(query).await?;
    Ok(assemble::identifiers(&snapshot, query, &self.config)?)
  }

  async fn get_count(&self, query: &ObservationQuery) -> Result<usize> {
    let snapshot = self.load_for(query).await?;
    Ok(assemble::count(&snapshot, query)?)
  }

  async fn get_results(&self, query: &ResultQuery) -> Result<ResultSet> {
    let predicate = filter::compile(query.filter.as_ref())?;
    let rows = rows_for(predicate.as_ref(), true);
    let snapshot = self.load(Scope::procedure(&query.procedure).with_rows(rows)).await?;
    Ok(assemble::results(&snapshot, query)?)
  }

  async fn get_template(
    &self,
    procedure_id: &str,
    options: TemplateOptions,
  ) -> Result<Option<Observation>> {
    let snapshot = self.load(Scope::procedure(procedure_id)).await?;
    Ok(assemble::template(&snapshot, procedure_id, &options))
  }

  // ── Entities ──────────────────────────────────────────────────────────

  async fn get_phenomena(&self, query: &EntityQuery) -> Result<Vec<Phenomenon>> {
    let snapshot = self.load_for_entities(query).await?;
    Ok(assemble::phenomena(&snapshot, query, &self.config)?)
  }

  async fn get_procedures(&self, query: &EntityQuery) -> Result<Vec<Procedure>> {
    let snapshot = self.load_for_entities(query).await?;
    Ok(assemble::procedures(&snapshot, query, &self.config)?)
  }

  async fn get_features(&self, query: &EntityQuery) -> Result<Vec<SamplingFeature>> {
    let snapshot = self.load_for_entities(query).await?;
    Ok(assemble::features(&snapshot, query, &self.config)?)
  }

  async fn get_offerings(&self, query: &EntityQuery) -> Result<Vec<Offering>> {
    let snapshot = self.load_for_entities(query).await?;
    Ok(assemble::offerings(&snapshot, query, &self.config)?)
  }

  async fn exist_entity(&self, kind: EntityType, id: &str) -> Result<bool> {
    let (sql, key) = match kind {
      EntityType::Procedure => ("SELECT 1 FROM procedures WHERE procedure_id = ?1", id),
      EntityType::Phenomenon => ("SELECT 1 FROM phenomena WHERE phenomenon_id = ?1", id),
      EntityType::Feature => ("SELECT 1 FROM sampling_features WHERE feature_id = ?1", id),
      EntityType::Observation => ("SELECT 1 FROM observations WHERE observation_id = ?1", id),
      EntityType::Offering => match id.strip_prefix(&procedure::offering_id("")) {
        Some(pid) => ("SELECT 1 FROM procedures WHERE procedure_id = ?1", pid),
        None => return Ok(false),
      },
    };
    let key = key.to_owned();
    let found = self
      .conn
      .call(move |conn| {
        Ok(conn.query_row(sql, rusqlite::params![key], |_| Ok(())).optional()?.is_some())
      })
      .await?;
    Ok(found)
  }

  // ── Removal ───────────────────────────────────────────────────────────

  async fn remove_dataset(&self, query: &DatasetQuery) -> Result<()> {
    let _guard = self.gate.cascade().await;
    let rows = query.time.is_some().then(|| dataset_pushdown(query));
    let snapshot = self.load(Scope::all().with_rows(rows)).await?;
    let plan = removal::plan_remove_dataset(&snapshot, query)?;

    let trims: Vec<EncodedTrim> = plan
      .trims
      .iter()
      .map(|trim| {
        let (begin, end) = encode_extent(&trim.extent);
        EncodedTrim {
          observation: trim.observation.clone(),
          procedure: trim.procedure.clone(),
          mains: trim.mains.iter().map(encode_value).collect(),
          begin,
          end,
        }
      })
      .collect();
    let summary = (plan.delete_observations.len(), plan.delete_procedures.len(), plan.delete_features.len());
    self
      .conn
      .call(move |conn| Ok(apply_dataset_removal(conn, &trims, &plan)?))
      .await?;

    info!(
      observations = summary.0,
      procedures = summary.1,
      features = summary.2,
      "dataset removed"
    );
    Ok(())
  }

  async fn remove_phenomenon(&self, id: &str) -> Result<()> {
    let _guard = self.gate.cascade().await;
    let snapshot = self.load(Scope::all()).await?;
    let plan = removal::plan_remove_phenomenon(&snapshot, id);
    if plan.is_empty() {
      debug!(phenomenon = id, "nothing to remove");
      return Ok(());
    }

    let encoded = EncodedPhenomenonRemoval::new(&plan, &snapshot)?;
    self
      .conn
      .call(move |conn| Ok(apply_phenomenon_removal(conn, &encoded)?))
      .await?;

    info!(
      phenomenon = id,
      procedures = plan.delete_procedures.len(),
      observations = plan.delete_observations.len(),
      phenomena = plan.delete_phenomena.len(),
      "phenomenon removed"
    );
    Ok(())
  }

  // ── Extraction ────────────────────────────────────────────────────────

  async fn extract_results(&self, query: &DatasetQuery) -> Result<DatasetExtract> {
    let snapshot = self.load(Scope::all().with_rows(Some(dataset_pushdown(query)))).await?;
    Ok(assemble::extract(&snapshot, query))
  }
}
