//! SQL schema for the omstore SQLite store.
//!
//! Executed once at connection startup. Measure tables are not part of it:
//! they are created per procedure as its field ledger opens them, named by
//! [`measure_table`].

/// Fixed DDL; idempotent thanks to `CREATE TABLE IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

-- `pid` is the numeric handle used in measure table names.
CREATE TABLE IF NOT EXISTS procedures (
    pid           INTEGER PRIMARY KEY AUTOINCREMENT,
    procedure_id  TEXT NOT NULL UNIQUE,
    name          TEXT,
    description   TEXT,
    sensor_type   TEXT NOT NULL,   -- 'system' | 'component'
    shape         TEXT NOT NULL,   -- 'timeseries' | 'profile'
    phenomenon_id TEXT,
    max_width     INTEGER NOT NULL,
    main_field    TEXT             -- JSON-encoded Field
);

-- The append-only field ledger. A row never changes once written; removing a
-- phenomenon deletes its row and nulls the columns it covered.
CREATE TABLE IF NOT EXISTS procedure_fields (
    procedure_id TEXT NOT NULL REFERENCES procedures(procedure_id) ON DELETE CASCADE,
    name         TEXT NOT NULL,
    position     INTEGER NOT NULL,
    table_index  INTEGER NOT NULL,
    column_index INTEGER NOT NULL,
    field        TEXT NOT NULL,    -- JSON-encoded Field, sub-fields included
    PRIMARY KEY (procedure_id, name)
);

-- Widest extent each measure table of a procedure ever reached. Columns of
-- removed fields stay behind, so later fields start past them.
CREATE TABLE IF NOT EXISTS measure_widths (
    procedure_id TEXT NOT NULL REFERENCES procedures(procedure_id) ON DELETE CASCADE,
    table_index  INTEGER NOT NULL,
    width        INTEGER NOT NULL,
    PRIMARY KEY (procedure_id, table_index)
);

CREATE TABLE IF NOT EXISTS procedure_properties (
    procedure_id TEXT NOT NULL REFERENCES procedures(procedure_id) ON DELETE CASCADE,
    key          TEXT NOT NULL,
    value        TEXT NOT NULL,
    position     INTEGER NOT NULL,
    PRIMARY KEY (procedure_id, key, value)
);

CREATE TABLE IF NOT EXISTS historical_locations (
    procedure_id TEXT NOT NULL REFERENCES procedures(procedure_id) ON DELETE CASCADE,
    time         TEXT NOT NULL,
    geometry     TEXT NOT NULL,    -- JSON-encoded Geometry
    PRIMARY KEY (procedure_id, time)
);

CREATE TABLE IF NOT EXISTS phenomena (
    phenomenon_id TEXT PRIMARY KEY,
    kind          TEXT NOT NULL,   -- 'simple' | 'composite'
    name          TEXT,
    definition    TEXT,
    description   TEXT
);

-- Components reference simple phenomena by id; no cascade on that side so a
-- composite never silently loses a component.
CREATE TABLE IF NOT EXISTS phenomenon_components (
    composite_id TEXT NOT NULL REFERENCES phenomena(phenomenon_id) ON DELETE CASCADE,
    component_id TEXT NOT NULL,
    position     INTEGER NOT NULL,
    PRIMARY KEY (composite_id, component_id)
);

CREATE TABLE IF NOT EXISTS phenomenon_properties (
    phenomenon_id TEXT NOT NULL REFERENCES phenomena(phenomenon_id) ON DELETE CASCADE,
    key           TEXT NOT NULL,
    value         TEXT NOT NULL,
    position      INTEGER NOT NULL,
    PRIMARY KEY (phenomenon_id, key, value)
);

CREATE TABLE IF NOT EXISTS sampling_features (
    feature_id      TEXT PRIMARY KEY,
    name            TEXT,
    description     TEXT,
    geometry        TEXT,          -- JSON-encoded Geometry or NULL
    sampled_feature TEXT
);

CREATE TABLE IF NOT EXISTS feature_properties (
    feature_id TEXT NOT NULL REFERENCES sampling_features(feature_id) ON DELETE CASCADE,
    key        TEXT NOT NULL,
    value      TEXT NOT NULL,
    position   INTEGER NOT NULL,
    PRIMARY KEY (feature_id, key, value)
);

-- Instants are stored with begin_time = end_time.
CREATE TABLE IF NOT EXISTS observations (
    observation_id TEXT PRIMARY KEY,
    procedure_id   TEXT NOT NULL REFERENCES procedures(procedure_id) ON DELETE CASCADE,
    name           TEXT NOT NULL,
    phenomenon_id  TEXT,
    feature_id     TEXT REFERENCES sampling_features(feature_id),
    begin_time     TEXT NOT NULL,  -- RFC 3339, millisecond precision
    end_time       TEXT NOT NULL,
    result_quality TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS observations_procedure ON observations(procedure_id, feature_id);
CREATE INDEX IF NOT EXISTS observations_time      ON observations(begin_time, end_time);

-- Monotonic counters behind generated ids.
CREATE TABLE IF NOT EXISTS id_sequences (
    name TEXT PRIMARY KEY,
    next INTEGER NOT NULL
);

PRAGMA user_version = 1;
";

/// Prefix shared by every measure table name.
pub const MEASURE_PREFIX: &str = "measure_";

/// Name of physical measure table `table` of the procedure with handle `pid`.
pub fn measure_table(pid: i64, table: usize) -> String {
  format!("{MEASURE_PREFIX}{pid}_{table}")
}

/// Inverse of [`measure_table`].
pub fn parse_measure_table(name: &str) -> Option<(i64, usize)> {
  let (pid, table) = name.strip_prefix(MEASURE_PREFIX)?.split_once('_')?;
  Some((pid.parse().ok()?, table.parse().ok()?))
}

/// DDL of one measure table. Value columns `c0..` are added on demand and are
/// untyped so each keeps the storage class of the value written.
pub fn create_measure_table(name: &str) -> String {
  format!(
    "CREATE TABLE IF NOT EXISTS {name} (
         observation_id TEXT NOT NULL REFERENCES observations(observation_id) ON DELETE CASCADE,
         main           NOT NULL,
         PRIMARY KEY (observation_id, main)
     )"
  )
}

pub fn value_column(column: usize) -> String { format!("c{column}") }

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn measure_table_names_round_trip() {
    assert_eq!(measure_table(12, 3), "measure_12_3");
    assert_eq!(parse_measure_table("measure_12_3"), Some((12, 3)));
    assert_eq!(parse_measure_table("observations"), None);
  }
}
