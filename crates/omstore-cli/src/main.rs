//! `omstore`: local administration tool for an omstore SQLite database.
//!
//! Reads `omstore.toml` (or the path given with `--config`) layered with
//! `OMSTORE_*` environment variables, opens the store and runs one
//! subcommand. Inputs are JSON files (`-` reads stdin); results are printed
//! to stdout as JSON, logs go to stderr.
//!
//! # Usage
//!
//! ```
//! omstore write observations.json
//! omstore results station-7 --format csv-flat
//! omstore remove-dataset --procedure station-7 --from 2024-01-01T00:00:00Z --to 2024-02-01T00:00:00Z
//! ```

use std::{
  io::{self, Read as _, Write as _},
  path::{Path, PathBuf},
};

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use omstore_core::{
  config::StoreConfig,
  filter::Filter,
  merge::NewObservation,
  query::{
    DatasetQuery, EntityKind, EntityQuery, EntityType, ObservationQuery, ResultFormat, ResultQuery,
    ResultSet,
  },
  store::ObservationStore,
  template::TemplateOptions,
  time::TemporalExtent,
};
use omstore_store_sqlite::SqliteStore;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

// ─── CLI args ────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "omstore", author, version, about = "Sensor observation store")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "omstore.toml")]
  config: PathBuf,

  /// Database file, overriding `store_path` from the configuration.
  #[arg(long, value_name = "FILE")]
  store: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// Insert or merge observations from a JSON file (one object or an array).
  Write { input: PathBuf },
  /// Observations matching a query.
  Observations(ObservationArgs),
  /// Ids of the observations matching a query.
  Identifiers(ObservationArgs),
  /// Number of observations matching a query.
  Count(ObservationArgs),
  /// Result rows of one procedure.
  Results(ResultArgs),
  /// Result template of one procedure.
  Template(TemplateArgs),
  Phenomena(EntityArgs),
  Procedures(EntityArgs),
  Features(EntityArgs),
  Offerings(EntityArgs),
  /// Whether an entity exists. Exits non-zero when it does not.
  Exists {
    /// procedure, phenomenon, feature, observation or offering.
    kind: EntityType,
    id:   String,
  },
  /// Remove the selected observations and whatever they leave orphaned.
  RemoveDataset(DatasetArgs),
  /// Remove a phenomenon, decomposing the composites that contain it.
  RemovePhenomenon { id: String },
  /// The selected observations with their procedures, phenomena and features.
  Extract(DatasetArgs),
}

#[derive(Args)]
struct ObservationArgs {
  /// `ObservationQuery` JSON; defaults apply when omitted.
  #[arg(short, long, value_name = "FILE")]
  query: Option<PathBuf>,

  /// Filter JSON, replacing the query's filter.
  #[arg(short, long, value_name = "FILE")]
  filter: Option<PathBuf>,

  #[arg(long)]
  limit: Option<usize>,

  #[arg(long)]
  offset: Option<usize>,
}

#[derive(Args)]
struct ResultArgs {
  procedure: String,

  /// csv, csv-flat, count or data-array.
  #[arg(long, default_value = "csv")]
  format: ResultFormat,

  #[arg(short, long, value_name = "FILE")]
  filter: Option<PathBuf>,

  /// Target point count.
  #[arg(long)]
  decimation: Option<usize>,

  /// One entry per measurement instead of a data block.
  #[arg(long)]
  measurements: bool,

  /// Prepend an `id` column.
  #[arg(long)]
  with_ids: bool,

  /// Add the profile instant as a column.
  #[arg(long)]
  with_profile_time: bool,
}

#[derive(Args)]
struct TemplateArgs {
  procedure: String,

  #[arg(long)]
  no_feature: bool,

  #[arg(long)]
  with_time: bool,
}

#[derive(Args)]
struct EntityArgs {
  #[arg(short, long, value_name = "FILE")]
  filter: Option<PathBuf>,

  #[arg(long)]
  limit: Option<usize>,

  #[arg(long, default_value_t = 0)]
  offset: usize,
}

#[derive(Args)]
struct DatasetArgs {
  #[arg(long = "procedure", value_name = "ID")]
  procedures: Vec<String>,

  #[arg(long = "feature", value_name = "ID")]
  features: Vec<String>,

  #[arg(long, requires = "to")]
  from: Option<DateTime<Utc>>,

  #[arg(long, requires = "from")]
  to: Option<DateTime<Utc>>,
}

impl DatasetArgs {
  fn query(&self) -> DatasetQuery {
    DatasetQuery {
      procedures: self.procedures.clone(),
      features:   self.features.clone(),
      time:       self.from.zip(self.to).map(|(a, b)| TemporalExtent::between(a, b)),
    }
  }
}

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(default)]
struct CliConfig {
  store_path: PathBuf,
  store:      StoreConfig,
}

impl Default for CliConfig {
  fn default() -> Self {
    Self { store_path: PathBuf::from("omstore.db"), store: StoreConfig::default() }
  }
}

fn load_config(cli: &Cli) -> anyhow::Result<CliConfig> {
  let settings = config::Config::builder()
    .add_source(config::File::from(cli.config.as_path()).required(false))
    .add_source(
      config::Environment::with_prefix("OMSTORE")
        .separator("__")
        .try_parsing(true),
    )
    .set_override_option(
      "store_path",
      cli.store.as_ref().map(|p| p.to_string_lossy().into_owned()),
    )
    .context("invalid --store override")?
    .build()
    .context("failed to read config file")?;
  settings
    .try_deserialize()
    .context("failed to deserialise CliConfig")
}

// ─── Entry point ─────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .with_writer(io::stderr)
    .init();

  let cli = Cli::parse();
  let cfg = load_config(&cli)?;

  let store_path = expand_tilde(&cfg.store_path);
  let store = SqliteStore::open(&store_path)
    .await
    .with_context(|| format!("failed to open store at {store_path:?}"))?
    .with_config(cfg.store)
    .context("invalid store configuration")?;

  run(&store, cli.command).await
}

async fn run(store: &SqliteStore, command: Command) -> anyhow::Result<()> {
  match command {
    Command::Write { input } => {
      let batch: OneOrMany<NewObservation> = read_json(&input)?;
      let mut ids = Vec::new();
      for observation in batch.into_vec() {
        let procedure = observation.procedure.id.clone();
        let id = store
          .write_observation(observation)
          .await
          .with_context(|| format!("failed to write observation for {procedure}"))?;
        ids.push(id);
      }
      tracing::info!(count = ids.len(), "observations written");
      print_json(&ids)
    }

    Command::Observations(args) => {
      let query = args.query()?;
      print_json(&store.get_observations(&query).await.context("query failed")?)
    }
    Command::Identifiers(args) => {
      let query = args.query()?;
      print_json(&store.get_identifiers(&query).await.context("query failed")?)
    }
    Command::Count(args) => {
      let query = args.query()?;
      print_json(&store.get_count(&query).await.context("query failed")?)
    }

    Command::Results(args) => {
      let mut query = ResultQuery::new(&args.procedure);
      query.format = args.format;
      query.filter = read_filter(args.filter.as_deref())?;
      query.decimation = args.decimation;
      query.include_id_in_data_block = args.with_ids;
      query.include_time_for_profile = args.with_profile_time;
      if args.measurements {
        query.entity = EntityKind::Measurement;
      }
      match store.get_results(&query).await.context("result query failed")? {
        ResultSet::Text { content, .. } => print_text(&content),
        other => print_json(&other),
      }
    }

    Command::Template(args) => {
      let options = TemplateOptions {
        include_feature: !args.no_feature,
        include_time: args.with_time,
        ..TemplateOptions::default()
      };
      let template = store
        .get_template(&args.procedure, options)
        .await
        .context("template query failed")?
        .with_context(|| format!("no procedure {}", args.procedure))?;
      print_json(&template)
    }

    Command::Phenomena(args) => {
      print_json(&store.get_phenomena(&args.query()?).await.context("query failed")?)
    }
    Command::Procedures(args) => {
      print_json(&store.get_procedures(&args.query()?).await.context("query failed")?)
    }
    Command::Features(args) => {
      print_json(&store.get_features(&args.query()?).await.context("query failed")?)
    }
    Command::Offerings(args) => {
      print_json(&store.get_offerings(&args.query()?).await.context("query failed")?)
    }

    Command::Exists { kind, id } => {
      let found = store.exist_entity(kind, &id).await.context("lookup failed")?;
      print_json(&found)?;
      if !found {
        std::process::exit(1);
      }
      Ok(())
    }

    Command::RemoveDataset(args) => {
      store
        .remove_dataset(&args.query())
        .await
        .context("dataset removal failed")
    }
    Command::RemovePhenomenon { id } => {
      store
        .remove_phenomenon(&id)
        .await
        .with_context(|| format!("failed to remove phenomenon {id}"))
    }
    Command::Extract(args) => {
      print_json(&store.extract_results(&args.query()).await.context("extract failed")?)
    }
  }
}

// ─── Query assembly ──────────────────────────────────────────────────────────

impl ObservationArgs {
  fn query(&self) -> anyhow::Result<ObservationQuery> {
    let mut query = match &self.query {
      Some(path) => read_json(path)?,
      None => ObservationQuery::default(),
    };
    if let Some(filter) = read_filter(self.filter.as_deref())? {
      query.filter = Some(filter);
    }
    if self.limit.is_some() {
      query.limit = self.limit;
    }
    if let Some(offset) = self.offset {
      query.offset = offset;
    }
    Ok(query)
  }
}

impl EntityArgs {
  fn query(&self) -> anyhow::Result<EntityQuery> {
    Ok(EntityQuery {
      filter: read_filter(self.filter.as_deref())?,
      limit:  self.limit,
      offset: self.offset,
    })
  }
}

// ─── I/O helpers ─────────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
  Many(Vec<T>),
  One(T),
}

impl<T> OneOrMany<T> {
  fn into_vec(self) -> Vec<T> {
    match self {
      Self::Many(all) => all,
      Self::One(one) => vec![one],
    }
  }
}

/// Parse JSON from `path`, or from stdin when `path` is `-`.
fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
  let raw = if path == Path::new("-") {
    let mut raw = String::new();
    io::stdin().read_to_string(&mut raw).context("reading stdin")?;
    raw
  } else {
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?
  };
  serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn read_filter(path: Option<&Path>) -> anyhow::Result<Option<Filter>> {
  path.map(read_json).transpose()
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
  let mut out = io::stdout().lock();
  serde_json::to_writer_pretty(&mut out, value).context("writing output")?;
  writeln!(out).context("writing output")
}

fn print_text(text: &str) -> anyhow::Result<()> {
  let mut out = io::stdout().lock();
  writeln!(out, "{text}").context("writing output")
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}
