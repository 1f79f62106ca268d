//! The `ObservationStore` trait.
//!
//! Implemented by storage backends (e.g. `omstore-store-sqlite`). The CLI
//! depends on this abstraction, not on a concrete backend.

use std::future::Future;

use crate::{
  feature::SamplingFeature,
  merge::NewObservation,
  observation::Observation,
  offering::{DatasetExtract, Offering},
  phenomenon::Phenomenon,
  procedure::Procedure,
  query::{DatasetQuery, EntityQuery, EntityType, ObservationQuery, ResultQuery, ResultSet},
  template::TemplateOptions,
};

/// Abstraction over an observation store backend.
///
/// Writes to one procedure are serialised; writes to distinct procedures may
/// run concurrently. Reads observe the last completed write.
///
/// All methods return `Send` futures so the trait can be used in
/// multi-threaded async runtimes.
pub trait ObservationStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  // ── Writes ────────────────────────────────────────────────────────────

  /// Insert or merge an observation and return the id it was stored under.
  /// A rejected write leaves the store untouched.
  fn write_observation(
    &self,
    input: NewObservation,
  ) -> impl Future<Output = Result<String, Self::Error>> + Send + '_;

  // ── Observations ──────────────────────────────────────────────────────

  fn get_observations<'a>(
    &'a self,
    query: &'a ObservationQuery,
  ) -> impl Future<Output = Result<Vec<Observation>, Self::Error>> + Send + 'a;

  fn get_identifiers<'a>(
    &'a self,
    query: &'a ObservationQuery,
  ) -> impl Future<Output = Result<Vec<String>, Self::Error>> + Send + 'a;

  /// Number of matches, ignoring `limit` and `offset`.
  fn get_count<'a>(
    &'a self,
    query: &'a ObservationQuery,
  ) -> impl Future<Output = Result<usize, Self::Error>> + Send + 'a;

  fn get_results<'a>(
    &'a self,
    query: &'a ResultQuery,
  ) -> impl Future<Output = Result<ResultSet, Self::Error>> + Send + 'a;

  /// The result template of one procedure, `None` when it does not exist.
  fn get_template<'a>(
    &'a self,
    procedure_id: &'a str,
    options: TemplateOptions,
  ) -> impl Future<Output = Result<Option<Observation>, Self::Error>> + Send + 'a;

  // ── Entities ──────────────────────────────────────────────────────────

  fn get_phenomena<'a>(
    &'a self,
    query: &'a EntityQuery,
  ) -> impl Future<Output = Result<Vec<Phenomenon>, Self::Error>> + Send + 'a;

  fn get_procedures<'a>(
    &'a self,
    query: &'a EntityQuery,
  ) -> impl Future<Output = Result<Vec<Procedure>, Self::Error>> + Send + 'a;

  fn get_features<'a>(
    &'a self,
    query: &'a EntityQuery,
  ) -> impl Future<Output = Result<Vec<SamplingFeature>, Self::Error>> + Send + 'a;

  fn get_offerings<'a>(
    &'a self,
    query: &'a EntityQuery,
  ) -> impl Future<Output = Result<Vec<Offering>, Self::Error>> + Send + 'a;

  fn exist_entity<'a>(
    &'a self,
    kind: EntityType,
    id: &'a str,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + 'a;

  // ── Removal ───────────────────────────────────────────────────────────

  /// Remove the selected observations, then every procedure and feature left
  /// without one. Atomic.
  fn remove_dataset<'a>(
    &'a self,
    query: &'a DatasetQuery,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  /// Remove a phenomenon, decomposing every composite that contains it.
  /// Atomic.
  fn remove_phenomenon<'a>(
    &'a self,
    id: &'a str,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  // ── Extraction ────────────────────────────────────────────────────────

  fn extract_results<'a>(
    &'a self,
    query: &'a DatasetQuery,
  ) -> impl Future<Output = Result<DatasetExtract, Self::Error>> + Send + 'a;
}
