//! Offerings and dataset extracts: derived, read-only views.

use serde::{Deserialize, Serialize};

use crate::{
  feature::SamplingFeature, geometry::Envelope, observation::Observation,
  phenomenon::Phenomenon, procedure::Procedure, time::TemporalExtent,
};

/// The published view over one procedure's history. Never stored; derived
/// from the procedure's observations on read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offering {
  pub id:         String,
  pub procedure:  String,
  pub time:       Option<TemporalExtent>,
  /// Phenomenon ids the procedure's observations have carried.
  pub phenomena:  Vec<String>,
  pub features:   Vec<String>,
}

/// A read-only aggregate returned by extraction queries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetExtract {
  pub observations:  Vec<Observation>,
  pub phenomena:     Vec<Phenomenon>,
  pub features:      Vec<SamplingFeature>,
  pub procedures:    Vec<Procedure>,
  /// Envelope (CRS:84) of every feature geometry in the extract.
  pub spatial_bound: Option<Envelope>,
  pub time:          Option<TemporalExtent>,
}
