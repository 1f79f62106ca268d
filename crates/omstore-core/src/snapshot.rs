//! An in-memory view of the store that the engine plans and assembles
//! against. Backends load the part a call needs and hand it over; the engine
//! never talks to storage itself.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{
  Properties,
  allocator::FieldLedger,
  composer::PhenomenonRegistry,
  feature::SamplingFeature,
  field::Field,
  observation::{ComplexResult, Observation, ObservationResult},
  phenomenon::Phenomenon,
  procedure::Procedure,
  time::TemporalExtent,
};

/// The stored record of an observation, without its rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationHeader {
  pub id:             String,
  pub name:           String,
  pub procedure:      String,
  pub phenomenon:     Option<String>,
  pub feature:        Option<String>,
  pub extent:         TemporalExtent,
  #[serde(default)]
  pub result_quality: Properties,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredObservation {
  pub header: ObservationHeader,
  /// Rows over the full field list of the procedure ledger. `None` when the
  /// backend did not load rows for this call.
  pub result: Option<ComplexResult>,
}

#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
  pub procedures:   BTreeMap<String, Procedure>,
  pub ledgers:      BTreeMap<String, FieldLedger>,
  pub phenomena:    PhenomenonRegistry,
  pub features:     BTreeMap<String, SamplingFeature>,
  pub observations: BTreeMap<String, StoredObservation>,
}

impl StoreSnapshot {
  pub fn procedure(&self, id: &str) -> Option<&Procedure> { self.procedures.get(id) }

  pub fn phenomenon_of(&self, header: &ObservationHeader) -> Option<&Phenomenon> {
    header.phenomenon.as_deref().and_then(|id| self.phenomena.get(id))
  }

  pub fn feature_of(&self, header: &ObservationHeader) -> Option<&SamplingFeature> {
    header.feature.as_deref().and_then(|id| self.features.get(id))
  }

  /// Observations of `procedure`, in id order.
  pub fn observations_of<'a>(
    &'a self,
    procedure: &'a str,
  ) -> impl Iterator<Item = &'a StoredObservation> + 'a {
    self
      .observations
      .values()
      .filter(move |o| o.header.procedure == procedure)
  }

  /// Distinct feature ids referenced by `procedure`'s observations.
  pub fn feature_ids_of<'a>(&'a self, procedure: &'a str) -> BTreeSet<&'a str> {
    self
      .observations_of(procedure)
      .filter_map(|o| o.header.feature.as_deref())
      .collect()
  }

  /// Whether any observation other than those in `except` still refers to
  /// `feature`.
  pub fn feature_referenced(&self, feature: &str, except: &BTreeSet<&str>) -> bool {
    self.observations.values().any(|o| {
      !except.contains(o.header.id.as_str()) && o.header.feature.as_deref() == Some(feature)
    })
  }

  /// The fields an observation presents: the procedure's main field, then
  /// each placed field that is a component of the observation's phenomenon.
  pub fn observation_fields(&self, header: &ObservationHeader) -> Vec<Field> {
    let Some(ledger) = self.ledgers.get(&header.procedure) else {
      return Vec::new();
    };
    let phenomenon = self.phenomenon_of(header);
    ledger
      .fields()
      .into_iter()
      .enumerate()
      .filter(|(i, f)| *i == 0 || phenomenon.is_none_or(|p| p.has_component(&f.name)))
      .map(|(_, f)| f)
      .collect()
  }

  /// The observation as a domain object, its result projected onto its own
  /// fields.
  pub fn resolve(&self, stored: &StoredObservation) -> Observation {
    let fields = self.observation_fields(&stored.header);
    let result = match &stored.result {
      Some(rows) => rows.project(&fields),
      None => ComplexResult::new(fields),
    };
    Observation {
      id:                  stored.header.id.clone(),
      name:                stored.header.name.clone(),
      procedure:           stored.header.procedure.clone(),
      phenomenon:          self.phenomenon_of(&stored.header).cloned(),
      feature_of_interest: self.feature_of(&stored.header).cloned(),
      sampling_time:       Some(stored.header.extent),
      result:              ObservationResult::Complex(result),
      result_quality:      stored.header.result_quality.clone(),
    }
  }
}
