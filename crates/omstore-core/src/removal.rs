//! Removal cascades, planned over a snapshot.
//!
//! Both plans are computed in full before anything is touched so a backend
//! can apply each one as a single transaction.

use std::collections::{BTreeMap, BTreeSet};

use tracing::info;

use crate::{
  Error, Result,
  composer::{Decomposition, PhenomenonRegistry, decompose},
  field::FieldValue,
  phenomenon::Phenomenon,
  procedure::Procedure,
  query::DatasetQuery,
  snapshot::StoreSnapshot,
  time::TemporalExtent,
};

// ─── Phenomenon removal ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDrop {
  pub procedure: String,
  pub field:     String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhenomenonRemoval {
  pub delete_observations:   Vec<String>,
  /// (observation, new phenomenon id).
  pub reassign_observations: Vec<(String, String)>,
  /// Replacement phenomena to persist, components before composites.
  pub create_phenomena:      Vec<Phenomenon>,
  pub delete_phenomena:      Vec<String>,
  /// Columns whose data goes away with the removed phenomenon.
  pub drop_fields:           Vec<FieldDrop>,
  /// Surviving procedures whose fields or phenomenon changed.
  pub update_procedures:     Vec<Procedure>,
  pub delete_procedures:     Vec<String>,
  pub delete_features:       Vec<String>,
}

impl PhenomenonRemoval {
  pub fn is_empty(&self) -> bool { *self == Self::default() }
}

/// Replacement phenomena computed so far. Decomposition depends on the
/// procedure's main component, so replacements are keyed by both.
struct Replacements {
  registry: PhenomenonRegistry,
  created:  Vec<Phenomenon>,
  cache:    BTreeMap<(String, Option<String>), Option<Phenomenon>>,
}

impl Replacements {
  /// What `phenomenon` becomes once `removed` is gone. `None` when nothing
  /// measurable remains.
  fn of(&mut self, phenomenon: &Phenomenon, removed: &str, main: Option<&str>) -> Option<Phenomenon> {
    let key = (phenomenon.id().to_owned(), main.map(str::to_owned));
    if let Some(cached) = self.cache.get(&key) {
      return cached.clone();
    }
    let decomposition = decompose(&self.registry, phenomenon, removed, main);
    match &decomposition {
      Decomposition::Recomposed { phenomenon: p, created: true } => {
        self.registry.insert(p.clone().into());
        self.created.push(p.clone().into());
      }
      Decomposition::Collapsed(s) if !self.registry.contains(&s.id) => {
        self.registry.insert(s.clone().into());
        self.created.push(s.clone().into());
      }
      _ => {}
    }
    let replacement = decomposition.into_phenomenon(phenomenon);
    self.cache.insert(key, replacement.clone());
    replacement
  }
}

/// Plan the removal of phenomenon `id` and everything that depends on it.
///
/// Observations carrying exactly `id`, or left with nothing measurable, are
/// deleted; the others are re-associated with the decomposed phenomenon. When
/// `id` names a field, that field's columns are dropped. A profile whose main
/// field is removed loses every observation. Procedures left without
/// observations or measured fields are deleted, as are features no surviving
/// observation refers to and composites that contain `id` or that nothing
/// refers to anymore.
pub fn plan_remove_phenomenon(snapshot: &StoreSnapshot, id: &str) -> PhenomenonRemoval {
  let mut plan = PhenomenonRemoval::default();
  if !snapshot.phenomena.contains(id) {
    return plan;
  }

  let mut replacements = Replacements {
    registry: snapshot.phenomena.clone(),
    created:  Vec::new(),
    cache:    BTreeMap::new(),
  };
  let mut deleted: BTreeSet<&str> = BTreeSet::new();
  let mut survivors: BTreeMap<&str, Option<String>> = BTreeMap::new();
  let mut touched: BTreeSet<String> = BTreeSet::new();

  for procedure in snapshot.procedures.values() {
    let main = procedure.main_component();
    let observations: Vec<_> = snapshot.observations_of(&procedure.id).collect();
    let mut remaining = 0;

    if main == Some(id) {
      deleted.extend(observations.iter().map(|o| o.header.id.as_str()));
    } else {
      for stored in &observations {
        let Some(phenomenon) = snapshot.phenomenon_of(&stored.header) else {
          survivors.insert(&stored.header.id, None);
          remaining += 1;
          continue;
        };
        touched.insert(phenomenon.id().to_owned());
        match replacements.of(phenomenon, id, main) {
          None => {
            deleted.insert(&stored.header.id);
          }
          Some(replacement) => {
            if replacement.id() != phenomenon.id() {
              plan
                .reassign_observations
                .push((stored.header.id.clone(), replacement.id().to_owned()));
            }
            survivors.insert(&stored.header.id, Some(replacement.id().to_owned()));
            remaining += 1;
          }
        }
      }
    }

    let mut updated = procedure.clone();
    if let Some(current) = procedure.phenomenon.as_deref() {
      touched.insert(current.to_owned());
      updated.phenomenon = match snapshot.phenomena.get(current) {
        Some(p) => replacements.of(p, id, main).map(|p| p.id().to_owned()),
        None => Some(current.to_owned()),
      };
    }
    if main != Some(id) && updated.fields.iter().skip(1).any(|f| f.name == id) {
      updated.fields.retain(|f| f.name != id);
      plan.drop_fields.push(FieldDrop { procedure: procedure.id.clone(), field: id.to_owned() });
    }

    if remaining == 0 || updated.measured_fields().is_empty() || main == Some(id) {
      for stored in &observations {
        deleted.insert(&stored.header.id);
        survivors.remove(stored.header.id.as_str());
      }
      plan.reassign_observations.retain(|(o, _)| survivors.contains_key(o.as_str()));
      plan.drop_fields.retain(|d| d.procedure != procedure.id);
      plan.delete_procedures.push(procedure.id.clone());
    } else if updated != *procedure {
      plan.update_procedures.push(updated);
    }
  }

  // Observations of unknown procedures are judged on their own.
  for stored in snapshot.observations.values() {
    if snapshot.procedure(&stored.header.procedure).is_some() {
      continue;
    }
    if snapshot.phenomenon_of(&stored.header).is_some_and(|p| p.id() == id || p.has_component(id)) {
      deleted.insert(&stored.header.id);
    }
  }

  plan.delete_observations = deleted.iter().map(|s| (*s).to_owned()).collect();
  plan.delete_features = snapshot
    .features
    .keys()
    .filter(|f| {
      let was_used = snapshot.observations.values().any(|o| o.header.feature.as_deref() == Some(f.as_str()));
      was_used && !snapshot.feature_referenced(f, &deleted)
    })
    .cloned()
    .collect();

  // Composites containing `id` go, and so does any phenomenon the removal
  // touched that is now referenced by nothing.
  let mut gone: BTreeSet<String> = BTreeSet::from([id.to_owned()]);
  gone.extend(snapshot.phenomena.composites_containing(id).into_iter().map(|c| c.id.clone()));
  let still_used: BTreeSet<&str> = survivors
    .values()
    .flatten()
    .map(String::as_str)
    .chain(plan.update_procedures.iter().filter_map(|p| p.phenomenon.as_deref()))
    .chain(
      snapshot
        .procedures
        .values()
        .filter(|p| !plan.delete_procedures.contains(&p.id) && !plan.update_procedures.iter().any(|u| u.id == p.id))
        .filter_map(|p| p.phenomenon.as_deref()),
    )
    .collect();
  for candidate in touched {
    let is_composite = snapshot.phenomena.get(&candidate).is_some_and(Phenomenon::is_composite);
    if is_composite && !still_used.contains(candidate.as_str()) {
      gone.insert(candidate);
    }
  }
  plan.create_phenomena = replacements
    .created
    .into_iter()
    .filter(|p| still_used.contains(p.id()))
    .collect();
  plan.delete_phenomena = gone.into_iter().collect();

  info!(
    phenomenon = id,
    observations = plan.delete_observations.len(),
    reassigned = plan.reassign_observations.len(),
    procedures = plan.delete_procedures.len(),
    features = plan.delete_features.len(),
    phenomena = plan.delete_phenomena.len(),
    "planned phenomenon removal"
  );
  plan
}

// ─── Dataset removal ─────────────────────────────────────────────────────────

/// Rows to cut out of an observation that only partly falls in the time
/// selection.
#[derive(Debug, Clone, PartialEq)]
pub struct RowTrim {
  pub observation: String,
  pub procedure:   String,
  /// Main values of the rows to delete.
  pub mains:       Vec<FieldValue>,
  /// Extent of the rows that stay.
  pub extent:      TemporalExtent,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatasetRemoval {
  pub delete_observations: Vec<String>,
  pub trims:               Vec<RowTrim>,
  pub delete_procedures:   Vec<String>,
  pub delete_features:     Vec<String>,
}

/// Plan the removal of every observation `query` selects. A time selection
/// trims timeseries row by row; profiles go whole. Procedures left without
/// observations and features left unreferenced are deleted. Phenomena are
/// never touched here.
pub fn plan_remove_dataset(snapshot: &StoreSnapshot, query: &DatasetQuery) -> Result<DatasetRemoval> {
  if query.is_empty() {
    return Err(Error::validation("dataset selection is empty; refusing to remove everything"));
  }

  let mut plan = DatasetRemoval::default();
  let mut deleted: BTreeSet<&str> = BTreeSet::new();

  for stored in snapshot.observations.values().filter(|o| query.selects(&o.header)) {
    let header = &stored.header;
    let timeseries = snapshot.procedure(&header.procedure).is_some_and(|p| !p.is_profile());
    let (Some(window), true) = (query.time, timeseries) else {
      deleted.insert(&header.id);
      continue;
    };
    let Some(result) = &stored.result else {
      if window.begin() <= header.extent.begin() && header.extent.end() <= window.end() {
        deleted.insert(&header.id);
      }
      continue;
    };

    let (inside, outside): (Vec<_>, Vec<_>) = result
      .rows
      .iter()
      .partition(|r| r.main().as_time().is_some_and(|t| window.contains(t)));
    if inside.is_empty() {
      continue;
    }
    let kept: Vec<TemporalExtent> = outside
      .iter()
      .filter_map(|r| r.main().as_time())
      .map(TemporalExtent::instant)
      .collect();
    match TemporalExtent::union_all(&kept) {
      None => {
        deleted.insert(&header.id);
      }
      Some(extent) => plan.trims.push(RowTrim {
        observation: header.id.clone(),
        procedure: header.procedure.clone(),
        mains: inside.iter().map(|r| r.main().clone()).collect(),
        extent,
      }),
    }
  }

  plan.delete_observations = deleted.iter().map(|s| (*s).to_owned()).collect();
  plan.delete_procedures = snapshot
    .procedures
    .keys()
    .filter(|p| snapshot.observations_of(p).all(|o| deleted.contains(o.header.id.as_str())))
    .cloned()
    .collect();
  plan.delete_features = snapshot
    .features
    .keys()
    .filter(|f| !snapshot.feature_referenced(f, &deleted))
    .filter(|f| snapshot.observations.values().any(|o| o.header.feature.as_deref() == Some(f.as_str())))
    .cloned()
    .collect();

  info!(
    observations = plan.delete_observations.len(),
    trimmed = plan.trims.len(),
    procedures = plan.delete_procedures.len(),
    features = plan.delete_features.len(),
    "planned dataset removal"
  );
  Ok(plan)
}
