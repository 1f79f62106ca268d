//! Phenomenon composition: building the phenomenon that covers a procedure's
//! fields, and tearing composites down when a component goes away.
//!
//! Generated ids follow `computed-phen-<seed>`, where the seed is the
//! procedure id when composing and the original composite id when
//! decomposing. A taken id gets the lowest free `-<n>` suffix. Before any id is
//! generated, an existing phenomenon with exactly the wanted component set is
//! reused.

use std::collections::BTreeMap;

use crate::{
  Error, Result,
  phenomenon::{CompositePhenomenon, Phenomenon, SimplePhenomenon},
};

// ─── Registry ────────────────────────────────────────────────────────────────

/// Every known phenomenon, by id. The composer reads it to reuse records and
/// to pick fresh ids; callers apply the composer's decisions back to it.
#[derive(Debug, Clone, Default)]
pub struct PhenomenonRegistry {
  by_id: BTreeMap<String, Phenomenon>,
}

impl FromIterator<Phenomenon> for PhenomenonRegistry {
  fn from_iter<I: IntoIterator<Item = Phenomenon>>(iter: I) -> Self {
    Self {
      by_id: iter.into_iter().map(|p| (p.id().to_owned(), p)).collect(),
    }
  }
}

impl PhenomenonRegistry {
  pub fn new() -> Self { Self::default() }

  pub fn get(&self, id: &str) -> Option<&Phenomenon> { self.by_id.get(id) }

  pub fn contains(&self, id: &str) -> bool { self.by_id.contains_key(id) }

  pub fn insert(&mut self, phenomenon: Phenomenon) {
    self.by_id.insert(phenomenon.id().to_owned(), phenomenon);
  }

  pub fn remove(&mut self, id: &str) -> Option<Phenomenon> { self.by_id.remove(id) }

  pub fn len(&self) -> usize { self.by_id.len() }

  pub fn is_empty(&self) -> bool { self.by_id.is_empty() }

  /// Phenomena in id order.
  pub fn iter(&self) -> impl Iterator<Item = &Phenomenon> { self.by_id.values() }

  /// A phenomenon whose component set equals `ids`. Composites are preferred
  /// for multi-component sets; a single id resolves to the simple record.
  pub fn find_by_components(&self, ids: &[&str]) -> Option<&Phenomenon> {
    if let [single] = ids {
      return self
        .by_id
        .get(*single)
        .filter(|p| !p.is_composite());
    }
    self
      .by_id
      .values()
      .filter(|p| p.is_composite())
      .find(|p| p.has_component_set(ids))
  }

  pub fn composites_containing(&self, id: &str) -> Vec<&CompositePhenomenon> {
    self
      .by_id
      .values()
      .filter_map(|p| match p {
        Phenomenon::Composite(c) if c.components.iter().any(|s| s.id == id) => Some(c),
        _ => None,
      })
      .collect()
  }

  /// First free id of the `computed-phen-<seed>` family.
  pub fn generate_id(&self, seed: &str) -> String {
    let base = format!("computed-phen-{seed}");
    if !self.contains(&base) {
      return base;
    }
    (1..)
      .map(|n| format!("{base}-{n}"))
      .find(|candidate| !self.contains(candidate))
      .unwrap_or(base)
  }

  /// The stored record for a component id, falling back to `fallback`.
  fn simple_or(&self, fallback: &SimplePhenomenon) -> SimplePhenomenon {
    match self.by_id.get(&fallback.id) {
      Some(Phenomenon::Simple(s)) => s.clone(),
      _ => fallback.clone(),
    }
  }
}

// ─── Composition ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Composition {
  pub phenomenon: Phenomenon,
  /// Records unknown to the registry that must be persisted: new simple
  /// components first, then the composite itself when freshly built.
  pub created:    Vec<Phenomenon>,
  /// Id of the prior phenomenon when the result differs from it.
  pub replaced:   Option<String>,
}

/// Compose the phenomenon covering `incoming` for `procedure_id`.
///
/// `prior` is the procedure's current phenomenon, `declared` the phenomenon the
/// write itself named, if any. `incoming` must be non-empty.
pub fn compose_for(
  registry: &PhenomenonRegistry,
  procedure_id: &str,
  prior: Option<&Phenomenon>,
  declared: Option<&Phenomenon>,
  incoming: &[SimplePhenomenon],
) -> Result<Composition> {
  if incoming.is_empty() {
    return Err(Error::validation(format!(
      "no phenomenon to compose for procedure {procedure_id}"
    )));
  }

  if let Some(prior) = prior
    && incoming.iter().all(|s| prior.has_component(&s.id))
  {
    return Ok(Composition {
      phenomenon: prior.clone(),
      created:    Vec::new(),
      replaced:   None,
    });
  }

  // Union: prior order first, then newly seen components in arrival order.
  // Component metadata comes from the registry, then from the declared
  // phenomenon, then from the field itself.
  let declared_component = |s: &SimplePhenomenon| -> SimplePhenomenon {
    declared
      .and_then(|d| d.components().into_iter().find(|c| c.id == s.id).cloned())
      .unwrap_or_else(|| s.clone())
  };
  let mut union: Vec<SimplePhenomenon> = prior
    .map(|p| p.components().into_iter().cloned().collect())
    .unwrap_or_default();
  for s in incoming {
    if !union.iter().any(|u| u.id == s.id) {
      union.push(registry.simple_or(&declared_component(s)));
    }
  }

  let mut created: Vec<Phenomenon> = union
    .iter()
    .filter(|s| !registry.contains(&s.id))
    .cloned()
    .map(Phenomenon::Simple)
    .collect();

  let ids: Vec<&str> = union.iter().map(|s| s.id.as_str()).collect();
  let phenomenon = if let [single] = union.as_slice() {
    Phenomenon::Simple(single.clone())
  } else if let Some(existing) = declared
    .filter(|d| d.is_composite() && d.has_component_set(&ids))
    .and_then(|d| {
      match registry.get(d.id()) {
        // A stored record under the declared id wins only if it agrees.
        Some(stored) if stored.has_component_set(&ids) => Some(stored.clone()),
        Some(_) => None,
        None => {
          created.push(d.clone());
          Some(d.clone())
        }
      }
    })
  {
    existing
  } else if let Some(existing) = registry.find_by_components(&ids) {
    existing.clone()
  } else {
    let composite: Phenomenon =
      CompositePhenomenon::new(registry.generate_id(procedure_id), union).into();
    created.push(composite.clone());
    composite
  };

  let replaced = prior
    .map(|p| p.id())
    .filter(|id| *id != phenomenon.id())
    .map(str::to_owned);

  tracing::debug!(
    procedure = procedure_id,
    phenomenon = phenomenon.id(),
    replaced = ?replaced,
    "composed phenomenon"
  );

  Ok(Composition { phenomenon, created, replaced })
}

// ─── Decomposition ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Decomposition {
  /// The removed id is not part of the phenomenon.
  Unchanged,
  /// Nothing measurable remains.
  Removed,
  /// Exactly one component remains.
  Collapsed(SimplePhenomenon),
  /// Several components remain; `created` is set when no existing composite
  /// matched and a new record must be persisted.
  Recomposed {
    phenomenon: CompositePhenomenon,
    created:    bool,
  },
}

impl Decomposition {
  /// The phenomenon that replaces the decomposed one, if any survives.
  pub fn into_phenomenon(self, original: &Phenomenon) -> Option<Phenomenon> {
    match self {
      Self::Unchanged => Some(original.clone()),
      Self::Removed => None,
      Self::Collapsed(s) => Some(s.into()),
      Self::Recomposed { phenomenon, .. } => Some(phenomenon.into()),
    }
  }
}

/// Remove `removed_id` from `phenomenon`.
///
/// `main_component` names a profile's main field: it stays a component but is
/// not counted when deciding whether anything measurable remains.
pub fn decompose(
  registry: &PhenomenonRegistry,
  phenomenon: &Phenomenon,
  removed_id: &str,
  main_component: Option<&str>,
) -> Decomposition {
  if phenomenon.id() == removed_id {
    return Decomposition::Removed;
  }
  let Phenomenon::Composite(composite) = phenomenon else {
    return Decomposition::Unchanged;
  };
  if !composite.components.iter().any(|c| c.id == removed_id) {
    return Decomposition::Unchanged;
  }

  let remaining: Vec<SimplePhenomenon> = composite
    .components
    .iter()
    .filter(|c| c.id != removed_id)
    .cloned()
    .collect();

  let measured = remaining
    .iter()
    .filter(|c| Some(c.id.as_str()) != main_component)
    .count();
  if measured == 0 {
    return Decomposition::Removed;
  }

  if let [single] = remaining.as_slice() {
    return Decomposition::Collapsed(registry.simple_or(single));
  }

  let ids: Vec<&str> = remaining.iter().map(|c| c.id.as_str()).collect();
  if let Some(Phenomenon::Composite(existing)) = registry.find_by_components(&ids) {
    return Decomposition::Recomposed { phenomenon: existing.clone(), created: false };
  }

  Decomposition::Recomposed {
    phenomenon: CompositePhenomenon::new(registry.generate_id(&composite.id), remaining),
    created:    true,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn simples(ids: &[&str]) -> Vec<SimplePhenomenon> {
    ids.iter().map(|id| SimplePhenomenon::new(*id)).collect()
  }

  fn composite(id: &str, ids: &[&str]) -> Phenomenon {
    CompositePhenomenon::new(id, simples(ids)).into()
  }

  fn registry_with(items: Vec<Phenomenon>) -> PhenomenonRegistry {
    items.into_iter().collect()
  }

  #[test]
  fn first_write_with_one_field_is_simple() {
    let reg = PhenomenonRegistry::new();
    let c = compose_for(&reg, "sensor-1", None, None, &simples(&["temp"])).unwrap();
    assert_eq!(c.phenomenon, Phenomenon::Simple(SimplePhenomenon::new("temp")));
    assert_eq!(c.created.len(), 1);
    assert_eq!(c.replaced, None);
  }

  #[test]
  fn first_write_with_many_fields_synthesizes_composite() {
    let reg = PhenomenonRegistry::new();
    let c = compose_for(&reg, "sensor-1", None, None, &simples(&["temp", "sal"])).unwrap();
    assert_eq!(c.phenomenon.id(), "computed-phen-sensor-1");
    assert_eq!(c.phenomenon.component_ids(), ["temp", "sal"]);
    // two simples + the composite
    assert_eq!(c.created.len(), 3);
  }

  #[test]
  fn subset_reuses_prior() {
    let prior = composite("p", &["temp", "sal"]);
    let reg = registry_with(vec![
      SimplePhenomenon::new("temp").into(),
      SimplePhenomenon::new("sal").into(),
      prior.clone(),
    ]);
    let c = compose_for(&reg, "s", Some(&prior), None, &simples(&["sal"])).unwrap();
    assert_eq!(c.phenomenon, prior);
    assert!(c.created.is_empty());
    assert_eq!(c.replaced, None);
  }

  #[test]
  fn extension_appends_and_changes_id() {
    let prior = composite("computed-phen-s", &["temp", "sal"]);
    let reg = registry_with(vec![
      SimplePhenomenon::new("temp").into(),
      SimplePhenomenon::new("sal").into(),
      prior.clone(),
    ]);
    let c =
      compose_for(&reg, "s", Some(&prior), None, &simples(&["sal", "oxy"])).unwrap();
    assert_eq!(c.phenomenon.component_ids(), ["temp", "sal", "oxy"]);
    assert_eq!(c.phenomenon.id(), "computed-phen-s-1");
    assert_eq!(c.replaced.as_deref(), Some("computed-phen-s"));
  }

  #[test]
  fn union_reuses_existing_composite() {
    let existing = composite("aggregatePhenomenon", &["a", "b", "c"]);
    let reg = registry_with(vec![
      SimplePhenomenon::new("a").into(),
      SimplePhenomenon::new("b").into(),
      SimplePhenomenon::new("c").into(),
      existing.clone(),
    ]);
    let prior = composite("computed-phen-s", &["a", "b"]);
    let c = compose_for(&reg, "s", Some(&prior), None, &simples(&["c"])).unwrap();
    assert_eq!(c.phenomenon.id(), "aggregatePhenomenon");
    assert!(c.created.is_empty());
  }

  #[test]
  fn declared_composite_is_used_when_it_matches() {
    let declared = composite("aggregatePhenomenon", &["a", "b"]);
    let reg = PhenomenonRegistry::new();
    let c = compose_for(&reg, "s", None, Some(&declared), &simples(&["b", "a"])).unwrap();
    assert_eq!(c.phenomenon.id(), "aggregatePhenomenon");
    assert!(c.created.iter().any(|p| p.id() == "aggregatePhenomenon"));
  }

  #[test]
  fn empty_incoming_is_a_validation_error() {
    let reg = PhenomenonRegistry::new();
    assert!(compose_for(&reg, "s", None, None, &[]).unwrap_err().is_validation());
  }

  #[test]
  fn decomposition_shrinks_then_collapses() {
    let mut reg = registry_with(vec![composite("agg", &["a", "b", "c", "d"])]);
    let mut current = reg.get("agg").cloned().unwrap();

    for (removed, expected_len) in [("a", 3), ("b", 2)] {
      match decompose(&reg, &current, removed, None) {
        Decomposition::Recomposed { phenomenon, created } => {
          assert!(created);
          assert_eq!(phenomenon.components.len(), expected_len);
          assert_ne!(phenomenon.id, current.id());
          current = phenomenon.into();
          reg.insert(current.clone());
        }
        other => panic!("unexpected {other:?}"),
      }
    }

    match decompose(&reg, &current, "c", None) {
      Decomposition::Collapsed(s) => assert_eq!(s.id, "d"),
      other => panic!("unexpected {other:?}"),
    }
  }

  #[test]
  fn decomposition_reuses_matching_composite() {
    let reg = registry_with(vec![
      composite("abc", &["a", "b", "c"]),
      composite("bc", &["c", "b"]),
    ]);
    let d = decompose(&reg, reg.get("abc").unwrap(), "a", None);
    assert!(matches!(d, Decomposition::Recomposed { ref phenomenon, created: false } if phenomenon.id == "bc"));
  }

  #[test]
  fn profile_main_field_does_not_count() {
    let reg = PhenomenonRegistry::new();
    let p = composite("prof", &["depth", "temp"]);
    assert_eq!(decompose(&reg, &p, "temp", Some("depth")), Decomposition::Removed);
    assert!(matches!(
      decompose(&reg, &p, "temp", None),
      Decomposition::Collapsed(ref s) if s.id == "depth"
    ));
  }

  #[test]
  fn unrelated_removal_is_unchanged() {
    let reg = PhenomenonRegistry::new();
    let s: Phenomenon = SimplePhenomenon::new("temp").into();
    assert_eq!(decompose(&reg, &s, "sal", None), Decomposition::Unchanged);
    assert_eq!(decompose(&reg, &s, "temp", None), Decomposition::Removed);
  }

  #[test]
  fn generated_ids_skip_taken_ones() {
    let reg = registry_with(vec![
      composite("computed-phen-s", &["a", "b"]),
      composite("computed-phen-s-1", &["a", "c"]),
    ]);
    assert_eq!(reg.generate_id("s"), "computed-phen-s-2");
    assert_eq!(reg.generate_id("t"), "computed-phen-t");
  }
}
