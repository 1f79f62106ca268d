//! The part of a predicate a backend can evaluate before loading rows.
//!
//! Only atoms of the top-level conjunction are lifted, and only those with an
//! exact storage counterpart. The result is a necessary condition: anything
//! it rejects the full predicate rejects too, so backends still re-check the
//! full predicate in memory.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::{field::FieldValue, procedure, snapshot::ObservationHeader};

use super::{
  path::PropertyPath,
  predicate::{CompareOp, Predicate, TemporalOp},
};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pushdown {
  pub procedures:   Option<BTreeSet<String>>,
  pub observations: Option<BTreeSet<String>>,
  pub features:     Option<BTreeSet<String>>,
  /// The observation must begin at or before this instant.
  pub begins_by:    Option<DateTime<Utc>>,
  /// The observation must end at or after this instant.
  pub ends_from:    Option<DateTime<Utc>>,
}

impl Pushdown {
  pub fn of(predicate: &Predicate) -> Pushdown {
    let mut pushdown = Pushdown::default();
    pushdown.lift(predicate);
    pushdown
  }

  pub fn is_empty(&self) -> bool { *self == Pushdown::default() }

  pub fn admits(&self, header: &ObservationHeader) -> bool {
    let within = |set: &Option<BTreeSet<String>>, value: Option<&str>| match set {
      Some(set) => value.is_some_and(|v| set.contains(v)),
      None => true,
    };
    within(&self.procedures, Some(&header.procedure))
      && within(&self.observations, Some(&header.id))
      && within(&self.features, header.feature.as_deref())
      && self.begins_by.is_none_or(|t| header.extent.begin() <= t)
      && self.ends_from.is_none_or(|t| header.extent.end() >= t)
  }

  fn lift(&mut self, predicate: &Predicate) {
    match predicate {
      Predicate::And(ps) => ps.iter().for_each(|p| self.lift(p)),
      Predicate::Compare { path, op: CompareOp::Eq, value: FieldValue::Text(v) } => match path {
        PropertyPath::Procedure => restrict(&mut self.procedures, v),
        PropertyPath::Offering => match v.strip_prefix(&procedure::offering_id("")) {
          Some(pid) => restrict(&mut self.procedures, pid),
          None => self.procedures = Some(BTreeSet::new()),
        },
        PropertyPath::ObservationId => restrict(&mut self.observations, v),
        PropertyPath::FeatureOfInterest => restrict(&mut self.features, v),
        _ => {}
      },
      Predicate::Temporal { op, extent } => {
        let (begins_by, ends_from) = match op {
          TemporalOp::Equals | TemporalOp::During => (Some(extent.end()), Some(extent.begin())),
          TemporalOp::Before => (Some(extent.begin()), None),
          TemporalOp::After => (None, Some(extent.end())),
        };
        if let Some(t) = begins_by {
          self.begins_by = Some(self.begins_by.map_or(t, |b| b.min(t)));
        }
        if let Some(t) = ends_from {
          self.ends_from = Some(self.ends_from.map_or(t, |e| e.max(t)));
        }
      }
      _ => {}
    }
  }
}

/// Intersect `set` with `{value}`.
fn restrict(set: &mut Option<BTreeSet<String>>, value: &str) {
  *set = Some(match set.take() {
    Some(existing) if existing.contains(value) => BTreeSet::from([value.to_owned()]),
    Some(_) => BTreeSet::new(),
    None => BTreeSet::from([value.to_owned()]),
  });
}
