//! Temporal extents of observations and the relations the merge engine and the
//! filter evaluator reason about.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Canonical text form of an instant. Fixed width, so lexicographic order is
/// chronological order.
pub fn format_instant(t: DateTime<Utc>) -> String {
  t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_instant(s: &str) -> Option<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s.trim())
    .ok()
    .map(|dt| dt.with_timezone(&Utc))
}

// ─── Extent ──────────────────────────────────────────────────────────────────

/// The sampling time of an observation: a single instant or a closed period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TemporalExtent {
  Instant { time: DateTime<Utc> },
  Period { begin: DateTime<Utc>, end: DateTime<Utc> },
}

/// How two extents sit relative to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemporalRelation {
  Overlapping,
  /// One ends exactly where the other begins.
  Adjacent,
  Disjoint,
}

impl TemporalExtent {
  pub fn instant(time: DateTime<Utc>) -> Self { Self::Instant { time } }

  /// A period, collapsing to an instant when both bounds agree. Bounds are
  /// swapped if given in reverse.
  pub fn between(a: DateTime<Utc>, b: DateTime<Utc>) -> Self {
    let (begin, end) = if a <= b { (a, b) } else { (b, a) };
    if begin == end {
      Self::Instant { time: begin }
    } else {
      Self::Period { begin, end }
    }
  }

  pub fn begin(&self) -> DateTime<Utc> {
    match *self {
      Self::Instant { time } => time,
      Self::Period { begin, .. } => begin,
    }
  }

  pub fn end(&self) -> DateTime<Utc> {
    match *self {
      Self::Instant { time } => time,
      Self::Period { end, .. } => end,
    }
  }

  pub fn is_period(&self) -> bool { matches!(self, Self::Period { .. }) }

  pub fn union(&self, other: &TemporalExtent) -> TemporalExtent {
    Self::between(self.begin().min(other.begin()), self.end().max(other.end()))
  }

  /// Union over an iterator of optional extents.
  pub fn union_all<'a>(
    extents: impl IntoIterator<Item = &'a TemporalExtent>,
  ) -> Option<TemporalExtent> {
    extents
      .into_iter()
      .fold(None, |acc: Option<TemporalExtent>, e| {
        Some(match acc {
          Some(a) => a.union(e),
          None => *e,
        })
      })
  }

  pub fn relation(&self, other: &TemporalExtent) -> TemporalRelation {
    if self.end() == other.begin() || other.end() == self.begin() {
      // Only two periods can touch; an instant on a period bound lies inside it.
      if self.is_period() && other.is_period() {
        return TemporalRelation::Adjacent;
      }
    }
    if self.begin() <= other.end() && other.begin() <= self.end() {
      TemporalRelation::Overlapping
    } else {
      TemporalRelation::Disjoint
    }
  }

  pub fn contains(&self, t: DateTime<Utc>) -> bool {
    self.begin() <= t && t <= self.end()
  }

  pub fn intersects(&self, other: &TemporalExtent) -> bool {
    self.begin() <= other.end() && other.begin() <= self.end()
  }

  // ── Filter semantics ─────────────────────────────────────────────────────

  /// `self` lies within `period`: an instant strictly inside, or a period
  /// fully contained.
  pub fn during(&self, period: &TemporalExtent) -> bool {
    match *self {
      Self::Instant { time } => period.begin() < time && time < period.end(),
      Self::Period { begin, end } => period.begin() <= begin && end <= period.end(),
    }
  }

  /// `self` ends before `other` starts.
  pub fn before(&self, other: &TemporalExtent) -> bool { self.end() < other.begin() }

  /// `self` starts after `other` ends.
  pub fn after(&self, other: &TemporalExtent) -> bool { self.begin() > other.end() }
}
