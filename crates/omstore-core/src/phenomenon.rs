//! Phenomena: the properties a procedure observes.
//!
//! A phenomenon is either simple (one measured field) or a composite bundle of
//! simple components. Composites never nest: their components are always
//! simple, unique by id, and ordered.

use serde::{Deserialize, Serialize};

use crate::{Properties, field::Field};

// ─── Simple ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimplePhenomenon {
  pub id:          String,
  #[serde(default)]
  pub name:        Option<String>,
  #[serde(default)]
  pub definition:  Option<String>,
  #[serde(default)]
  pub description: Option<String>,
  #[serde(default)]
  pub properties:  Properties,
}

impl SimplePhenomenon {
  pub fn new(id: impl Into<String>) -> Self {
    Self {
      id:          id.into(),
      name:        None,
      definition:  None,
      description: None,
      properties:  Properties::new(),
    }
  }

  /// The simple phenomenon a field measures. The field name is the
  /// phenomenon id.
  pub fn from_field(field: &Field) -> Self {
    Self {
      id:          field.name.clone(),
      name:        field.label.clone(),
      definition:  None,
      description: field.description.clone(),
      properties:  Properties::new(),
    }
  }
}

// ─── Composite ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositePhenomenon {
  pub id:          String,
  #[serde(default)]
  pub name:        Option<String>,
  #[serde(default)]
  pub definition:  Option<String>,
  #[serde(default)]
  pub description: Option<String>,
  #[serde(default)]
  pub properties:  Properties,
  pub components:  Vec<SimplePhenomenon>,
}

impl CompositePhenomenon {
  /// Build a composite, dropping repeated component ids (first wins).
  pub fn new(id: impl Into<String>, components: Vec<SimplePhenomenon>) -> Self {
    let mut unique: Vec<SimplePhenomenon> = Vec::with_capacity(components.len());
    for c in components {
      if !unique.iter().any(|u| u.id == c.id) {
        unique.push(c);
      }
    }
    Self {
      id:          id.into(),
      name:        None,
      definition:  None,
      description: None,
      properties:  Properties::new(),
      components:  unique,
    }
  }
}

// ─── Phenomenon ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Phenomenon {
  Simple(SimplePhenomenon),
  Composite(CompositePhenomenon),
}

impl Phenomenon {
  pub fn id(&self) -> &str {
    match self {
      Self::Simple(s) => &s.id,
      Self::Composite(c) => &c.id,
    }
  }

  pub fn name(&self) -> Option<&str> {
    match self {
      Self::Simple(s) => s.name.as_deref(),
      Self::Composite(c) => c.name.as_deref(),
    }
  }

  pub fn properties(&self) -> &Properties {
    match self {
      Self::Simple(s) => &s.properties,
      Self::Composite(c) => &c.properties,
    }
  }

  pub fn is_composite(&self) -> bool { matches!(self, Self::Composite(_)) }

  /// The simple phenomena this one stands for: itself when simple.
  pub fn components(&self) -> Vec<&SimplePhenomenon> {
    match self {
      Self::Simple(s) => vec![s],
      Self::Composite(c) => c.components.iter().collect(),
    }
  }

  pub fn component_ids(&self) -> Vec<&str> {
    self.components().into_iter().map(|c| c.id.as_str()).collect()
  }

  pub fn has_component(&self, id: &str) -> bool {
    self.components().iter().any(|c| c.id == id)
  }

  /// Set equality between this phenomenon's components and `ids`.
  pub fn has_component_set(&self, ids: &[&str]) -> bool {
    let own = self.component_ids();
    own.len() == ids.len() && ids.iter().all(|id| own.contains(id))
  }

  /// Whether every component of `other` is also a component of `self`.
  pub fn covers(&self, other: &Phenomenon) -> bool {
    other.components().iter().all(|c| self.has_component(&c.id))
  }
}

impl From<SimplePhenomenon> for Phenomenon {
  fn from(s: SimplePhenomenon) -> Self { Self::Simple(s) }
}

impl From<CompositePhenomenon> for Phenomenon {
  fn from(c: CompositePhenomenon) -> Self { Self::Composite(c) }
}
