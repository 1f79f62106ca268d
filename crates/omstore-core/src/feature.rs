//! Sampling features (features of interest): the spatial entities observed.

use serde::{Deserialize, Serialize};

use crate::{Properties, geometry::Geometry};

/// Referenced by observations; removed once no observation references it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingFeature {
  pub id:              String,
  #[serde(default)]
  pub name:            Option<String>,
  #[serde(default)]
  pub description:     Option<String>,
  #[serde(default)]
  pub geometry:        Option<Geometry>,
  /// The larger feature this one samples, if known.
  #[serde(default)]
  pub sampled_feature: Option<String>,
  #[serde(default)]
  pub properties:      Properties,
}

impl SamplingFeature {
  pub fn new(id: impl Into<String>) -> Self {
    Self {
      id:              id.into(),
      name:            None,
      description:     None,
      geometry:        None,
      sampled_feature: None,
      properties:      Default::default(),
    }
  }

  pub fn with_geometry(mut self, geometry: Geometry) -> Self {
    self.geometry = Some(geometry);
    self
  }
}
