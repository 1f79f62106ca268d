//! Result templates: data-less observations describing what a procedure
//! currently records.

use serde::{Deserialize, Serialize};

use crate::{
  feature::SamplingFeature,
  field::{Field, FieldValue},
  observation::{ComplexResult, MeasureResult, Observation, ObservationResult},
  phenomenon::{CompositePhenomenon, Phenomenon, SimplePhenomenon},
  procedure::Procedure,
  query::ObservationQuery,
  snapshot::StoreSnapshot,
  time::TemporalExtent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateOptions {
  pub include_feature:    bool,
  pub include_time:       bool,
  pub include_quality:    bool,
  pub include_parameters: bool,
}

impl Default for TemplateOptions {
  fn default() -> Self {
    Self {
      include_feature:    true,
      include_time:       false,
      include_quality:    true,
      include_parameters: true,
    }
  }
}

impl From<&ObservationQuery> for TemplateOptions {
  fn from(q: &ObservationQuery) -> Self {
    Self {
      include_feature:    q.include_foi_in_template,
      include_time:       q.include_time_in_template,
      include_quality:    q.include_quality_fields,
      include_parameters: q.include_parameter_fields,
    }
  }
}

pub fn template_id(procedure: &str) -> String { format!("{procedure}-template") }

/// The phenomenon a template advertises: the union of everything the
/// procedure's observations have carried, its own current phenomenon first.
/// An existing phenomenon with that component set is reused; otherwise the
/// union is built on the fly and not stored.
pub fn template_phenomenon(snapshot: &StoreSnapshot, procedure: &Procedure) -> Option<Phenomenon> {
  let registry = &snapshot.phenomena;
  let carried = procedure
    .phenomenon
    .as_deref()
    .into_iter()
    .chain(snapshot.observations_of(&procedure.id).filter_map(|o| o.header.phenomenon.as_deref()))
    .filter_map(|id| registry.get(id));

  let mut union: Vec<SimplePhenomenon> = Vec::new();
  for phenomenon in carried {
    for c in phenomenon.components() {
      if !union.iter().any(|u| u.id == c.id) {
        union.push(c.clone());
      }
    }
  }

  let ids: Vec<&str> = union.iter().map(|c| c.id.as_str()).collect();
  match union.as_slice() {
    [] => None,
    [single] => Some(
      registry
        .find_by_components(&ids)
        .cloned()
        .unwrap_or_else(|| single.clone().into()),
    ),
    _ => Some(registry.find_by_components(&ids).cloned().unwrap_or_else(|| {
      CompositePhenomenon::new(registry.generate_id(&procedure.id), union.clone()).into()
    })),
  }
}

struct Shape {
  phenomenon: Option<Phenomenon>,
  fields:     Vec<Field>,
  feature:    Option<SamplingFeature>,
  time:       Option<TemporalExtent>,
}

fn shape(snapshot: &StoreSnapshot, procedure: &Procedure, options: &TemplateOptions) -> Shape {
  let phenomenon = template_phenomenon(snapshot, procedure);
  let fields: Vec<Field> = snapshot
    .ledgers
    .get(&procedure.id)
    .map(|l| l.fields())
    .unwrap_or_else(|| procedure.fields.clone())
    .into_iter()
    .enumerate()
    .filter(|(i, f)| *i == 0 || phenomenon.as_ref().is_none_or(|p| p.has_component(&f.name)))
    .map(|(_, f)| f.restricted(options.include_quality, options.include_parameters))
    .collect();

  let feature_ids: Vec<&str> = snapshot.feature_ids_of(&procedure.id).into_iter().collect();
  let feature = match feature_ids.as_slice() {
    [only] if options.include_feature => snapshot.features.get(*only).cloned(),
    _ => None,
  };
  let time = if options.include_time {
    TemporalExtent::union_all(snapshot.observations_of(&procedure.id).map(|o| &o.header.extent))
  } else {
    None
  };

  Shape { phenomenon, fields, feature, time }
}

/// The complex template of `procedure`.
pub fn build_template(
  snapshot: &StoreSnapshot,
  procedure: &Procedure,
  options: &TemplateOptions,
) -> Observation {
  let Shape { phenomenon, fields, feature, time } = shape(snapshot, procedure, options);
  let id = template_id(&procedure.id);
  Observation {
    name: id.clone(),
    id,
    procedure: procedure.id.clone(),
    phenomenon,
    feature_of_interest: feature,
    sampling_time: time,
    result: ObservationResult::Complex(ComplexResult::new(fields)),
    result_quality: Default::default(),
  }
}

/// One measurement template per measured field, `<procedure>-template-<i>`.
/// `i` is zero-padded to a common width so id order is field order.
pub fn measurement_templates(
  snapshot: &StoreSnapshot,
  procedure: &Procedure,
  options: &TemplateOptions,
) -> Vec<Observation> {
  let Shape { phenomenon, fields, feature, time } = shape(snapshot, procedure, options);
  let digits = fields.len().saturating_sub(1).max(1).to_string().len();
  fields
    .into_iter()
    .skip(1)
    .enumerate()
    .map(|(i, field)| {
      let component = phenomenon
        .as_ref()
        .and_then(|p| p.components().into_iter().find(|c| c.id == field.name).cloned())
        .unwrap_or_else(|| SimplePhenomenon::from_field(&field));
      let id = format!("{}-{i:0digits$}", template_id(&procedure.id));
      Observation {
        name: id.clone(),
        id,
        procedure: procedure.id.clone(),
        phenomenon: Some(component.into()),
        feature_of_interest: feature.clone(),
        sampling_time: time,
        result: ObservationResult::Measure(MeasureResult { field, value: FieldValue::Null }),
        result_quality: Default::default(),
      }
    })
    .collect()
}
