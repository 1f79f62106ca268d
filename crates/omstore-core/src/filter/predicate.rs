//! Compiled predicates and their in-memory evaluation.
//!
//! A predicate is evaluated at one of two scopes. At entity scope it decides
//! whether an observation (or a template, a procedure, a feature...) is kept;
//! result and time atoms then match when any row matches. At row scope the
//! same atoms are evaluated against a single row, which is how inline
//! observation queries restrict their rows.

use std::cmp::Ordering;

use crate::{
  Error, Result,
  feature::SamplingFeature,
  field::FieldValue,
  geometry::{Crs, Envelope},
  observation::ComplexResult,
  phenomenon::Phenomenon,
  procedure::Procedure,
  time::TemporalExtent,
};

use super::{
  ast::Filter,
  path::{Entity, PropertyPath},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
  Eq,
  Ne,
  Lt,
  Le,
  Gt,
  Ge,
}

impl CompareOp {
  fn test(self, ord: Ordering) -> bool {
    match self {
      Self::Eq => ord == Ordering::Equal,
      Self::Ne => ord != Ordering::Equal,
      Self::Lt => ord == Ordering::Less,
      Self::Le => ord != Ordering::Greater,
      Self::Gt => ord == Ordering::Greater,
      Self::Ge => ord != Ordering::Less,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemporalOp {
  Equals,
  During,
  Before,
  After,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
  Compare { path: PropertyPath, op: CompareOp, value: FieldValue },
  Like { path: PropertyPath, pattern: String },
  And(Vec<Predicate>),
  Or(Vec<Predicate>),
  Not(Box<Predicate>),
  /// CRS:84 envelope.
  BBox(Envelope),
  Temporal { op: TemporalOp, extent: TemporalExtent },
  ResourceId(Vec<String>),
}

/// Everything a predicate can look at for one candidate.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvalContext<'a> {
  /// Id of the entity being selected, for `resourceId`.
  pub entity_id:        Option<&'a str>,
  pub observation_id:   Option<&'a str>,
  pub procedure:        Option<&'a Procedure>,
  pub phenomenon:       Option<&'a Phenomenon>,
  pub feature:          Option<&'a SamplingFeature>,
  pub extent:           Option<&'a TemporalExtent>,
  /// Rows over the procedure's full field list; `result[i]` indexes its
  /// measured fields.
  pub result:           Option<&'a ComplexResult>,
  /// Restricts result atoms to one measured field.
  pub measured_field:   Option<usize>,
  /// `bbox` looks at the procedure's last location before the feature.
  pub locate_procedure: bool,
}

impl Predicate {
  pub fn compile(filter: &Filter) -> Result<Predicate> {
    let compare = |property: &str, op, value: &super::ast::Literal| -> Result<Predicate> {
      Ok(Predicate::Compare { path: property.parse()?, op, value: value.to_value() })
    };
    let temporal = |property: &str, op, extent: &TemporalExtent| -> Result<Predicate> {
      match property.parse::<PropertyPath>()? {
        PropertyPath::PhenomenonTime => {}
        other => {
          return Err(Error::UnsupportedFilter(format!(
            "temporal operator on non-temporal property {other}"
          )));
        }
      }
      if op == TemporalOp::Equals && extent.is_period() {
        return Err(Error::UnsupportedFilter(
          "tequals against a period has no defined semantics".into(),
        ));
      }
      Ok(Predicate::Temporal { op, extent: *extent })
    };

    match filter {
      Filter::Equal { property, value } => compare(property, CompareOp::Eq, value),
      Filter::NotEqual { property, value } => compare(property, CompareOp::Ne, value),
      Filter::Less { property, value } => compare(property, CompareOp::Lt, value),
      Filter::LessOrEqual { property, value } => compare(property, CompareOp::Le, value),
      Filter::Greater { property, value } => compare(property, CompareOp::Gt, value),
      Filter::GreaterOrEqual { property, value } => compare(property, CompareOp::Ge, value),
      Filter::Like { property, pattern } => {
        Ok(Predicate::Like { path: property.parse()?, pattern: pattern.clone() })
      }
      Filter::And { filters } => {
        Ok(Predicate::And(filters.iter().map(Predicate::compile).collect::<Result<_>>()?))
      }
      Filter::Or { filters } => {
        Ok(Predicate::Or(filters.iter().map(Predicate::compile).collect::<Result<_>>()?))
      }
      Filter::Not { filter } => Ok(Predicate::Not(Box::new(Predicate::compile(filter)?))),
      Filter::BBox { envelope, crs, .. } => {
        let crs = match crs {
          Some(c) => c.parse::<Crs>()?,
          None => Crs::Crs84,
        };
        Ok(Predicate::BBox(Envelope::from_corners(*envelope, crs)))
      }
      Filter::TEquals { property, time } => temporal(property, TemporalOp::Equals, time),
      Filter::During { property, time } => temporal(property, TemporalOp::During, time),
      Filter::Before { property, time } => temporal(property, TemporalOp::Before, time),
      Filter::After { property, time } => temporal(property, TemporalOp::After, time),
      Filter::ResourceId { ids } => Ok(Predicate::ResourceId(ids.clone())),
    }
  }

  /// Whether any atom depends on individual rows.
  pub fn has_row_terms(&self) -> bool {
    match self {
      Self::Compare { path, .. } | Self::Like { path, .. } => {
        path.is_result() || *path == PropertyPath::PhenomenonTime
      }
      Self::Temporal { .. } => true,
      Self::And(ps) | Self::Or(ps) => ps.iter().any(Predicate::has_row_terms),
      Self::Not(p) => p.has_row_terms(),
      Self::BBox(_) | Self::ResourceId(_) => false,
    }
  }

  /// Entity scope: row-dependent atoms match when any row does.
  pub fn matches(&self, ctx: &EvalContext<'_>) -> bool { self.eval(ctx, None) }

  /// Row scope: row-dependent atoms see only `row`.
  pub fn matches_row(&self, ctx: &EvalContext<'_>, row: usize) -> bool {
    self.eval(ctx, Some(row))
  }

  /// Row indices of `ctx.result` kept at row scope.
  pub fn matching_rows(&self, ctx: &EvalContext<'_>) -> Vec<usize> {
    let count = ctx.result.map(ComplexResult::row_count).unwrap_or(0);
    (0..count).filter(|r| self.matches_row(ctx, *r)).collect()
  }

  fn eval(&self, ctx: &EvalContext<'_>, row: Option<usize>) -> bool {
    match self {
      Self::And(ps) => ps.iter().all(|p| p.eval(ctx, row)),
      Self::Or(ps) => ps.iter().any(|p| p.eval(ctx, row)),
      Self::Not(p) => !p.eval(ctx, row),
      Self::ResourceId(ids) => ctx
        .entity_id
        .or(ctx.observation_id)
        .is_some_and(|id| ids.iter().any(|i| i == id)),
      Self::BBox(envelope) => location_envelope(ctx).is_some_and(|e| e.intersects(envelope)),
      Self::Temporal { op, extent } => {
        times(ctx, row).iter().any(|t| temporal_matches(*op, t, extent))
      }
      // Not carrying the property at all, as a component or as itself.
      Self::Compare { path: path @ PropertyPath::ObservedProperty, op: CompareOp::Ne, value } => {
        !eval_atom(ctx, row, path, &|v| v.compare(value) == Some(Ordering::Equal))
      }
      Self::Compare { path, op, value } => {
        eval_atom(ctx, row, path, &|v| v.compare(value).is_some_and(|o| op.test(o)))
      }
      Self::Like { path, pattern } => {
        eval_atom(ctx, row, path, &|v| !v.is_null() && like(pattern, &v.render()))
      }
    }
  }
}

fn eval_atom(
  ctx: &EvalContext<'_>,
  row: Option<usize>,
  path: &PropertyPath,
  test: &dyn Fn(&FieldValue) -> bool,
) -> bool {
  let text = |s: &str| test(&FieldValue::Text(s.to_owned()));
  match path {
    PropertyPath::Procedure => ctx.procedure.is_some_and(|p| text(&p.id)),
    PropertyPath::Offering => ctx.procedure.is_some_and(|p| text(&p.offering_id())),
    PropertyPath::SensorType => ctx.procedure.is_some_and(|p| text(p.sensor_type.as_ref())),
    PropertyPath::FeatureOfInterest => ctx.feature.is_some_and(|f| text(&f.id)),
    PropertyPath::ObservationId => ctx.observation_id.is_some_and(text),
    // A composite matches through its own id or any component id.
    PropertyPath::ObservedProperty => ctx
      .phenomenon
      .is_some_and(|p| std::iter::once(p.id()).chain(p.component_ids()).any(text)),
    PropertyPath::Property { entity, key } => {
      let properties = match entity {
        Entity::Procedure => ctx.procedure.map(|p| &p.properties),
        Entity::ObservedProperty => ctx.phenomenon.map(Phenomenon::properties),
        Entity::FeatureOfInterest => ctx.feature.map(|f| &f.properties),
      };
      properties
        .and_then(|props| props.get(key))
        .is_some_and(|values| values.iter().any(|v| text(v)))
    }
    PropertyPath::PhenomenonTime => times(ctx, row).iter().any(|t| {
      // Ordering against a time literal: an extent is before `x` when it
      // ends before it, after when it begins after it.
      let (lo, hi) = (FieldValue::Time(t.begin()), FieldValue::Time(t.end()));
      if t.is_period() { test(&lo) && test(&hi) } else { test(&lo) }
    }),
    PropertyPath::Result { index, quality } => result_values(ctx, row, *index, quality.as_deref())
      .iter()
      .any(|v| test(v)),
  }
}

/// The extents row-dependent time atoms look at.
fn times(ctx: &EvalContext<'_>, row: Option<usize>) -> Vec<TemporalExtent> {
  let timed = ctx
    .result
    .filter(|r| r.main_field().is_some_and(|f| f.field_type == crate::field::FieldType::Time));
  match (timed, row) {
    (Some(result), Some(r)) => result
      .rows
      .get(r)
      .and_then(|row| row.main().as_time())
      .map(TemporalExtent::instant)
      .into_iter()
      .collect(),
    (Some(result), None) if !result.rows.is_empty() => result
      .rows
      .iter()
      .filter_map(|row| row.main().as_time())
      .map(TemporalExtent::instant)
      .collect(),
    _ => ctx.extent.copied().into_iter().collect(),
  }
}

fn temporal_matches(op: TemporalOp, value: &TemporalExtent, filter: &TemporalExtent) -> bool {
  match op {
    TemporalOp::Equals => value == filter,
    TemporalOp::During => value.during(filter),
    TemporalOp::Before => value.before(filter),
    TemporalOp::After => value.after(filter),
  }
}

fn result_values<'a>(
  ctx: &EvalContext<'a>,
  row: Option<usize>,
  index: Option<usize>,
  quality: Option<&str>,
) -> Vec<&'a FieldValue> {
  let Some(result) = ctx.result else {
    return Vec::new();
  };
  let measured = result.measured_fields().len();
  let fields: Vec<usize> = match (index, ctx.measured_field) {
    (Some(i), Some(only)) if i != only => Vec::new(),
    (Some(i), _) => vec![i],
    (None, Some(only)) => vec![only],
    (None, None) => (0..measured).collect(),
  };
  let rows: Vec<usize> = match row {
    Some(r) => vec![r],
    None => (0..result.row_count()).collect(),
  };

  let mut values = Vec::new();
  for r in rows {
    for &f in &fields {
      let value = match quality {
        Some(q) => result.quality_value(r, f, q),
        None => result.measured_value(r, f),
      };
      if let Some(v) = value.filter(|v| !v.is_null()) {
        values.push(v);
      }
    }
  }
  values
}

fn location_envelope(ctx: &EvalContext<'_>) -> Option<Envelope> {
  let feature = ctx.feature.and_then(|f| f.geometry.as_ref());
  let location = ctx.procedure.and_then(|p| p.last_location()).map(|l| &l.geometry);
  if ctx.locate_procedure {
    location.or(feature)?.envelope()
  } else {
    feature.or(location)?.envelope()
  }
}

/// SQL `LIKE` matching: `%` is any run, `_` any single character. Case
/// sensitive.
pub fn like(pattern: &str, text: &str) -> bool {
  let p: Vec<char> = pattern.chars().collect();
  let t: Vec<char> = text.chars().collect();
  let (mut pi, mut ti) = (0, 0);
  let mut star: Option<(usize, usize)> = None;
  while ti < t.len() {
    match p.get(pi) {
      Some('%') => {
        star = Some((pi, ti));
        pi += 1;
      }
      Some(&c) if c == '_' || c == t[ti] => {
        pi += 1;
        ti += 1;
      }
      _ => match star {
        Some((sp, st)) => {
          pi = sp + 1;
          ti = st + 1;
          star = Some((sp, st + 1));
        }
        None => return false,
      },
    }
  }
  p[pi..].iter().all(|c| *c == '%')
}

#[cfg(test)]
mod tests {
  use chrono::{DateTime, TimeZone, Utc};

  use super::*;
  use crate::{
    Properties,
    field::Field,
    geometry::Geometry,
    observation::ResultRow,
    phenomenon::{CompositePhenomenon, SimplePhenomenon},
    procedure::{ObservationShape, SensorType},
  };

  fn t(m: u32) -> DateTime<Utc> { Utc.with_ymd_and_hms(2024, 2, 1, 0, m, 0).unwrap() }

  struct Fixture {
    procedure:  Procedure,
    phenomenon: Phenomenon,
    feature:    SamplingFeature,
    extent:     TemporalExtent,
    result:     ComplexResult,
  }

  impl Fixture {
    fn new() -> Self {
      let mut properties = Properties::new();
      properties.insert("bss".into(), vec!["10972X0137/PONT".into(), "other".into()]);
      let procedure = Procedure {
        id: "sensor-3".into(),
        name: None,
        description: None,
        sensor_type: SensorType::System,
        shape: ObservationShape::Timeseries,
        properties,
        fields: Vec::new(),
        phenomenon: Some("agg".into()),
        locations: Vec::new(),
      };
      let phenomenon = CompositePhenomenon::new("agg", vec![
        SimplePhenomenon::new("temp"),
        SimplePhenomenon::new("sal"),
      ])
      .into();
      let mut feature = SamplingFeature::new("station-1")
        .with_geometry(Geometry::point(Crs::Crs84, 2.35, 48.85));
      feature.properties.insert("commune".into(), vec!["Argeles".into()]);

      let fields = vec![
        Field::time("time"),
        Field::quantity("temp").with_quality(Field::text("flag")),
        Field::quantity("sal"),
      ];
      let row = |m, temp, flag: &str, sal| {
        ResultRow::new(vec![
          FieldValue::Time(t(m)),
          FieldValue::Number(temp),
          FieldValue::Text(flag.into()),
          FieldValue::Number(sal),
        ])
      };
      let result = ComplexResult::with_rows(fields, vec![
        row(0, 10.0, "good", 35.0),
        row(10, 12.0, "bad", 35.5),
        row(20, 14.0, "good", 36.0),
      ]);
      Fixture {
        procedure,
        phenomenon,
        feature,
        extent: TemporalExtent::between(t(0), t(20)),
        result,
      }
    }

    fn ctx(&self) -> EvalContext<'_> {
      EvalContext {
        entity_id:        Some("sensor-3-obs-1"),
        observation_id:   Some("sensor-3-obs-1"),
        procedure:        Some(&self.procedure),
        phenomenon:       Some(&self.phenomenon),
        feature:          Some(&self.feature),
        extent:           Some(&self.extent),
        result:           Some(&self.result),
        measured_field:   None,
        locate_procedure: false,
      }
    }
  }

  fn compile(filter: Filter) -> Predicate { Predicate::compile(&filter).unwrap() }

  #[test]
  fn scalar_properties() {
    let f = Fixture::new();
    let ctx = f.ctx();
    assert!(compile(Filter::equal("procedure", "sensor-3")).matches(&ctx));
    assert!(compile(Filter::equal("offering", "offering-sensor-3")).matches(&ctx));
    assert!(compile(Filter::equal("sensorType", "system")).matches(&ctx));
    assert!(compile(Filter::equal("featureOfInterest", "station-1")).matches(&ctx));
    assert!(!compile(Filter::equal("observationId", "other")).matches(&ctx));
  }

  #[test]
  fn observed_property_matches_components() {
    let f = Fixture::new();
    let ctx = f.ctx();
    assert!(compile(Filter::equal("observedProperty", "agg")).matches(&ctx));
    assert!(compile(Filter::equal("observedProperty", "sal")).matches(&ctx));
    assert!(!compile(Filter::not_equal("observedProperty", "sal")).matches(&ctx));
    assert!(compile(Filter::not_equal("observedProperty", "oxy")).matches(&ctx));
  }

  #[test]
  fn nested_properties_match_any_value() {
    let f = Fixture::new();
    let ctx = f.ctx();
    assert!(compile(Filter::equal("procedure/properties/bss", "other")).matches(&ctx));
    assert!(compile(Filter::like("procedure/properties/bss", "10972X%")).matches(&ctx));
    assert!(compile(Filter::like("featureOfInterest/properties/commune", "Arg_les")).matches(&ctx));
    assert!(!compile(Filter::equal("featureOfInterest/properties/missing", "x")).matches(&ctx));
  }

  #[test]
  fn result_atoms_at_both_scopes() {
    let f = Fixture::new();
    let ctx = f.ctx();
    let p = compile(Filter::greater("result[0]", 11.0));
    assert!(p.matches(&ctx));
    assert_eq!(p.matching_rows(&ctx), [1, 2]);

    let any = compile(Filter::greater("result", 35.8));
    assert_eq!(any.matching_rows(&ctx), [2]);

    let quality = compile(Filter::equal("result[0].flag", "bad"));
    assert_eq!(quality.matching_rows(&ctx), [1]);
    let quality_any = compile(Filter::equal("result.flag", "good"));
    assert_eq!(quality_any.matching_rows(&ctx), [0, 2]);

    let single = EvalContext { measured_field: Some(1), ..ctx };
    assert!(!compile(Filter::less("result", 20.0)).matches(&single));
  }

  #[test]
  fn temporal_atoms() {
    let f = Fixture::new();
    let ctx = f.ctx();
    let during = compile(Filter::during(TemporalExtent::between(t(5), t(25))));
    assert!(during.matches(&ctx));
    assert_eq!(during.matching_rows(&ctx), [1, 2]);

    let equals = compile(Filter::tequals(TemporalExtent::instant(t(10))));
    assert_eq!(equals.matching_rows(&ctx), [1]);

    let before = compile(Filter::before(TemporalExtent::instant(t(5))));
    assert_eq!(before.matching_rows(&ctx), [0]);

    let after = compile(Filter::after(TemporalExtent::instant(t(30))));
    assert!(!after.matches(&ctx));

    let template = EvalContext { result: None, ..ctx };
    assert!(!compile(Filter::during(TemporalExtent::between(t(5), t(25)))).matches(&template));
    assert!(compile(Filter::during(TemporalExtent::between(t(0), t(25)))).matches(&template));
  }

  #[test]
  fn tequals_period_is_unsupported() {
    let err = Predicate::compile(&Filter::tequals(TemporalExtent::between(t(0), t(1))))
      .unwrap_err();
    assert!(err.is_unsupported_filter());
  }

  #[test]
  fn bbox_normalises_crs() {
    let f = Fixture::new();
    let ctx = f.ctx();
    assert!(compile(Filter::bbox([2.0, 48.0, 3.0, 49.0], None)).matches(&ctx));
    // Same box with latitude first.
    assert!(compile(Filter::bbox([48.0, 2.0, 49.0, 3.0], Some("EPSG:4326"))).matches(&ctx));
    assert!(!compile(Filter::bbox([10.0, 10.0, 11.0, 11.0], None)).matches(&ctx));
  }

  #[test]
  fn combinators_nest() {
    let f = Fixture::new();
    let ctx = f.ctx();
    let p = compile(Filter::and([
      Filter::or([Filter::equal("procedure", "nope"), Filter::equal("procedure", "sensor-3")]),
      Filter::not(Filter::equal("featureOfInterest", "station-2")),
    ]));
    assert!(p.matches(&ctx));
    assert!(!p.has_row_terms());
  }

  #[test]
  fn like_patterns() {
    assert!(like("%", ""));
    assert!(like("a%c", "abbbc"));
    assert!(like("a_c", "abc"));
    assert!(!like("a_c", "abbc"));
    assert!(like("%b%", "abc"));
    assert!(!like("A%", "abc"));
  }
}
