//! Property paths: the names filters use to reach into an observation and the
//! entities it references.

use std::{fmt, str::FromStr};

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
  Procedure,
  ObservedProperty,
  FeatureOfInterest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyPath {
  Procedure,
  ObservedProperty,
  FeatureOfInterest,
  Offering,
  PhenomenonTime,
  ObservationId,
  SensorType,
  /// `<entity>/properties/<key>`.
  Property { entity: Entity, key: String },
  /// `result`, `result[i]`, `result.q` or `result[i].q`. The index counts
  /// measured fields from 0; `quality` names a quality sub-field.
  Result { index: Option<usize>, quality: Option<String> },
}

impl PropertyPath {
  pub fn is_result(&self) -> bool { matches!(self, Self::Result { .. }) }
}

impl FromStr for PropertyPath {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    let invalid = || Error::InvalidPropertyPath(s.to_owned());
    let path = s.trim().trim_start_matches('/');

    let simple = match path {
      "procedure" => Some(Self::Procedure),
      "observedProperty" => Some(Self::ObservedProperty),
      "featureOfInterest" => Some(Self::FeatureOfInterest),
      "offering" => Some(Self::Offering),
      "phenomenonTime" | "time" => Some(Self::PhenomenonTime),
      "observationId" | "id" => Some(Self::ObservationId),
      "sensorType" => Some(Self::SensorType),
      _ => None,
    };
    if let Some(simple) = simple {
      return Ok(simple);
    }

    if let Some(rest) = path.strip_prefix("result") {
      return parse_result(rest).ok_or_else(invalid);
    }

    let mut parts = path.splitn(3, '/');
    let entity = match parts.next() {
      Some("procedure") => Entity::Procedure,
      Some("observedProperty") => Entity::ObservedProperty,
      Some("featureOfInterest") => Entity::FeatureOfInterest,
      _ => return Err(invalid()),
    };
    match (parts.next(), parts.next()) {
      (Some("properties"), Some(key)) if !key.is_empty() => {
        Ok(Self::Property { entity, key: key.to_owned() })
      }
      _ => Err(invalid()),
    }
  }
}

/// Parses what follows `result`: `""`, `"[i]"`, `".q"` or `"[i].q"`.
fn parse_result(rest: &str) -> Option<PropertyPath> {
  let (index, rest) = match rest.strip_prefix('[') {
    Some(inner) => {
      let (digits, after) = inner.split_once(']')?;
      (Some(digits.trim().parse::<usize>().ok()?), after)
    }
    None => (None, rest),
  };
  let quality = match rest {
    "" => None,
    q => Some(q.strip_prefix('.').filter(|q| !q.is_empty())?.to_owned()),
  };
  Some(PropertyPath::Result { index, quality })
}

impl fmt::Display for PropertyPath {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Procedure => f.write_str("procedure"),
      Self::ObservedProperty => f.write_str("observedProperty"),
      Self::FeatureOfInterest => f.write_str("featureOfInterest"),
      Self::Offering => f.write_str("offering"),
      Self::PhenomenonTime => f.write_str("phenomenonTime"),
      Self::ObservationId => f.write_str("observationId"),
      Self::SensorType => f.write_str("sensorType"),
      Self::Property { entity, key } => {
        let entity = match entity {
          Entity::Procedure => "procedure",
          Entity::ObservedProperty => "observedProperty",
          Entity::FeatureOfInterest => "featureOfInterest",
        };
        write!(f, "{entity}/properties/{key}")
      }
      Self::Result { index, quality } => {
        f.write_str("result")?;
        if let Some(i) = index {
          write!(f, "[{i}]")?;
        }
        if let Some(q) = quality {
          write!(f, ".{q}")?;
        }
        Ok(())
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn parse(s: &str) -> PropertyPath { s.parse().unwrap() }

  #[test]
  fn scalar_paths() {
    assert_eq!(parse("procedure"), PropertyPath::Procedure);
    assert_eq!(parse("/observedProperty"), PropertyPath::ObservedProperty);
    assert_eq!(parse("time"), PropertyPath::PhenomenonTime);
  }

  #[test]
  fn nested_properties() {
    assert_eq!(parse("featureOfInterest/properties/commune"), PropertyPath::Property {
      entity: Entity::FeatureOfInterest,
      key:    "commune".into(),
    });
    assert!("featureOfInterest/name".parse::<PropertyPath>().is_err());
  }

  #[test]
  fn result_paths() {
    assert_eq!(parse("result"), PropertyPath::Result { index: None, quality: None });
    assert_eq!(parse("result[2]"), PropertyPath::Result { index: Some(2), quality: None });
    assert_eq!(parse("result.flag"), PropertyPath::Result {
      index:   None,
      quality: Some("flag".into()),
    });
    assert_eq!(parse("result[0].flag"), PropertyPath::Result {
      index:   Some(0),
      quality: Some("flag".into()),
    });
    for bad in ["result[", "result[x]", "result.", "resultat", "nothing"] {
      let err = bad.parse::<PropertyPath>().unwrap_err();
      assert!(err.is_unsupported_filter(), "{bad}");
    }
  }

  #[test]
  fn display_round_trips() {
    for s in ["procedure/properties/bss", "result[1].flag", "sensorType"] {
      assert_eq!(parse(s).to_string(), s);
    }
  }
}
