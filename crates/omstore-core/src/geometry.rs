//! Minimal geometry support: the shapes sampling features and procedure
//! locations carry, their envelopes, and normalisation of the handful of
//! coordinate reference systems sensors report in.
//!
//! Every spatial comparison happens in CRS:84 (longitude, latitude).

use std::{f64::consts::PI, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

const EARTH_RADIUS: f64 = 6_378_137.0;

// ─── CRS ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Crs {
  /// WGS84, longitude first.
  #[default]
  #[serde(rename = "CRS:84")]
  Crs84,
  /// WGS84, latitude first.
  #[serde(rename = "EPSG:4326")]
  Epsg4326,
  /// Spherical (web) mercator, metres.
  #[serde(rename = "EPSG:3857")]
  Epsg3857,
}

impl FromStr for Crs {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    let code = s
      .rsplit([':', '/'])
      .find(|part| !part.is_empty())
      .unwrap_or_default();
    match code.to_ascii_uppercase().as_str() {
      "84" | "CRS84" => Ok(Self::Crs84),
      "4326" => Ok(Self::Epsg4326),
      "3857" | "900913" => Ok(Self::Epsg3857),
      _ => Err(Error::Geometry(format!("unsupported crs {s:?}"))),
    }
  }
}

impl Crs {
  fn to_crs84(self, c: Coord) -> Coord {
    match self {
      Self::Crs84 => c,
      Self::Epsg4326 => Coord { x: c.y, y: c.x },
      Self::Epsg3857 => Coord {
        x: (c.x / EARTH_RADIUS).to_degrees(),
        y: (2.0 * (c.y / EARTH_RADIUS).exp().atan() - PI / 2.0).to_degrees(),
      },
    }
  }
}

// ─── Shapes ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coord {
  pub x: f64,
  pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "coordinates", rename_all = "snake_case")]
pub enum Shape {
  Point(Coord),
  LineString(Vec<Coord>),
  /// Exterior ring only.
  Polygon(Vec<Coord>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
  #[serde(default)]
  pub crs:   Crs,
  pub shape: Shape,
}

impl Geometry {
  pub fn point(crs: Crs, x: f64, y: f64) -> Self {
    Self { crs, shape: Shape::Point(Coord { x, y }) }
  }

  fn coords(&self) -> &[Coord] {
    match &self.shape {
      Shape::Point(c) => std::slice::from_ref(c),
      Shape::LineString(cs) | Shape::Polygon(cs) => cs,
    }
  }

  /// The same geometry expressed in CRS:84.
  pub fn to_crs84(&self) -> Geometry {
    let map = |c: &Coord| self.crs.to_crs84(*c);
    let shape = match &self.shape {
      Shape::Point(c) => Shape::Point(map(c)),
      Shape::LineString(cs) => Shape::LineString(cs.iter().map(map).collect()),
      Shape::Polygon(cs) => Shape::Polygon(cs.iter().map(map).collect()),
    };
    Geometry { crs: Crs::Crs84, shape }
  }

  /// Envelope in CRS:84. `None` for an empty line or polygon.
  pub fn envelope(&self) -> Option<Envelope> {
    Envelope::of(self.to_crs84().coords())
  }
}

// ─── Envelope ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
  pub min_x: f64,
  pub min_y: f64,
  pub max_x: f64,
  pub max_y: f64,
}

impl Envelope {
  fn of(coords: &[Coord]) -> Option<Envelope> {
    let first = coords.first()?;
    let init = Envelope { min_x: first.x, min_y: first.y, max_x: first.x, max_y: first.y };
    Some(coords.iter().fold(init, |e, c| Envelope {
      min_x: e.min_x.min(c.x),
      min_y: e.min_y.min(c.y),
      max_x: e.max_x.max(c.x),
      max_y: e.max_y.max(c.y),
    }))
  }

  /// Build a CRS:84 envelope from corner values expressed in `crs`.
  pub fn from_corners(corners: [f64; 4], crs: Crs) -> Envelope {
    let a = crs.to_crs84(Coord { x: corners[0], y: corners[1] });
    let b = crs.to_crs84(Coord { x: corners[2], y: corners[3] });
    Envelope {
      min_x: a.x.min(b.x),
      min_y: a.y.min(b.y),
      max_x: a.x.max(b.x),
      max_y: a.y.max(b.y),
    }
  }

  pub fn intersects(&self, other: &Envelope) -> bool {
    self.min_x <= other.max_x
      && other.min_x <= self.max_x
      && self.min_y <= other.max_y
      && other.min_y <= self.max_y
  }

  pub fn union(&self, other: &Envelope) -> Envelope {
    Envelope {
      min_x: self.min_x.min(other.min_x),
      min_y: self.min_y.min(other.min_y),
      max_x: self.max_x.max(other.max_x),
      max_y: self.max_y.max(other.max_y),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_common_crs_spellings() {
    assert_eq!("CRS:84".parse::<Crs>().unwrap(), Crs::Crs84);
    assert_eq!("EPSG:4326".parse::<Crs>().unwrap(), Crs::Epsg4326);
    assert_eq!("urn:ogc:def:crs:EPSG::4326".parse::<Crs>().unwrap(), Crs::Epsg4326);
    assert_eq!(
      "http://www.opengis.net/def/crs/EPSG/0/3857".parse::<Crs>().unwrap(),
      Crs::Epsg3857
    );
    assert!("EPSG:27572".parse::<Crs>().is_err());
  }

  #[test]
  fn epsg4326_swaps_axes() {
    let g = Geometry::point(Crs::Epsg4326, 43.5, 1.2);
    let env = g.envelope().unwrap();
    assert_eq!((env.min_x, env.min_y), (1.2, 43.5));
  }

  #[test]
  fn mercator_origin_maps_to_zero() {
    let g = Geometry::point(Crs::Epsg3857, 0.0, 0.0).to_crs84();
    assert_eq!(g.shape, Shape::Point(Coord { x: 0.0, y: 0.0 }));
    let env = Envelope::from_corners([-20_037_508.34, 0.0, 20_037_508.34, 1.0], Crs::Epsg3857);
    assert!((env.min_x + 180.0).abs() < 1e-6);
    assert!((env.max_x - 180.0).abs() < 1e-6);
  }

  #[test]
  fn envelope_intersection() {
    let a = Envelope { min_x: 0.0, min_y: 0.0, max_x: 2.0, max_y: 2.0 };
    let b = Envelope { min_x: 2.0, min_y: 1.0, max_x: 3.0, max_y: 3.0 };
    let c = Envelope { min_x: 5.0, min_y: 5.0, max_x: 6.0, max_y: 6.0 };
    assert!(a.intersects(&b));
    assert!(!a.intersects(&c));
    assert_eq!(a.union(&c).max_x, 6.0);
  }
}
