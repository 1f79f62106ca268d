//! Deterministic down-sampling of a result series.
//!
//! The main extent is cut into `k` equal-width buckets. Each non-empty bucket
//! emits one row: the main value of its first row, and for each numeric
//! measured field the first non-null value in the bucket. Nothing is averaged
//! or interpolated, so the output is reproducible exactly.

use crate::{
  Error, Result,
  field::{Field, FieldType, FieldValue},
  observation::{ComplexResult, ResultRow},
};

#[derive(Debug, Clone, PartialEq)]
pub struct Decimated {
  pub result:  ComplexResult,
  /// The bucket each emitted row came from. `None` when the series already
  /// fit in `k` points and was returned as is.
  pub buckets: Option<Vec<usize>>,
  /// For each emitted row, the input row it took its main value from.
  pub sources: Vec<usize>,
}

/// Reduce `result` to at most `k` rows.
///
/// Only numeric measured fields survive a reduction; text, boolean and time
/// fields and every quality or parameter sub-field are dropped. A series with
/// no numeric field, or indexed by something other than a time or a number,
/// cannot be decimated.
pub fn decimate(result: &ComplexResult, k: usize) -> Result<Decimated> {
  if k == 0 {
    return Err(Error::DecimationUnsupported("decimation size must be at least 1".into()));
  }
  let main = result
    .main_field()
    .ok_or_else(|| Error::DecimationUnsupported("result has no fields".into()))?;
  if !matches!(main.field_type, FieldType::Time | FieldType::Quantity) {
    return Err(Error::DecimationUnsupported(format!(
      "series indexed by {} field {}",
      main.field_type, main.name
    )));
  }

  let offsets = result.offsets();
  let numeric: Vec<(usize, &Field)> = result
    .fields
    .iter()
    .enumerate()
    .skip(1)
    .filter(|(_, f)| f.field_type.is_numeric())
    .map(|(i, f)| (offsets[i], f))
    .collect();
  if numeric.is_empty() {
    return Err(Error::DecimationUnsupported(
      "no numeric field to decimate".into(),
    ));
  }

  if k >= result.row_count() {
    return Ok(Decimated {
      result:  result.clone(),
      buckets: None,
      sources: (0..result.row_count()).collect(),
    });
  }

  let keys: Vec<f64> = result
    .rows
    .iter()
    .map(|r| r.main().as_f64())
    .collect::<Option<_>>()
    .ok_or_else(|| Error::DecimationUnsupported("row without a main value".into()))?;
  let min = keys.iter().copied().fold(f64::INFINITY, f64::min);
  let max = keys.iter().copied().fold(f64::NEG_INFINITY, f64::max);
  let width = (max - min) / k as f64;

  let bucket_of = |v: f64| -> usize {
    if width <= 0.0 {
      0
    } else {
      (((v - min) / width).floor() as usize).min(k - 1)
    }
  };

  let mut fields = vec![main.clone()];
  fields.extend(numeric.iter().map(|(_, f)| f.restricted(false, false)));

  let mut rows: Vec<ResultRow> = Vec::new();
  let mut buckets: Vec<usize> = Vec::new();
  let mut sources: Vec<usize> = Vec::new();
  for (index, (row, key)) in result.rows.iter().zip(&keys).enumerate() {
    let bucket = bucket_of(*key);
    if buckets.last() != Some(&bucket) {
      buckets.push(bucket);
      sources.push(index);
      let mut values = vec![row.main().clone()];
      values.resize(fields.len(), FieldValue::Null);
      rows.push(ResultRow::new(values));
    }
    let Some(current) = rows.last_mut() else { continue };
    for (slot, (offset, _)) in numeric.iter().enumerate() {
      let target = &mut current.values[slot + 1];
      if target.is_null()
        && let Some(v) = row.values.get(*offset)
      {
        *target = v.clone();
      }
    }
  }

  Ok(Decimated {
    result:  ComplexResult::with_rows(fields, rows),
    buckets: Some(buckets),
    sources,
  })
}
