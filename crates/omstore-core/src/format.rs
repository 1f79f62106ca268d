//! Text renderings of result blocks.

use chrono::{DateTime, Utc};

use crate::{
  field::{Field, FieldType},
  observation::ComplexResult,
  time::format_instant,
};

const FLAT_HEADER: &str = "time,procedure,field,value,unit";

/// Header line of flat column names, then one line per row.
pub fn csv(result: &ComplexResult) -> String {
  let header = result
    .fields
    .iter()
    .flat_map(Field::flat_names)
    .map(|n| escape(&n))
    .collect::<Vec<_>>()
    .join(",");
  let mut out = header;
  for row in &result.rows {
    out.push('\n');
    out.push_str(&row.values.iter().map(|v| escape(&v.render())).collect::<Vec<_>>().join(","));
  }
  out
}

/// One block of a flat rendering: a result and, for profiles, the instant
/// its rows were sampled at.
pub struct FlatBlock<'a> {
  pub result:  &'a ComplexResult,
  pub instant: Option<DateTime<Utc>>,
}

/// One `time,procedure,field,value,unit` line per non-null value. Timeseries
/// rows take their time from the main column; profile rows from the block
/// instant, with the main (depth) value emitted as a field of its own.
/// Returns the text and the number of value lines.
pub fn csv_flat(procedure: &str, blocks: &[FlatBlock<'_>]) -> (String, usize) {
  let mut out = String::from(FLAT_HEADER);
  let mut lines = 0;
  for block in blocks {
    let offsets = block.result.offsets();
    let timeseries = block
      .result
      .main_field()
      .is_some_and(|f| f.field_type == FieldType::Time);
    for row in &block.result.rows {
      let time = match (timeseries, block.instant) {
        (true, _) => row.main().render(),
        (false, Some(t)) => format_instant(t),
        (false, None) => String::new(),
      };
      let skip = usize::from(timeseries);
      for (field, offset) in block.result.fields.iter().zip(&offsets).skip(skip) {
        let Some(value) = row.values.get(*offset).filter(|v| !v.is_null()) else {
          continue;
        };
        out.push('\n');
        out.push_str(
          &[
            time.as_str(),
            &escape(procedure),
            &escape(&field.name),
            &escape(&value.render()),
            &escape(field.unit.as_deref().unwrap_or_default()),
          ]
          .join(","),
        );
        lines += 1;
      }
    }
  }
  (out, lines)
}

fn escape(s: &str) -> String {
  if s.contains([',', '"', '\n']) {
    format!("\"{}\"", s.replace('"', "\"\""))
  } else {
    s.to_owned()
  }
}
