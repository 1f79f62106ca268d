//! Field placement across bounded-width physical tables.
//!
//! Every procedure owns an append-only [`FieldLedger`]: the ordered list of
//! its measured fields with the (table, column) each one was given. Tables are
//! keyed by the main value, so the main field is never placed. A field and its
//! sub-fields occupy consecutive columns of a single table and never move once
//! placed.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{
  Error, Result,
  field::{Field, FieldType, FieldValue, MainKey},
  observation::{ComplexResult, ResultRow},
};

// ─── Ledger ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Placement {
  pub field:  Field,
  pub table:  usize,
  /// First physical column; the field spans `flat_width()` columns from here.
  pub column: usize,
}

impl Placement {
  pub fn end(&self) -> usize { self.column + self.field.flat_width() }

  /// Physical columns covered by this placement.
  pub fn columns(&self) -> std::ops::Range<usize> { self.column..self.end() }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldLedger {
  pub max_width:  usize,
  pub main:       Option<Field>,
  /// In field order.
  pub placements: Vec<Placement>,
  /// Highest width each table ever reached. Removed fields leave their
  /// columns behind, so this never shrinks.
  pub widths:     BTreeMap<usize, usize>,
}

/// Additions produced by [`FieldLedger::allocate`]. Empty when the incoming
/// fields were all known.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Allocation {
  /// Set when the ledger had no main field yet.
  pub main:           Option<Field>,
  pub new_placements: Vec<Placement>,
  pub opened_tables:  Vec<usize>,
}

impl Allocation {
  pub fn is_empty(&self) -> bool {
    self.main.is_none() && self.new_placements.is_empty() && self.opened_tables.is_empty()
  }
}

/// The rows of one physical table, restricted to some of its columns.
/// `rows[i].values[0]` is the main value; value `j + 1` belongs to column
/// `columns[j]`.
#[derive(Debug, Clone, PartialEq)]
pub struct TableRows {
  pub table:   usize,
  pub columns: Vec<usize>,
  pub rows:    Vec<ResultRow>,
}

impl FieldLedger {
  pub fn new(max_width: usize) -> Self {
    Self { max_width, main: None, placements: Vec::new(), widths: BTreeMap::new() }
  }

  pub fn with_placements(
    max_width: usize,
    main: Option<Field>,
    placements: Vec<Placement>,
  ) -> Self {
    let mut ledger = Self { max_width, main, placements, widths: BTreeMap::new() };
    ledger.widths = ledger.placed_widths();
    ledger
  }

  /// Raise the recorded table widths to at least `widths`.
  pub fn with_widths(mut self, widths: impl IntoIterator<Item = (usize, usize)>) -> Self {
    for (table, width) in widths {
      self.raise_width(table, width);
    }
    self
  }

  fn placed_widths(&self) -> BTreeMap<usize, usize> {
    let mut widths = BTreeMap::new();
    for p in &self.placements {
      let width = widths.entry(p.table).or_insert(0);
      *width = p.end().max(*width);
    }
    widths
  }

  fn raise_width(&mut self, table: usize, width: usize) {
    let current = self.widths.entry(table).or_insert(0);
    *current = width.max(*current);
  }

  pub fn is_empty(&self) -> bool { self.main.is_none() }

  /// Number of physical tables. A ledger with a main field always has at
  /// least the anchor table 0.
  pub fn table_count(&self) -> usize {
    let placed = self.placements.iter().map(|p| p.table);
    match placed.chain(self.widths.keys().copied()).max() {
      Some(t) => t + 1,
      None if self.main.is_some() => 1,
      None => 0,
    }
  }

  /// Columns in use in `table`: one past the highest column ever placed,
  /// removed fields included.
  pub fn table_width(&self, table: usize) -> usize {
    self
      .placements
      .iter()
      .filter(|p| p.table == table)
      .map(Placement::end)
      .chain(self.widths.get(&table).copied())
      .max()
      .unwrap_or(0)
  }

  pub fn placement(&self, name: &str) -> Option<&Placement> {
    self.placements.iter().find(|p| p.field.name == name)
  }

  /// Main field first, then every placed field.
  pub fn fields(&self) -> Vec<Field> {
    self
      .main
      .iter()
      .cloned()
      .chain(self.placements.iter().map(|p| p.field.clone()))
      .collect()
  }

  /// Every placed column of `table`, ascending, with its type.
  pub fn table_columns(&self, table: usize) -> Vec<(usize, FieldType)> {
    let mut columns: Vec<(usize, FieldType)> = self
      .placements
      .iter()
      .filter(|p| p.table == table)
      .flat_map(|p| p.columns().zip(p.field.flat_types()))
      .collect();
    columns.sort_by_key(|(c, _)| *c);
    columns
  }

  /// Decide where the unknown fields among `fields` go.
  ///
  /// Known fields are checked against their placement: same type, and only
  /// sub-fields the placement already carries. New fields are appended to the
  /// last table while it has room, otherwise a table is opened.
  pub fn allocate(&self, main: &Field, fields: &[Field]) -> Result<Allocation> {
    let mut allocation = Allocation::default();

    match &self.main {
      Some(existing) if existing.name != main.name || existing.field_type != main.field_type => {
        return Err(Error::validation(format!(
          "main field {} ({}) does not match the stored main field {} ({})",
          main.name, main.field_type, existing.name, existing.field_type
        )));
      }
      Some(_) => {}
      None => {
        if !matches!(main.field_type, FieldType::Time | FieldType::Quantity) {
          return Err(Error::validation(format!(
            "main field {} must be a time or a quantity, got {}",
            main.name, main.field_type
          )));
        }
        allocation.main = Some(main.clone());
        allocation.opened_tables.push(0);
      }
    }

    let mut table = self.table_count().saturating_sub(1);
    let mut width = self.table_width(table);

    for field in fields {
      if field.name == main.name {
        return Err(Error::validation(format!(
          "field {} repeats the main field",
          field.name
        )));
      }
      if let Some(placed) = self.placement(&field.name) {
        check_compatible(&placed.field, field)?;
        continue;
      }
      if allocation.new_placements.iter().any(|p| p.field.name == field.name) {
        return Err(Error::validation(format!("duplicate field {}", field.name)));
      }

      let needed = field.flat_width();
      if width > 0 && width + needed > self.max_width {
        table += 1;
        width = 0;
        allocation.opened_tables.push(table);
        tracing::debug!(table, field = %field.name, "opening measure table");
      }
      allocation.new_placements.push(Placement { field: field.clone(), table, column: width });
      width += needed;
    }

    Ok(allocation)
  }

  pub fn apply(&mut self, allocation: &Allocation) {
    if let Some(main) = &allocation.main {
      self.main = Some(main.clone());
    }
    for p in &allocation.new_placements {
      self.raise_width(p.table, p.end());
    }
    self.placements.extend(allocation.new_placements.iter().cloned());
  }

  /// Forget a placed field. Its columns stay unused; later fields are appended
  /// after the table's widest extent.
  pub fn remove_field(&mut self, name: &str) -> Option<Placement> {
    let at = self.placements.iter().position(|p| p.field.name == name)?;
    let removed = self.placements.remove(at);
    self.raise_width(removed.table, removed.end());
    Some(removed)
  }

  /// Split `result` into per-table row sets. Table 0 is the anchor: it
  /// receives every row, with or without columns of its own, so a key exists
  /// even when all of a row's values live in other tables.
  pub fn partition(&self, result: &ComplexResult) -> Result<Vec<TableRows>> {
    let mut targets: Vec<(usize, usize)> = Vec::with_capacity(result.flat_width());
    for field in result.measured_fields() {
      let placed = self.placement(&field.name).ok_or_else(|| {
        Error::validation(format!("field {} has no placement", field.name))
      })?;
      targets.extend(flat_targets(placed, field)?);
    }

    let mut by_table: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
    by_table.entry(0).or_default();
    for (table, column) in &targets {
      by_table.entry(*table).or_default().insert(*column);
    }

    let main_width = result.main_field().map(Field::flat_width).unwrap_or(1);
    let mut slices = Vec::with_capacity(by_table.len());
    for (table, columns) in by_table {
      let columns: Vec<usize> = columns.into_iter().collect();
      let rows = result
        .rows
        .iter()
        .map(|row| {
          let mut values = vec![row.main().clone()];
          values.extend(columns.iter().map(|c| {
            targets
              .iter()
              .position(|t| *t == (table, *c))
              .and_then(|i| row.values.get(main_width + i))
              .cloned()
              .unwrap_or_default()
          }));
          ResultRow::new(values)
        })
        .collect();
      slices.push(TableRows { table, columns, rows });
    }
    Ok(slices)
  }

  /// Rebuild logical rows from per-table rows by an outer join on the main
  /// value. A table with no row for a key contributes nulls: a missing row
  /// reads the same as a value never measured.
  pub fn reconstruct(&self, tables: &[TableRows]) -> ComplexResult {
    let fields = self.fields();
    let width: usize = fields.iter().map(Field::flat_width).sum();

    // Physical (table, column) -> logical flat offset.
    let mut offsets: BTreeMap<(usize, usize), usize> = BTreeMap::new();
    let mut at = self.main.as_ref().map(Field::flat_width).unwrap_or(1);
    for p in &self.placements {
      for (i, column) in p.columns().enumerate() {
        offsets.insert((p.table, column), at + i);
      }
      at += p.field.flat_width();
    }

    let mut by_key: BTreeMap<MainKey, Vec<FieldValue>> = BTreeMap::new();
    for slice in tables {
      for row in &slice.rows {
        let main = row.main().clone();
        let target = by_key.entry(MainKey(main.clone())).or_insert_with(|| {
          let mut values = vec![FieldValue::Null; width];
          if let Some(first) = values.first_mut() {
            *first = main;
          }
          values
        });
        for (column, value) in slice.columns.iter().zip(row.values.iter().skip(1)) {
          if let Some(offset) = offsets.get(&(slice.table, *column))
            && !value.is_null()
          {
            target[*offset] = value.clone();
          }
        }
      }
    }

    ComplexResult::with_rows(fields, by_key.into_values().map(ResultRow::new).collect())
  }
}

/// Incoming fields may carry a subset of the placed sub-fields, never new
/// ones, and must keep every type.
fn check_compatible(placed: &Field, incoming: &Field) -> Result<()> {
  if placed.field_type != incoming.field_type {
    return Err(Error::validation(format!(
      "field {} is stored as {}, got {}",
      incoming.name, placed.field_type, incoming.field_type
    )));
  }
  let pairs = incoming
    .quality_fields
    .iter()
    .map(|q| (q, placed.quality_fields.iter().find(|p| p.name == q.name), "quality"))
    .chain(
      incoming
        .parameter_fields
        .iter()
        .map(|q| (q, placed.parameter_fields.iter().find(|p| p.name == q.name), "parameter")),
    );
  for (sub, found, family) in pairs {
    match found {
      None => {
        return Err(Error::validation(format!(
          "{family} field {} is unknown to field {}",
          sub.name, incoming.name
        )));
      }
      Some(p) if p.field_type != sub.field_type => {
        return Err(Error::validation(format!(
          "{family} field {}.{} is stored as {}, got {}",
          incoming.name, sub.name, p.field_type, sub.field_type
        )));
      }
      Some(_) => {}
    }
  }
  Ok(())
}

/// The (table, column) of each flat column of `incoming`, laid out by
/// `placed`.
fn flat_targets(placed: &Placement, incoming: &Field) -> Result<Vec<(usize, usize)>> {
  check_compatible(&placed.field, incoming)?;
  let base = placed.column;
  let quality_len = placed.field.quality_fields.len();
  let mut targets = vec![(placed.table, base)];
  for q in &incoming.quality_fields {
    if let Some(i) = placed.field.quality_index(&q.name) {
      targets.push((placed.table, base + 1 + i));
    }
  }
  for p in &incoming.parameter_fields {
    if let Some(i) = placed.field.parameter_fields.iter().position(|e| e.name == p.name) {
      targets.push((placed.table, base + 1 + quality_len + i));
    }
  }
  Ok(targets)
}

#[cfg(test)]
mod tests {
  use chrono::{TimeZone, Utc};

  use super::*;

  fn names(prefix: &str, n: usize) -> Vec<Field> {
    (0..n).map(|i| Field::quantity(format!("{prefix}{i}"))).collect()
  }

  fn place(ledger: &mut FieldLedger, fields: &[Field]) -> Allocation {
    let allocation = ledger.allocate(&Field::time("time"), fields).unwrap();
    ledger.apply(&allocation);
    allocation
  }

  #[test]
  fn first_allocation_opens_anchor_table() {
    let mut ledger = FieldLedger::new(10);
    let a = place(&mut ledger, &names("f", 3));
    assert_eq!(a.opened_tables, [0]);
    assert_eq!(ledger.table_count(), 1);
    assert_eq!(ledger.table_width(0), 3);
  }

  #[test]
  fn overflow_opens_new_tables() {
    let mut ledger = FieldLedger::new(10);
    let a = place(&mut ledger, &names("f", 23));
    assert_eq!(a.opened_tables, [0, 1, 2]);
    assert_eq!(ledger.placement("f9").map(|p| (p.table, p.column)), Some((0, 9)));
    assert_eq!(ledger.placement("f10").map(|p| (p.table, p.column)), Some((1, 0)));
    assert_eq!(ledger.placement("f22").map(|p| (p.table, p.column)), Some((2, 2)));
  }

  #[test]
  fn placements_never_move() {
    let mut ledger = FieldLedger::new(4);
    place(&mut ledger, &names("a", 3));
    let before: Vec<_> = ledger.placements.clone();

    // Subset: nothing to do.
    let a = place(&mut ledger, &names("a", 2));
    assert!(a.is_empty());

    // Extension fills the last table then opens another.
    let mut more = names("a", 3);
    more.extend(names("b", 3));
    place(&mut ledger, &more);
    assert_eq!(&ledger.placements[..3], before.as_slice());
    assert_eq!(ledger.placement("b0").map(|p| (p.table, p.column)), Some((0, 3)));
    assert_eq!(ledger.placement("b1").map(|p| (p.table, p.column)), Some((1, 0)));
  }

  #[test]
  fn removed_columns_are_not_reused() {
    let mut ledger = FieldLedger::new(10);
    place(&mut ledger, &[Field::quantity("a"), Field::quantity("b"), Field::quantity("c")]);
    ledger.remove_field("c");
    assert_eq!(ledger.table_width(0), 3);

    let a = place(&mut ledger, &[Field::quantity("aa")]);
    assert_eq!(a.new_placements[0].column, 3);

    // A reloaded ledger knows the width only through the recorded widths.
    let reloaded = FieldLedger::with_placements(10, ledger.main.clone(), vec![ledger.placements[0].clone()])
      .with_widths([(0, 4)]);
    assert_eq!(reloaded.table_width(0), 4);
    let a = reloaded.allocate(&Field::time("time"), &[Field::quantity("z")]).unwrap();
    assert_eq!(a.new_placements[0].column, 4);
  }

  #[test]
  fn fields_with_sub_fields_are_not_split() {
    let mut ledger = FieldLedger::new(4);
    place(&mut ledger, &names("a", 2));
    let wide = Field::quantity("w")
      .with_quality(Field::text("q1"))
      .with_quality(Field::text("q2"));
    place(&mut ledger, &[wide]);
    assert_eq!(ledger.placement("w").map(|p| (p.table, p.column)), Some((1, 0)));
    assert_eq!(ledger.table_width(1), 3);
  }

  #[test]
  fn type_mismatch_is_rejected() {
    let mut ledger = FieldLedger::new(10);
    place(&mut ledger, &[Field::quantity("temp")]);
    let err = ledger.allocate(&Field::time("time"), &[Field::text("temp")]).unwrap_err();
    assert!(err.is_validation());
    let err = ledger.allocate(&Field::quantity("depth"), &[]).unwrap_err();
    assert!(err.is_validation());
  }

  #[test]
  fn unknown_sub_field_is_rejected() {
    let mut ledger = FieldLedger::new(10);
    place(&mut ledger, &[Field::quantity("temp").with_quality(Field::text("flag"))]);
    let ok = ledger.allocate(&Field::time("time"), &[Field::quantity("temp")]);
    assert!(ok.is_ok());
    let bad = Field::quantity("temp").with_quality(Field::text("other"));
    assert!(ledger.allocate(&Field::time("time"), &[bad]).unwrap_err().is_validation());
  }

  #[test]
  fn partition_then_reconstruct_joins_tables() {
    let mut ledger = FieldLedger::new(2);
    place(&mut ledger, &names("f", 3));

    let t = |m| FieldValue::Time(Utc.with_ymd_and_hms(2024, 1, 1, 0, m, 0).unwrap());
    let mut fields = vec![Field::time("time")];
    // Only f2 (table 1) is written: table 0 still gets the key rows.
    fields.push(Field::quantity("f2"));
    let result = ComplexResult::with_rows(fields, vec![
      ResultRow::new(vec![t(0), FieldValue::Number(1.0)]),
      ResultRow::new(vec![t(1), FieldValue::Number(2.0)]),
    ]);

    let slices = ledger.partition(&result).unwrap();
    assert_eq!(slices.len(), 2);
    assert_eq!(slices[0].table, 0);
    assert!(slices[0].columns.is_empty());
    assert_eq!(slices[0].rows.len(), 2);
    assert_eq!(slices[1].columns, [0]);

    let rebuilt = ledger.reconstruct(&slices);
    assert_eq!(rebuilt.fields.len(), 4);
    assert_eq!(rebuilt.rows[1].values, [
      t(1),
      FieldValue::Null,
      FieldValue::Null,
      FieldValue::Number(2.0)
    ]);
  }

  #[test]
  fn partition_maps_sub_fields_by_name() {
    let mut ledger = FieldLedger::new(10);
    place(&mut ledger, &[Field::quantity("temp")
      .with_quality(Field::text("a"))
      .with_quality(Field::text("b"))]);

    let incoming = vec![
      Field::time("time"),
      Field::quantity("temp").with_quality(Field::text("b")),
    ];
    let t = FieldValue::Time(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
    let result = ComplexResult::with_rows(incoming, vec![ResultRow::new(vec![
      t,
      FieldValue::Number(3.0),
      FieldValue::Text("ok".into()),
    ])]);
    let slices = ledger.partition(&result).unwrap();
    assert_eq!(slices[0].columns, [0, 2]);
    assert_eq!(slices[0].rows[0].values[2], FieldValue::Text("ok".into()));
  }
}
