//! Filter evaluation: the caller-supplied expression tree, property-path
//! resolution, compiled predicates and the storage pushdown derived from them.

pub mod ast;
pub mod path;
pub mod predicate;
pub mod pushdown;

pub use ast::{Filter, Literal};
pub use path::PropertyPath;
pub use predicate::{EvalContext, Predicate};
pub use pushdown::Pushdown;

use crate::Result;

/// Compile an optional filter. `None` compiles to no predicate.
pub fn compile(filter: Option<&Filter>) -> Result<Option<Predicate>> {
  filter.map(Predicate::compile).transpose()
}
