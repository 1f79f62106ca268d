//! SQLite backend for the omstore observation store.
//!
//! Wraps [`tokio_rusqlite`] so all database access runs on a dedicated thread
//! without blocking the async runtime. Every decision (merge target, column
//! placement, phenomenon composition, removal cascades) is taken by
//! `omstore-core` over a loaded snapshot; this crate loads, persists and
//! serialises writers.

mod encode;
mod lock;
mod schema;
mod store;

pub mod error;

pub use error::{Error, Result};
pub use store::SqliteStore;

#[cfg(test)]
mod fixtures;
#[cfg(test)]
mod tests;
