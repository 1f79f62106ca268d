//! Core types and engine for the omstore observation store.
//!
//! This crate holds the domain model and every decision the store makes:
//! phenomenon composition, field placement across bounded-width tables, the
//! write merge planner, filter compilation and evaluation, decimation and the
//! read-side assembly of observations, templates and extracts. It has no
//! database dependency; backends load a [`snapshot::StoreSnapshot`], ask the
//! engine for a plan, and apply it.

// Native `async fn` in traits is used on purpose. The `Send` bounds are spelt
// out on the returned futures instead.
#![allow(async_fn_in_trait)]

pub mod allocator;
pub mod assemble;
pub mod composer;
pub mod config;
pub mod decimate;
pub mod error;
pub mod feature;
pub mod field;
pub mod filter;
pub mod format;
pub mod geometry;
pub mod merge;
pub mod observation;
pub mod offering;
pub mod phenomenon;
pub mod procedure;
pub mod query;
pub mod removal;
pub mod snapshot;
pub mod store;
pub mod template;
pub mod time;

pub use error::{Error, Result};

/// Free-form multimap metadata attached to procedures, phenomena and
/// features. A key may carry several values.
pub type Properties = std::collections::BTreeMap<String, Vec<String>>;
