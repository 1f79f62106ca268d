//! Writer serialisation.
//!
//! A write plans against what it loaded, so two writes to one procedure must
//! not interleave. Writes to distinct procedures may. Removal cascades touch
//! every procedure and run alone.

use std::{
  collections::HashMap,
  sync::{Arc, Mutex as SyncMutex, PoisonError},
};

use tokio::sync::{Mutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

type Slots = Arc<SyncMutex<HashMap<String, Arc<Mutex<()>>>>>;

#[derive(Default)]
pub struct WriteGate {
  cascade:    Arc<RwLock<()>>,
  /// One slot per procedure with a write running or waiting.
  procedures: Slots,
}

/// Held for the duration of a single-procedure write. Dropping the last
/// guard of a procedure frees its slot.
pub struct ProcedureGuard {
  _cascade:  OwnedRwLockReadGuard<()>,
  procedure: Option<OwnedMutexGuard<()>>,
  slot:      Arc<Mutex<()>>,
  key:       String,
  slots:     Slots,
}

impl Drop for ProcedureGuard {
  fn drop(&mut self) {
    self.procedure.take();
    let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
    // The map and this guard hold the only handles: nobody is waiting.
    if Arc::strong_count(&self.slot) == 2 {
      slots.remove(&self.key);
    }
  }
}

/// Held for the duration of a removal cascade.
pub struct CascadeGuard {
  _cascade: OwnedRwLockWriteGuard<()>,
}

impl WriteGate {
  pub fn new() -> Self { Self::default() }

  /// Wait until no cascade runs and no other write holds `procedure`.
  pub async fn procedure(&self, procedure: &str) -> ProcedureGuard {
    let cascade = self.cascade.clone().read_owned().await;
    let slot = self
      .procedures
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .entry(procedure.to_owned())
      .or_default()
      .clone();
    let held = slot.clone().lock_owned().await;
    ProcedureGuard {
      _cascade:  cascade,
      procedure: Some(held),
      slot,
      key:       procedure.to_owned(),
      slots:     self.procedures.clone(),
    }
  }

  /// Wait until every in-flight write has finished, then exclude new ones.
  pub async fn cascade(&self) -> CascadeGuard {
    CascadeGuard { _cascade: self.cascade.clone().write_owned().await }
  }

  #[cfg(test)]
  fn slot_count(&self) -> usize {
    self.procedures.lock().unwrap_or_else(PoisonError::into_inner).len()
  }
}
