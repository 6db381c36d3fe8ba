//! Per-row exclusive locks
//!
//! DuckDB has no `SELECT ... FOR UPDATE`, so the account store keeps its own
//! lock table keyed by account id. A [`RowGuard`] is held for the whole
//! balance transaction; store handles that share one [`RowLocks`] serialize
//! their commits per account. Rows that nobody holds or waits for are
//! dropped from the table.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct RowSlot {
    held: Mutex<bool>,
    released: Condvar,
}

/// Lock table shared by all store handles attached to one database
#[derive(Debug, Default)]
pub struct RowLocks {
    rows: DashMap<String, Arc<RowSlot>>,
}

impl RowLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the row is free or `deadline` passes.
    ///
    /// Returns `None` on timeout. Waiters are not queued fairly.
    pub fn acquire(&self, id: &str, deadline: Instant) -> Option<RowGuard<'_>> {
        // The map shard lock must be released before waiting
        let slot = Arc::clone(&self.rows.entry(id.to_string()).or_default());

        {
            let mut held = slot.held.lock();
            while *held {
                if slot.released.wait_until(&mut held, deadline).timed_out() && *held {
                    return None;
                }
            }
            *held = true;
        }

        Some(RowGuard {
            locks: self,
            id: id.to_string(),
            slot: Some(slot),
        })
    }

    /// Whether some handle currently holds the row
    pub fn is_locked(&self, id: &str) -> bool {
        self.rows
            .get(id)
            .map(|slot| *slot.held.lock())
            .unwrap_or(false)
    }

    /// Number of rows currently tracked (held or waited on)
    #[cfg(test)]
    pub(crate) fn tracked(&self) -> usize {
        self.rows.len()
    }
}

/// Exclusive hold on one row; released on drop
pub struct RowGuard<'a> {
    locks: &'a RowLocks,
    id: String,
    slot: Option<Arc<RowSlot>>,
}

impl RowGuard<'_> {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for RowGuard<'_> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            *slot.held.lock() = false;
            slot.released.notify_one();
        }
        self.locks
            .rows
            .remove_if(&self.id, |_, slot| Arc::strong_count(slot) == 1);
    }
}
