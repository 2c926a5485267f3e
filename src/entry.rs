//! Cache entry record and its state machine.
//!
//! Every entry lives behind its own `Mutex`; state, value and timestamp are only
//! reachable through that lock, so "the entry lock is held while the state is read
//! or changed" is enforced by the type system rather than by convention.
//!
//! ```text
//!                add / load
//!                    │
//!                    ▼
//!   ┌──────────┐ check_in ┌───────────┐  LRU pass   ┌────────────┐
//!   │CheckedOut│─────────▶│ Available │────────────▶│ Passivated │
//!   │          │◀─────────│           │             └────────────┘
//!   └────┬─────┘ check_out└─────┬─────┘
//!        │ remove               │ remove / timeout
//!        ▼                      ▼
//!   ┌──────────────────────────────────┐
//!   │             Removed              │  terminal
//!   └──────────────────────────────────┘
//! ```

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Lifecycle state of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryState {
    /// In the index and the LRU queue; may be checked out, passivated or timed out.
    Available,
    /// Held by exactly one caller; not in the LRU queue.
    CheckedOut,
    /// Handed to the passivation store; any handle to it is stale.
    Passivated,
    /// Discarded. Terminal.
    Removed,
}

/// Shared handle to a locked entry.
pub(crate) type EntryRef<K, V> = Arc<Mutex<Entry<K, V>>>;

/// One cached value with its state and last-access time.
pub(crate) struct Entry<K, V> {
    key: K,
    value: V,
    state: EntryState,
    last_access: Instant,
}

impl<K, V> Entry<K, V> {
    /// New entry handed straight to a caller.
    pub(crate) fn checked_out(key: K, value: V) -> Self {
        Self {
            key,
            value,
            state: EntryState::CheckedOut,
            last_access: Instant::now(),
        }
    }

    /// Wraps the entry in its shared lock.
    pub(crate) fn into_ref(self) -> EntryRef<K, V> {
        Arc::new(Mutex::new(self))
    }

    #[inline]
    pub(crate) fn key(&self) -> &K {
        &self.key
    }

    #[inline]
    pub(crate) fn value(&self) -> &V {
        &self.value
    }

    #[inline]
    pub(crate) fn state(&self) -> EntryState {
        self.state
    }

    /// Moves the entry to `next`. `Removed` is terminal.
    pub(crate) fn set_state(&mut self, next: EntryState) {
        debug_assert!(
            self.state != EntryState::Removed || next == EntryState::Removed,
            "removed entries cannot be revived"
        );
        self.state = next;
    }

    /// Resets the idle clock.
    #[inline]
    pub(crate) fn touch(&mut self) {
        self.last_access = Instant::now();
    }

    /// Time since the entry was last checked in or touched.
    #[inline]
    pub(crate) fn idle(&self) -> Duration {
        self.last_access.elapsed()
    }

    /// `true` once the idle time reaches `timeout`. A zero timeout is always
    /// reached; `None` never is.
    pub(crate) fn is_timed_out(&self, timeout: Option<Duration>) -> bool {
        timeout.is_some_and(|timeout| self.idle() >= timeout)
    }
}

impl<K: fmt::Debug, V> fmt::Debug for Entry<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("key", &self.key)
            .field("state", &self.state)
            .field("idle", &self.idle())
            .finish_non_exhaustive()
    }
}
