//! Lamport-style logical clock, kept as one counter per process.

use crate::server::ProcessId;

/// Logical clock value type.
pub(crate) type Clock = u64;

/// Vector of per-process logical counters. Every entry is monotonically
/// non-decreasing over the life of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LogicalClock {
    me: ProcessId,
    entries: Vec<Clock>,
}

impl LogicalClock {
    /// Creates an all-zero clock for a cluster of `population` processes.
    pub(crate) fn new(me: ProcessId, population: u8) -> Self {
        debug_assert!(me < population);
        LogicalClock {
            me,
            entries: vec![0; population as usize],
        }
    }

    /// Advances my own entry to `max(all entries) + 1` and returns it.
    pub(crate) fn advance_local(&mut self) -> Clock {
        let next = self.entries.iter().copied().max().unwrap_or(0) + 1;
        self.entries[self.me as usize] = next;
        next
    }

    /// Records a timestamp carried by a message from `pid`. Stale values are
    /// ignored; an entry is never decreased. Out-of-range IDs are ignored.
    pub(crate) fn observe(&mut self, pid: ProcessId, value: Clock) {
        if let Some(entry) = self.entries.get_mut(pid as usize) {
            if value > *entry {
                *entry = value;
            }
        }
    }

    /// Current value of the entry of `pid`.
    #[inline]
    pub(crate) fn get(&self, pid: ProcessId) -> Clock {
        self.entries.get(pid as usize).copied().unwrap_or(0)
    }

    /// Current value of my own entry.
    #[inline]
    pub(crate) fn local(&self) -> Clock {
        self.entries[self.me as usize]
    }
}
