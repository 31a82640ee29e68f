//! Distributed mutual exclusion engine: grants a single cluster-wide
//! critical section using per-process request flags ordered by
//! `(request clock, process ID)` pairs.
//!
//! This module only holds the state machine; sending the `LOCK`, `UNLOCK`
//! and `ACK` messages it asks for is up to the replica.

use crate::server::{Clock, LogicalClock, ProcessId};
use crate::utils::{Bitmap, LendsetError};

/// Lock state of this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockState {
    Idle,
    Requesting,
    InCritical,
}

/// Distributed mutual exclusion engine.
#[derive(Debug)]
pub(crate) struct MutexEngine {
    /// My process ID.
    me: ProcessId,

    /// My current lock state.
    state: LockState,

    /// Request flag of every process, set while it is known to contend.
    requesting: Bitmap,

    /// Request timestamp of every process, valid while its flag is set.
    req_clocks: Vec<Clock>,

    /// If true, entering additionally requires a message from every live
    /// peer timestamped after my request.
    require_acks: bool,
}

impl MutexEngine {
    /// Creates a new engine in `Idle` state.
    pub(crate) fn new(me: ProcessId, population: u8, require_acks: bool) -> Self {
        debug_assert!(me < population);
        MutexEngine {
            me,
            state: LockState::Idle,
            requesting: Bitmap::new(population, false),
            req_clocks: vec![0; population as usize],
            require_acks,
        }
    }

    /// Current lock state.
    #[inline]
    pub(crate) fn state(&self) -> LockState {
        self.state
    }

    /// Timestamp of my outstanding request, if any.
    #[inline]
    pub(crate) fn my_request(&self) -> Option<Clock> {
        match self.state {
            LockState::Idle => None,
            _ => Some(self.req_clocks[self.me as usize]),
        }
    }

    /// Is the given process known to be contending?
    #[inline]
    pub(crate) fn is_requesting(&self, pid: ProcessId) -> bool {
        self.requesting.get(pid).unwrap_or(false)
    }

    /// `Idle -> Requesting`. Sets my flag and takes a fresh timestamp, which
    /// is returned for the caller to broadcast in a `LOCK`.
    pub(crate) fn request(
        &mut self,
        clock: &mut LogicalClock,
    ) -> Result<Clock, LendsetError> {
        if self.state != LockState::Idle {
            return Err(LendsetError::msg(format!(
                "lock requested while in state {:?}",
                self.state
            )));
        }

        let stamp = clock.advance_local();
        self.requesting.set(self.me, true)?;
        self.req_clocks[self.me as usize] = stamp;
        self.state = LockState::Requesting;
        Ok(stamp)
    }

    /// Evaluates the grant condition, moving `Requesting -> InCritical` if
    /// it holds. Returns true iff I am in the critical section afterwards.
    /// Peers whose liveness bit is cleared are treated as non-contending.
    pub(crate) fn try_enter(&mut self, clock: &LogicalClock, live: &Bitmap) -> bool {
        match self.state {
            LockState::InCritical => return true,
            LockState::Idle => return false,
            LockState::Requesting => {}
        }

        let mine = (self.req_clocks[self.me as usize], self.me);
        for (pid, is_live) in live.iter() {
            if pid == self.me || !is_live {
                continue;
            }
            if self.is_requesting(pid)
                && (self.req_clocks[pid as usize], pid) < mine
            {
                return false;
            }
            if self.require_acks && (clock.get(pid), pid) < mine {
                return false;
            }
        }

        self.state = LockState::InCritical;
        true
    }

    /// `InCritical -> Idle`. Clears my flag and takes a fresh timestamp,
    /// which is returned for the caller to broadcast in an `UNLOCK`.
    pub(crate) fn release(
        &mut self,
        clock: &mut LogicalClock,
    ) -> Result<Clock, LendsetError> {
        if self.state != LockState::InCritical {
            return Err(LendsetError::msg(format!(
                "lock released while in state {:?}",
                self.state
            )));
        }

        self.requesting.set(self.me, false)?;
        self.state = LockState::Idle;
        Ok(clock.advance_local())
    }

    /// Handles a `LOCK` from a peer.
    pub(crate) fn on_lock(
        &mut self,
        clock: &mut LogicalClock,
        pid: ProcessId,
        stamp: Clock,
    ) -> Result<(), LendsetError> {
        self.check_peer(pid)?;
        clock.observe(pid, stamp);
        self.requesting.set(pid, true)?;
        self.req_clocks[pid as usize] = stamp;
        Ok(())
    }

    /// Handles an `UNLOCK` from a peer.
    pub(crate) fn on_unlock(
        &mut self,
        clock: &mut LogicalClock,
        pid: ProcessId,
        stamp: Clock,
    ) -> Result<(), LendsetError> {
        self.check_peer(pid)?;
        clock.observe(pid, stamp);
        self.requesting.set(pid, false)?;
        Ok(())
    }

    /// Handles an `ACK` from a peer.
    pub(crate) fn on_ack(
        &mut self,
        clock: &mut LogicalClock,
        pid: ProcessId,
        stamp: Clock,
    ) -> Result<(), LendsetError> {
        self.check_peer(pid)?;
        clock.observe(pid, stamp);
        Ok(())
    }

    /// Forgets whatever I knew about a peer's request; called when the peer
    /// (re)introduces itself, after which it re-sends any live request.
    pub(crate) fn reset_peer(&mut self, pid: ProcessId) -> Result<(), LendsetError> {
        self.check_peer(pid)?;
        self.requesting.set(pid, false)?;
        Ok(())
    }

    fn check_peer(&self, pid: ProcessId) -> Result<(), LendsetError> {
        if pid == self.me || pid >= self.requesting.size() {
            return Err(LendsetError::msg(format!("invalid peer ID {}", pid)));
        }
        Ok(())
    }
}
