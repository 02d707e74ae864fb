// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared ABI types for the mesh micro-kernel.
//!
//! This crate holds the small, dependency-light vocabulary that the
//! scheduler, the mesh/router layer, and any integrator code all need to
//! agree on. It has no knowledge of messages, tasks, or tunnels -- those
//! live in `kern`, where the invariants around them are enforced.

#![cfg_attr(not(test), no_std)]

use core::fmt;

/// Indicates the scheduling priority of a task.
///
/// Priorities are small numbers starting from zero. Numerically lower
/// priorities are more important, so priority 0 runs before priority 1, and
/// so on. This type deliberately does not implement `PartialOrd`/`Ord`, so
/// that callers can't confuse "greater priority value" with "more important".
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
#[repr(transparent)]
pub struct Priority(pub u8);

impl Priority {
    /// Checks whether `self` should be scheduled ahead of `other`.
    pub fn is_more_important_than(self, other: Self) -> bool {
        self.0 < other.0
    }
}

impl From<u8> for Priority {
    fn from(v: u8) -> Self {
        Priority(v)
    }
}

bitflags::bitflags! {
    /// Scheduling state of a task, tracked by the kernel between passes.
    ///
    /// `IDLE` is the empty set. `IGNORE` is never stored -- it only appears
    /// as a callback return value meaning "leave my state alone".
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
    pub struct TaskState: u8 {
        const BUSY           = 1 << 0;
        const MSG_PENDING    = 1 << 1;
        const READY_TO_SLEEP = 1 << 2;
    }
}

/// The value a task callback hands back to the scheduler.
///
/// `Ignore` is the one variant that does not become the task's new
/// [`TaskState`] -- everything else overwrites it wholesale.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TaskReturn {
    Idle,
    Busy,
    Ignore,
    ReadyToSleep,
}

impl TaskReturn {
    /// The `TaskState` this return value maps to, or `None` for `Ignore`
    /// (meaning "the scheduler should not touch the stored state").
    pub fn to_state(self) -> Option<TaskState> {
        match self {
            TaskReturn::Idle => Some(TaskState::empty()),
            TaskReturn::Busy => Some(TaskState::BUSY),
            TaskReturn::ReadyToSleep => Some(TaskState::READY_TO_SLEEP),
            TaskReturn::Ignore => None,
        }
    }
}

/// State of a task's power handle, as reported by the power manager
/// collaborator (`PowerManager::check`).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PowerState {
    /// Power is off and has not been requested.
    Inactive,
    /// Power has been requested and is being brought up.
    Activating,
    /// Power is up; the task may be delivered messages.
    Active,
    /// Power is being torn down; no delivery may occur until it completes.
    Deactivating,
    /// Activation has failed repeatedly and the power manager has given up.
    GiveUp,
}

/// Notification sent to a task's freezer callback when its lifecycle
/// changes out from under it (pause/resume/suspend/restart).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FreezerEvent {
    Suspend,
    Resume,
    Pause,
    Restart,
}

/// Error kinds surfaced by the kernel.
///
/// ISR-path errors (`NoMailbox`, `MisuseInInterrupt`, ...) are always
/// absorbed by the caller (logged, then dropped); scheduler-path errors are
/// recovered locally. See the crate-level docs in `kern` for propagation
/// rules.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Error {
    OutOfMemory,
    NoMailbox,
    MisuseInInterrupt,
    MisuseMailboxTimer,
    MisuseMailboxWithSrc,
    DuplicatePeer,
    DuplicateTask,
    ReservedName,
    UnknownTarget,
    TunnelDisabled,
    PowerFailure,
    PowerGiveUp,
    MalformedEnvelope,
    SizeMismatch,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Error::OutOfMemory => "out of memory",
            Error::NoMailbox => "no mailbox slot large enough",
            Error::MisuseInInterrupt => "heap message creator called from interrupt context",
            Error::MisuseMailboxTimer => "timer attached to a mailbox-sourced message",
            Error::MisuseMailboxWithSrc => "mailbox-sourced message given a src_task",
            Error::DuplicatePeer => "peer core already registered",
            Error::DuplicateTask => "task already registered",
            Error::ReservedName => "reserved name",
            Error::UnknownTarget => "unknown target task",
            Error::TunnelDisabled => "tunnel is passive and not enabled",
            Error::PowerFailure => "power activation failed",
            Error::PowerGiveUp => "power manager gave up activating",
            Error::MalformedEnvelope => "malformed envelope",
            Error::SizeMismatch => "size mismatch",
        };
        f.write_str(s)
    }
}
