// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cooperative micro-kernel core for multi-MCU embedded nodes.
//!
//! This crate is the application-independent portion of the system: a
//! run-to-completion scheduler, its message/mailbox/timer subsystem, and the
//! cross-node synchronization protocol (task-list discovery and mmap
//! mirroring). It does not know how bytes actually get onto a wire, how
//! power rails get switched, or where the clock comes from -- those are
//! supplied by the integrator through the [`Tunnel`], [`PowerManager`], and
//! [`Clock`] traits.
//!
//! # Design principles
//!
//! 1. No preemption. Every task callback runs to completion before the next
//!    one is considered.
//! 2. No global mutable state. A [`Kernel`] value owns every list the
//!    scheduler touches; nothing here is a `static`.
//! 3. ISR-safe producer paths are isolated to the mailbox pool, and
//!    mutual exclusion against the scheduler's drain phase goes through the
//!    `critical-section` crate rather than a hand-rolled spinlock.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod envelope;
pub mod err;
pub mod mailbox;
pub mod mcu;
pub mod message;
pub mod mmap;
pub mod power;
pub mod sched;
pub mod task;
pub mod time;

pub use err::{KernResult, KernelError};
pub use power::PowerManager;
pub use sched::{Kernel, Tunnel};
pub use time::Clock;
