//! Power manager collaborator interface.
//!
//! The kernel treats power management as an external state machine it
//! drives through four calls: `activate`/`deactivate`/`check`/
//! `check_power_failure`, plus a per-pass `tick` so the manager can run its
//! own timeouts.

use crate::task::PowerHandle;
use abi::PowerState;

/// Collaborator interface the scheduler drives power through.
///
/// Implementors decide what "activating a power handle" actually means on
/// their platform (a regulator enable line, a clock gate, whatever). The
/// scheduler only needs yes/no answers and a notion of "given up".
pub trait PowerManager {
    /// Advances any internal timeouts by `delta_ms`. Called once per
    /// scheduler pass, before anything else.
    fn tick(&mut self, delta_ms: u32);

    /// Requests that `handle`'s power domain come up. Returns `true` if it
    /// is already (or now) active.
    fn activate(&mut self, handle: PowerHandle) -> bool;

    /// Requests that `handle`'s power domain go down.
    fn deactivate(&mut self, handle: PowerHandle);

    /// Current state of `handle`'s power domain.
    fn check(&mut self, handle: PowerHandle) -> PowerState;

    /// True if `handle` has failed to activate enough times that the
    /// scheduler should stop trying and drop its pending message instead.
    fn check_power_failure(&mut self, handle: PowerHandle) -> bool;
}

/// A power manager that considers every handle permanently active. Useful
/// for tasks with no power domain of their own and for tests.
#[derive(Default)]
pub struct AlwaysOn;

impl PowerManager for AlwaysOn {
    fn tick(&mut self, _delta_ms: u32) {}
    fn activate(&mut self, _handle: PowerHandle) -> bool {
        true
    }
    fn deactivate(&mut self, _handle: PowerHandle) {}
    fn check(&mut self, _handle: PowerHandle) -> PowerState {
        PowerState::Active
    }
    fn check_power_failure(&mut self, _handle: PowerHandle) -> bool {
        false
    }
}
