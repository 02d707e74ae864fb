//! Messages: the unit of communication between tasks (component A).
//!
//! A [`Message`] is immutable after it is posted, save for the scheduler
//! advancing its timer. Its discriminated [`MessageSource`] carries exactly
//! one of a timer descriptor or a mailbox descriptor -- never both, and the
//! type system makes the "never both" invariant unrepresentable to violate
//! rather than something we have to check at runtime.

use alloc::string::String;
use alloc::vec::Vec;

use abi::Error;

use crate::task::TaskName;
use crate::time::Timestamp;

/// Timer attached to a message. `enabled = false` is the default state of a
/// freshly constructed message: "no timer", not "disabled timer".
///
/// `remaining_count < 0` means infinite, `== 0` means one more (the current)
/// firing and then disable, `> 0` means that many *additional* firings after
/// this one.
///
/// `due_in_ms` is the live countdown the scheduler decrements every pass; it
/// starts at `delay_ms` and is reloaded to `period_ms` after each firing.
/// `delay_ms`/`period_ms` stay fixed so the countdown can always be
/// reloaded correctly.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct TimerState {
    pub enabled: bool,
    pub delay_ms: u32,
    pub period_ms: u32,
    pub remaining_count: i32,
    pub due_in_ms: i32,
}

/// Mailbox bookkeeping for a message that lives in a mailbox pool slot.
///
/// `owning_task` is the target of an ISR-produced message, set by
/// [`crate::mailbox`]'s post path and consumed by the scheduler's drain
/// phase.
#[derive(Clone, Debug, Default)]
pub struct MailboxDescriptor {
    pub occupied: bool,
    pub token: bool,
    pub owning_task: Option<TaskName>,
}

/// The two mutually exclusive shapes a message can take.
#[derive(Clone, Debug)]
pub enum MessageSource {
    Timer(TimerState),
    Mailbox(MailboxDescriptor),
}

impl Default for MessageSource {
    fn default() -> Self {
        MessageSource::Timer(TimerState::default())
    }
}

/// A notification, with or without a payload, possibly timed.
#[derive(Clone, Debug)]
pub struct Message {
    pub notification: String,
    pub payload: Vec<u8>,
    pub src_task: Option<String>,
    pub time_stamp: Timestamp,
    pub source: MessageSource,
}

impl Message {
    /// Constructs a message as task context does: heap-owned, no timer, no
    /// mailbox. `in_interrupt` stands in for the platform's hardware
    /// interrupt indicator; passing `true` here is a misuse and is reported
    /// rather than silently tolerated, since the heap allocator must never
    /// be called from an ISR.
    pub fn new(
        notification: &str,
        payload: &[u8],
        now: Timestamp,
        in_interrupt: bool,
    ) -> Result<Self, Error> {
        if in_interrupt {
            return Err(Error::MisuseInInterrupt);
        }
        Ok(Message {
            notification: String::from(notification),
            payload: Vec::from(payload),
            src_task: None,
            time_stamp: now,
            source: MessageSource::default(),
        })
    }

    /// True if this message is mailbox-sourced (lives in a pool slot).
    pub fn is_mailbox_sourced(&self) -> bool {
        matches!(self.source, MessageSource::Mailbox(_))
    }

    /// Attaches a repeat/one-shot timer to this message.
    ///
    /// `count > 0` is decremented once here, so the value the caller
    /// supplies is "total fires including the first" -- `set_timer(.., 1)`
    /// fires exactly once.
    pub fn set_timer(
        &mut self,
        delay_ms: u32,
        period_ms: u32,
        count: i32,
    ) -> Result<(), Error> {
        if self.is_mailbox_sourced() {
            return Err(Error::MisuseMailboxTimer);
        }
        let remaining_count = if count > 0 { count - 1 } else { count };
        self.source = MessageSource::Timer(TimerState {
            enabled: true,
            delay_ms,
            period_ms,
            remaining_count,
            due_in_ms: delay_ms as i32,
        });
        Ok(())
    }

    /// Returns the timer state, if this message is timer-class (whether or
    /// not a timer is actually enabled on it).
    pub fn timer(&self) -> Option<&TimerState> {
        match &self.source {
            MessageSource::Timer(t) => Some(t),
            MessageSource::Mailbox(_) => None,
        }
    }

    pub fn timer_mut(&mut self) -> Option<&mut TimerState> {
        match &mut self.source {
            MessageSource::Timer(t) => Some(t),
            MessageSource::Mailbox(_) => None,
        }
    }

    /// Copies this message's visible contents into a new, timer-free
    /// message. Used both by the mailbox drain (building the task-queue copy
    /// of a mailbox entry) and by periodic timer expiry (duplicating the
    /// recurring message for delivery while the original stays armed).
    pub fn duplicate_for_delivery(&self) -> Message {
        Message {
            notification: self.notification.clone(),
            payload: self.payload.clone(),
            src_task: self.src_task.clone(),
            time_stamp: self.time_stamp,
            source: MessageSource::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_message_has_no_timer_by_default() {
        let m = Message::new("ping", b"hi", Timestamp::ZERO, false).unwrap();
        assert!(!m.timer().unwrap().enabled);
    }

    #[test]
    fn heap_creator_rejects_interrupt_context() {
        let err = Message::new("ping", b"", Timestamp::ZERO, true).unwrap_err();
        assert_eq!(err, Error::MisuseInInterrupt);
    }

    #[test]
    fn set_timer_decrements_finite_count_by_one() {
        let mut m = Message::new("tick", b"", Timestamp::ZERO, false).unwrap();
        m.set_timer(100, 100, 1).unwrap();
        assert_eq!(m.timer().unwrap().remaining_count, 0);
    }

    #[test]
    fn set_timer_rejects_mailbox_sourced_message() {
        let mut m = Message {
            notification: String::from("x"),
            payload: Vec::new(),
            src_task: None,
            time_stamp: Timestamp::ZERO,
            source: MessageSource::Mailbox(MailboxDescriptor::default()),
        };
        assert_eq!(
            m.set_timer(1, 1, 1).unwrap_err(),
            Error::MisuseMailboxTimer
        );
    }

    #[test]
    fn infinite_period_timer_never_decrements() {
        let mut m = Message::new("tick", b"", Timestamp::ZERO, false).unwrap();
        m.set_timer(100, 100, -1).unwrap();
        assert_eq!(m.timer().unwrap().remaining_count, -1);
    }
}
