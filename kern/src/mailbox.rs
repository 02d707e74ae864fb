//! Mailbox pool: pre-allocated, ISR-safe message slots (component B).
//!
//! Slots are allocated once, at group-creation time, with enough reserved
//! capacity to hold their largest payload. The ISR-safe producer path
//! ([`MailboxPool::new_msg_from_isr`]) only ever `clear()`s and
//! `extend_from_slice()`s within that reserved capacity, so it never calls
//! back into the allocator -- the property that makes it safe to call from
//! interrupt context in the first place.

use alloc::string::String;
use alloc::vec::Vec;

use abi::Error;

use crate::message::{MailboxDescriptor, Message, MessageSource};
use crate::task::{TaskList, TaskName};
use crate::time::Timestamp;

const NOTIFICATION_RESERVE: usize = 16;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum MailboxEvent {
    PoolSnapshot { group: u16, capacity: u16, occupied_slots: u16 },
}

ringbuf::ringbuf!(MailboxEvent, 16, MailboxEvent::PoolSnapshot { group: 0, capacity: 0, occupied_slots: 0 });

/// A handle to a single mailbox slot. Stable for the slot's lifetime; slots
/// are never moved between groups or compacted away.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MailboxHandle {
    group: usize,
    slot: usize,
}

struct MailboxGroup {
    slot_capacity: usize,
    slots: Vec<Message>,
    any_unread: bool,
}

impl MailboxGroup {
    fn new(slot_capacity: usize, slot_count: usize) -> Self {
        let slots = (0..slot_count)
            .map(|_| Message {
                notification: String::with_capacity(NOTIFICATION_RESERVE),
                payload: Vec::with_capacity(slot_capacity),
                src_task: None,
                time_stamp: Timestamp::ZERO,
                source: MessageSource::Mailbox(MailboxDescriptor::default()),
            })
            .collect();
        MailboxGroup { slot_capacity, slots, any_unread: false }
    }

    fn mailbox_desc(slot: &Message) -> &MailboxDescriptor {
        match &slot.source {
            MessageSource::Mailbox(d) => d,
            MessageSource::Timer(_) => unreachable!("pool slot lost its mailbox tag"),
        }
    }

    fn mailbox_desc_mut(slot: &mut Message) -> &mut MailboxDescriptor {
        match &mut slot.source {
            MessageSource::Mailbox(d) => d,
            MessageSource::Timer(_) => unreachable!("pool slot lost its mailbox tag"),
        }
    }

    /// Any slot currently readable by a task, i.e. occupied with a handler
    /// assigned.
    fn has_unread(&self) -> bool {
        self.slots.iter().any(|s| {
            let d = Self::mailbox_desc(s);
            d.occupied && d.owning_task.is_some()
        })
    }
}

/// The ordered collection of mailbox groups, keyed by ascending slot
/// capacity.
#[derive(Default)]
pub struct MailboxPool {
    groups: Vec<MailboxGroup>,
}

impl MailboxPool {
    pub fn new() -> Self {
        MailboxPool { groups: Vec::new() }
    }

    /// Creates a new group of `slot_count` slots, each able to hold payloads
    /// smaller than `slot_capacity`. Rejects a zero capacity or a zero
    /// count; keeps the group list sorted by ascending capacity (capacities
    /// may repeat -- a new group with an existing capacity is inserted
    /// after the existing ones, so groups created earlier are tried first).
    pub fn create_group(
        &mut self,
        slot_capacity: usize,
        slot_count: usize,
    ) -> Result<(), Error> {
        if slot_capacity == 0 || slot_count == 0 {
            return Err(Error::SizeMismatch);
        }
        let pos = self.groups.partition_point(|g| g.slot_capacity <= slot_capacity);
        self.groups.insert(pos, MailboxGroup::new(slot_capacity, slot_count));
        Ok(())
    }

    /// Constructs a message from interrupt context: finds the smallest group
    /// whose slot capacity exceeds `payload`'s length, claims a free slot in
    /// it with the two-step token/occupied protocol, and fills it in.
    ///
    /// Runs the claim under a `critical-section` region so concurrent ISR
    /// producers (and the scheduler's drain phase) can't interleave.
    pub fn new_msg_from_isr(
        &mut self,
        notification: &str,
        payload: &[u8],
        now: Timestamp,
    ) -> Result<MailboxHandle, Error> {
        let result = critical_section::with(|_cs| {
            for (gi, group) in self.groups.iter_mut().enumerate() {
                if group.slot_capacity <= payload.len() {
                    continue;
                }
                for (si, slot) in group.slots.iter_mut().enumerate() {
                    let claimed = {
                        let d = MailboxGroup::mailbox_desc_mut(slot);
                        if d.occupied || d.token {
                            false
                        } else {
                            // Two-step claim: set token, re-check occupied,
                            // then take occupied. This is what makes
                            // concurrent ISR producers race-free without a
                            // sleeping lock underneath the critical section.
                            d.token = true;
                            if d.occupied {
                                d.token = false;
                                false
                            } else {
                                d.occupied = true;
                                true
                            }
                        }
                    };
                    if !claimed {
                        continue;
                    }
                    slot.notification.clear();
                    slot.notification.push_str(notification);
                    slot.payload.clear();
                    slot.payload.extend_from_slice(payload);
                    slot.time_stamp = now;
                    slot.src_task = None;
                    group.any_unread = true;
                    return Ok(MailboxHandle { group: gi, slot: si });
                }
            }
            Err(Error::NoMailbox)
        });
        if result.is_err() {
            self.ringbuf_dump();
        }
        result
    }

    fn slot(&self, handle: MailboxHandle) -> &Message {
        &self.groups[handle.group].slots[handle.slot]
    }

    fn slot_mut(&mut self, handle: MailboxHandle) -> &mut Message {
        &mut self.groups[handle.group].slots[handle.slot]
    }

    pub fn message(&self, handle: MailboxHandle) -> &Message {
        self.slot(handle)
    }

    /// Posts a mailbox-sourced message to `target`: stamps the owning task
    /// on the slot and marks the task pending. Mailbox messages never carry
    /// a `src_task`; the caller is responsible for enforcing that before
    /// calling this (see `sched::post`).
    pub fn post(&mut self, handle: MailboxHandle, target: TaskName) {
        critical_section::with(|_cs| {
            let slot = self.slot_mut(handle);
            let d = MailboxGroup::mailbox_desc_mut(slot);
            d.owning_task = Some(target);
        });
    }

    /// Drains every group with unread mail into its owning tasks' queues.
    ///
    /// `any_unread` is cleared *before* the walk, so an ISR arrival mid-walk
    /// re-sets it and gets picked up on the next pass rather than being
    /// silently missed.
    pub fn drain(&mut self, tasks: &mut TaskList) {
        critical_section::with(|_cs| {
            for group in &mut self.groups {
                if !group.any_unread {
                    continue;
                }
                group.any_unread = false;
                for slot in &mut group.slots {
                    let d = MailboxGroup::mailbox_desc(slot);
                    if !d.occupied {
                        continue;
                    }
                    match &d.owning_task {
                        None => {
                            // Claimed by an ISR but not posted yet: retry
                            // next pass.
                            group.any_unread = true;
                        }
                        Some(owner) => {
                            if let Some(task) = tasks.find_mut(owner) {
                                let delivered = slot.duplicate_for_delivery();
                                task.msg_queue_mut().push_back(delivered);
                                *task.state_mut() |= abi::TaskState::MSG_PENDING;
                            }
                            // Release the slot back to the pool.
                            let d = MailboxGroup::mailbox_desc_mut(slot);
                            d.owning_task = None;
                            d.token = false;
                            d.occupied = false;
                            slot.notification.clear();
                            slot.payload.clear();
                            slot.src_task = None;
                        }
                    }
                }
            }
        });
    }

    /// True if any group currently has unread mail. Feeds `idle_time`.
    pub fn any_unread(&self) -> bool {
        self.groups.iter().any(MailboxGroup::has_unread)
    }

    /// Logs one ringbuf entry per group with its occupied-slot count, for
    /// post-mortem inspection of pool pressure (e.g. right after a
    /// `NoMailbox` failure). Mirrors `show_mailbox()` in the original pool
    /// implementation, minus the per-slot notification text -- that lives
    /// on the slot itself and isn't worth a ringbuf entry per occupant.
    pub fn ringbuf_dump(&self) {
        for (gi, group) in self.groups.iter().enumerate() {
            let occupied = group
                .slots
                .iter()
                .filter(|s| MailboxGroup::mailbox_desc(s).occupied)
                .count();
            ringbuf::ringbuf_entry!(MailboxEvent::PoolSnapshot {
                group: gi as u16,
                capacity: group.slot_capacity as u16,
                occupied_slots: occupied as u16,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;
    use abi::{Priority, TaskReturn};

    #[test]
    fn rejects_zero_capacity_or_zero_count() {
        let mut pool = MailboxPool::new();
        assert_eq!(pool.create_group(0, 4).unwrap_err(), Error::SizeMismatch);
        assert_eq!(pool.create_group(8, 0).unwrap_err(), Error::SizeMismatch);
    }

    #[test]
    fn groups_stay_sorted_by_ascending_capacity() {
        let mut pool = MailboxPool::new();
        pool.create_group(64, 2).unwrap();
        pool.create_group(8, 4).unwrap();
        let caps: alloc::vec::Vec<_> = pool.groups.iter().map(|g| g.slot_capacity).collect();
        assert_eq!(caps, [8, 64]);
    }

    #[test]
    fn isr_message_goes_to_smallest_fitting_group() {
        let mut pool = MailboxPool::new();
        pool.create_group(8, 4).unwrap();
        pool.create_group(64, 2).unwrap();
        let now = Timestamp::ZERO;
        let h = pool.new_msg_from_isr("evt", &[0u8; 10], now).unwrap();
        assert_eq!(h.group, 1); // the 64-byte group, since 10 >= 8
    }

    #[test]
    fn exhausted_group_returns_no_mailbox() {
        let mut pool = MailboxPool::new();
        pool.create_group(64, 2).unwrap();
        let now = Timestamp::ZERO;
        pool.new_msg_from_isr("a", &[1, 2, 3], now).unwrap();
        pool.new_msg_from_isr("b", &[1, 2, 3], now).unwrap();
        let err = pool.new_msg_from_isr("c", &[1, 2, 3], now).unwrap_err();
        assert_eq!(err, Error::NoMailbox);
        // The failed claim above should have logged a pool snapshot;
        // calling it again directly must not panic either.
        pool.ringbuf_dump();
    }

    #[test]
    fn payload_at_least_as_large_as_every_group_is_rejected() {
        let mut pool = MailboxPool::new();
        pool.create_group(8, 4).unwrap();
        pool.create_group(64, 2).unwrap();
        let err = pool
            .new_msg_from_isr("big", &[0u8; 64], Timestamp::ZERO)
            .unwrap_err();
        assert_eq!(err, Error::NoMailbox);
    }

    #[test]
    fn drain_copies_into_owning_tasks_queue_and_releases_slot() {
        let mut pool = MailboxPool::new();
        pool.create_group(64, 2).unwrap();
        let mut tasks = TaskList::new();
        tasks
            .insert(Task::new("b", Priority(1), |_, _| TaskReturn::Idle))
            .unwrap();
        let target = tasks.find(&TaskName::new("b")).unwrap().name().clone();

        let h = pool.new_msg_from_isr("ping", b"hi", Timestamp::ZERO).unwrap();
        pool.post(h, target);
        pool.drain(&mut tasks);

        let b = tasks.find(&TaskName::new("b")).unwrap();
        assert_eq!(b.msg_queue().len(), 1);
        assert_eq!(b.msg_queue()[0].notification, "ping");
        assert!(b.state().contains(abi::TaskState::MSG_PENDING));
        assert!(!pool.any_unread());

        // the slot should be free again for reuse
        let h2 = pool.new_msg_from_isr("again", b"x", Timestamp::ZERO).unwrap();
        assert_eq!(h2, h);
    }
}
