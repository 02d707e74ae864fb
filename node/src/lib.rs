// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! High-level node-assembly interface.
//!
//! This is intended to provide a more ergonomic interface than driving
//! [`kern::sched::Kernel`] directly: [`NodeBuilder`] collects tasks,
//! tunnels, and mmap regions up front, then [`NodeBuilder::build`] wires
//! them into a running [`Node`] -- registering the local core, broadcasting
//! initial topology, and arming the unsynced-mmap retry timer, so the
//! integrator never has to remember that ordering themselves.

#![cfg_attr(not(test), no_std)]
extern crate alloc;

use alloc::boxed::Box;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use abi::{Priority, TaskReturn};

use kern::err::KernResult;
use kern::mailbox::MailboxHandle;
use kern::mcu::{Tunnel, TunnelId};
use kern::message::Message;
use kern::power::{AlwaysOn, PowerManager};
use kern::sched::Kernel;
use kern::task::{PowerHandle, Task};
use kern::time::Timestamp;

/// Default delay before the node requests a sync for any mmap `from` region
/// that hasn't heard from its source yet.
const DEFAULT_MMAP_UNSYNC_RETRY_MS: i32 = 2_000;

/// Collects a node's tasks, tunnels, and mmap regions, then assembles a
/// running [`Node`] from them in the order the kernel expects: local core
/// registration before the first topology broadcast, tunnels registered
/// before either.
pub struct NodeBuilder<P: PowerManager = AlwaysOn> {
    kernel: Kernel<P>,
    core_name: String,
    local_tunnels: Vec<TunnelId>,
}

impl NodeBuilder<AlwaysOn> {
    /// Starts a builder with no power domains of its own -- every task runs
    /// unconditionally, as if always powered.
    pub fn new(core_name: &str) -> Self {
        NodeBuilder::with_power_manager(core_name, AlwaysOn)
    }
}

impl<P: PowerManager> NodeBuilder<P> {
    pub fn with_power_manager(core_name: &str, power: P) -> Self {
        NodeBuilder {
            kernel: Kernel::new(power),
            core_name: core_name.to_string(),
            local_tunnels: Vec::new(),
        }
    }

    /// Registers a tunnel to a peer core, returning the handle other calls
    /// (like [`NodeBuilder::mmap_to`]) need to name it, while also adding it
    /// to this node's set of broadcast tunnels.
    pub fn tunnel(&mut self, tunnel: Box<dyn Tunnel>) -> TunnelId {
        let id = self.kernel.mcus_mut().register_tunnel(tunnel);
        self.local_tunnels.push(id);
        id
    }

    /// Registers a task, without a power handle.
    pub fn task(
        &mut self,
        name: &str,
        priority: Priority,
        callback: impl FnMut(&str, &Message) -> TaskReturn + 'static,
    ) -> KernResult<&mut Self> {
        self.kernel.add_task(Task::new(name, priority, callback))?;
        Ok(self)
    }

    /// Registers a task gated behind a power domain: the scheduler will not
    /// deliver to it until `power_handle`'s domain reports active.
    pub fn powered_task(
        &mut self,
        name: &str,
        priority: Priority,
        power_handle: PowerHandle,
        callback: impl FnMut(&str, &Message) -> TaskReturn + 'static,
    ) -> KernResult<&mut Self> {
        let task = Task::new(name, priority, callback).with_power_handle(power_handle);
        self.kernel.add_task(task)?;
        Ok(self)
    }

    pub fn mailbox_group(&mut self, slot_capacity: usize, slot_count: usize) -> KernResult<&mut Self> {
        self.kernel.mailbox_create_group(slot_capacity, slot_count)?;
        Ok(self)
    }

    pub fn mmap_from(&mut self, from_core: &str, name: &str, initial: &[u8]) -> KernResult<&mut Self> {
        self.kernel.mmap_mut().mmap_from(from_core, name, initial)?;
        Ok(self)
    }

    pub fn mmap_to(&mut self, to_core: &str, name: &str, data: &[u8]) -> KernResult<&mut Self> {
        self.kernel.mmap_mut().mmap_to(to_core, name, data)?;
        Ok(self)
    }

    /// Registers the local core under every tunnel added so far, broadcasts
    /// this node's (currently empty) topology, and arms the mmap
    /// unsynced-retry timer, producing a [`Node`] ready for
    /// [`Node::schedule`].
    pub fn build(mut self) -> Node<P> {
        self.kernel.mcus_mut().create_local(&self.core_name, &self.local_tunnels);
        self.kernel.mcus_mut().broadcast_topology();
        self.kernel.mmap_mut().arm_unsync_check(DEFAULT_MMAP_UNSYNC_RETRY_MS);
        Node { kernel: self.kernel }
    }
}

/// A running node: the assembled [`Kernel`] plus the ergonomic entry points
/// a platform's main loop actually calls.
pub struct Node<P: PowerManager> {
    kernel: Kernel<P>,
}

impl<P: PowerManager> Node<P> {
    /// Posts a message to a task, local or on a peer core. See
    /// [`Kernel::post`].
    pub fn post(
        &mut self,
        target: &str,
        msg: Message,
        src_task: Option<&str>,
        now: Timestamp,
    ) -> KernResult<()> {
        self.kernel.post(target, msg, src_task, now)
    }

    /// ISR-safe: constructs and assigns a mailbox message in one call. Most
    /// interrupt handlers don't need the handle back; use
    /// [`Node::mailbox_new_from_isr`] if yours does (e.g. to post a second
    /// notification into the same slot later).
    pub fn notify_from_isr(
        &mut self,
        target: &str,
        notification: &str,
        payload: &[u8],
        now: Timestamp,
    ) -> KernResult<()> {
        let handle = self.kernel.mailbox_new_from_isr(notification, payload, now)?;
        self.kernel.mailbox_post(handle, target);
        Ok(())
    }

    pub fn mailbox_new_from_isr(
        &mut self,
        notification: &str,
        payload: &[u8],
        now: Timestamp,
    ) -> KernResult<MailboxHandle> {
        self.kernel.mailbox_new_from_isr(notification, payload, now)
    }

    pub fn mailbox_post(&mut self, handle: MailboxHandle, target: &str) {
        self.kernel.mailbox_post(handle, target);
    }

    /// Writes new local data into an owned mmap region; the next
    /// [`Node::schedule`] pass diffs and pushes it to peers.
    pub fn mmap_write(&mut self, name: &str, data: &[u8]) -> KernResult<()> {
        self.kernel.mmap_mut().write_to_region(name, data)
    }

    /// Reads the current mirrored value of a `from` region.
    pub fn mmap_read(&self, name: &str) -> Option<&[u8]> {
        self.kernel.mmap().region_from(name)
    }

    /// Installs a callback fired whenever `name`'s mirrored bytes actually
    /// change (not on every inbound sync, only on a real diff).
    pub fn on_mmap_update(&mut self, name: &str, callback: impl FnMut(&[u8]) + 'static) {
        self.kernel.mmap_mut().set_update_callback(name, callback);
    }

    /// Hands bytes that arrived on `tunnel` to the kernel for unpacking:
    /// delivers or forwards a message, learns topology, or applies/answers
    /// an mmap update. Call this from the tunnel driver whenever a new
    /// frame (text, NUL, optional appendix) has been fully received.
    pub fn on_tunnel_bytes(&mut self, tunnel: TunnelId, bytes: &[u8], now: Timestamp) -> KernResult<()> {
        self.kernel.on_tunnel_bytes(tunnel, bytes, now)
    }

    /// Runs one scheduler pass. Call this from the main loop on every
    /// wakeup, with `now` from whatever tick source this platform has --
    /// the kernel never reads a clock itself.
    pub fn schedule(&mut self, now: Timestamp) {
        self.kernel.schedule(now);
    }

    /// How long the main loop can sleep before it needs to call
    /// [`Node::schedule`] again. See [`Kernel::idle_time_ms`].
    pub fn idle_time_ms(&self) -> Option<u32> {
        self.kernel.idle_time_ms()
    }

    pub fn kernel_mut(&mut self) -> &mut Kernel<P> {
        &mut self.kernel
    }
}
