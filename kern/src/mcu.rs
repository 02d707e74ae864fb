//! MCU/peer registry and message router (component E).
//!
//! Every other core this node knows about -- including itself -- is a
//! [`Mcu`] record: a name, a route (a single outbound tunnel for a peer, or
//! the set of local tunnels a local record broadcasts topology on), a hop
//! count, and the set of tasks that live there. Peer records with a shorter
//! hop count than a currently-known route for the same core replace it, so
//! topology updates naturally converge on the shortest path to each core.

use alloc::boxed::Box;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use crate::envelope::{self, CoreEntry, Envelope};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum McuEvent {
    /// A post targeted a known core whose route is currently unusable (no
    /// tunnel, or a passive tunnel that isn't enabled); the caller drops the
    /// message.
    RouteUnavailable { tunnel_id: Option<u16> },
    /// Topology changed enough to warrant re-announcing it.
    TopologyChanged,
    /// A cache snapshot restored peer/task records onto an empty registry.
    RestoredFromCache { peer_count: u16 },
}

ringbuf::ringbuf!(McuEvent, 32, McuEvent::RouteUnavailable { tunnel_id: None });

/// The collaborator a [`McuRegistry`] sends bytes through. Implementors wrap
/// whatever physical link (UART, radio, pipe) carries envelopes to a peer.
pub trait Tunnel {
    /// Sends `bytes` out this tunnel, returning how many were accepted.
    fn send(&mut self, bytes: &[u8]) -> usize;

    /// Passive tunnels (e.g. a request/response transport) only send while
    /// [`Tunnel::enabled`] says the far end is ready to receive.
    fn passive(&self) -> bool {
        false
    }

    fn enabled(&self) -> bool {
        true
    }
}

/// A handle into a [`McuRegistry`]'s tunnel slab. Stable for the tunnel's
/// lifetime.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TunnelId(usize);

struct ExternalTask {
    name: String,
    /// True if this task entry came from a peer's topology broadcast that
    /// we haven't independently confirmed -- i.e. recovered from a backup,
    /// not seen live. Cached tasks are dropped the next time that core's
    /// topology updates, unless reconfirmed.
    cached: bool,
}

enum Route {
    /// The local core: broadcasts topology on every one of these tunnels.
    Local(Vec<TunnelId>),
    /// A remote core: exactly one outbound tunnel, the shortest known route.
    Peer(TunnelId),
}

struct Mcu {
    core_name: String,
    route: Route,
    hop_count: u32,
    supports_json_extra: bool,
    mmap_req_sent: bool,
    task_modified: bool,
    tasks: Vec<ExternalTask>,
}

impl Mcu {
    fn is_local(&self) -> bool {
        matches!(self.route, Route::Local(_))
    }

    fn find_task(&self, name: &str) -> Option<usize> {
        self.tasks.iter().position(|t| t.name == name)
    }
}

/// The registry of known cores (MCUs) and the tunnels that reach them.
#[derive(Default)]
pub struct McuRegistry {
    tunnels: Vec<Box<dyn Tunnel>>,
    mcus: Vec<Mcu>,
}

impl McuRegistry {
    pub fn new() -> Self {
        McuRegistry { tunnels: Vec::new(), mcus: Vec::new() }
    }

    pub fn register_tunnel(&mut self, tunnel: Box<dyn Tunnel>) -> TunnelId {
        self.tunnels.push(tunnel);
        TunnelId(self.tunnels.len() - 1)
    }

    pub fn tunnel_mut(&mut self, id: TunnelId) -> &mut dyn Tunnel {
        &mut *self.tunnels[id.0]
    }

    /// Registers this node's own core, broadcasting topology over every
    /// tunnel in `tunnels`. There is at most one local record; calling this
    /// twice is a bug in the integrator, not something the router tries to
    /// recover from.
    pub fn create_local(&mut self, core_name: &str, tunnels: &[TunnelId]) {
        debug_assert!(self.local().is_none(), "local core already registered");
        self.mcus.push(Mcu {
            core_name: core_name.to_string(),
            route: Route::Local(tunnels.to_vec()),
            hop_count: 0,
            supports_json_extra: true,
            mmap_req_sent: false,
            task_modified: false,
            tasks: Vec::new(),
        });
    }

    pub fn local(&self) -> Option<&Mcu> {
        self.mcus.iter().find(|m| m.is_local())
    }

    pub fn local_core_name(&self) -> Option<&str> {
        self.local().map(|m| m.core_name.as_str())
    }

    pub fn find(&self, core_name: &str) -> Option<&Mcu> {
        self.mcus.iter().find(|m| m.core_name == core_name)
    }

    fn find_index(&self, core_name: &str) -> Option<usize> {
        self.mcus.iter().position(|m| m.core_name == core_name)
    }

    /// Registers or updates a peer learned from a topology broadcast.
    ///
    /// If the core is new, creates it. If it is already known and `hop_count`
    /// is strictly shorter than the one on file, re-routes it through
    /// `tunnel` -- this is how the network converges on shortest paths as
    /// topology broadcasts ripple outward. Returns `true` if anything
    /// changed (new core or re-routed), which the caller uses to decide
    /// whether to re-broadcast its own topology.
    pub fn learn_peer(
        &mut self,
        core_name: &str,
        tunnel: TunnelId,
        hop_count: u32,
    ) -> bool {
        match self.find_index(core_name) {
            None => {
                self.mcus.push(Mcu {
                    core_name: core_name.to_string(),
                    route: Route::Peer(tunnel),
                    hop_count,
                    supports_json_extra: false,
                    mmap_req_sent: false,
                    task_modified: true,
                    tasks: Vec::new(),
                });
                true
            }
            Some(i) => {
                let mcu = &mut self.mcus[i];
                if hop_count < mcu.hop_count {
                    mcu.route = Route::Peer(tunnel);
                    mcu.hop_count = hop_count;
                    mcu.task_modified = true;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn set_supports_json_extra(&mut self, core_name: &str, supports: bool) {
        if let Some(mcu) = self.mcus.iter_mut().find(|m| m.core_name == core_name) {
            mcu.supports_json_extra = supports;
        }
    }

    pub fn all_peers_support_json_extra(&self) -> bool {
        self.mcus.iter().filter(|m| !m.is_local()).all(|m| m.supports_json_extra)
    }

    /// Finds which known core hosts `task_name`, local core included.
    pub fn find_task_owner(&self, task_name: &str) -> Option<&str> {
        self.mcus
            .iter()
            .find(|m| m.find_task(task_name).is_some())
            .map(|m| m.core_name.as_str())
    }

    pub fn is_task_owner_local(&self, task_name: &str) -> bool {
        self.local().map_or(false, |m| m.find_task(task_name).is_some())
    }

    /// Registers a task that lives on the local core, marking the local
    /// record modified so the next topology broadcast includes it.
    pub fn add_local_task(&mut self, task_name: &str) {
        if let Some(i) = self.mcus.iter().position(Mcu::is_local) {
            let mcu = &mut self.mcus[i];
            if mcu.find_task(task_name).is_none() {
                mcu.tasks.push(ExternalTask { name: task_name.to_string(), cached: false });
                mcu.task_modified = true;
            }
        }
    }

    /// Records a task as living on `core_name`, as reported by a topology
    /// broadcast. Returns `true` if this is new information.
    pub fn add_task_to(&mut self, core_name: &str, task_name: &str, cached: bool) -> bool {
        let Some(i) = self.find_index(core_name) else { return false };
        let mcu = &mut self.mcus[i];
        match mcu.find_task(task_name) {
            Some(idx) => {
                if !cached {
                    mcu.tasks[idx].cached = false;
                }
                false
            }
            None => {
                mcu.tasks.push(ExternalTask { name: task_name.to_string(), cached });
                mcu.task_modified = true;
                true
            }
        }
    }

    /// Drops every still-cached (unconfirmed) task on `core_name`. Called
    /// after a fresh topology broadcast has had a chance to reconfirm tasks.
    pub fn clear_cached_tasks(&mut self, core_name: &str) {
        if let Some(i) = self.find_index(core_name) {
            let mcu = &mut self.mcus[i];
            let before = mcu.tasks.len();
            mcu.tasks.retain(|t| !t.cached);
            if mcu.tasks.len() != before {
                mcu.task_modified = true;
            }
        }
    }

    pub fn mmap_req_sent(&self, core_name: &str) -> bool {
        self.find(core_name).map_or(false, |m| m.mmap_req_sent)
    }

    pub fn set_mmap_req_sent(&mut self, core_name: &str, sent: bool) {
        if let Some(i) = self.find_index(core_name) {
            self.mcus[i].mmap_req_sent = sent;
        }
    }

    pub fn reset_all_mmap_req_sent(&mut self) {
        for m in &mut self.mcus {
            m.mmap_req_sent = false;
        }
    }

    /// Sends `bytes` to `dst_core`'s tunnel, unless that is `avoid` (loop
    /// avoidance: never bounce a message back out the tunnel it arrived on)
    /// or the tunnel is a passive one that isn't currently enabled.
    pub fn router_raw(&mut self, dst_core: &str, bytes: &[u8], avoid: Option<TunnelId>) -> bool {
        let Some(mcu) = self.find(dst_core) else {
            ringbuf::ringbuf_entry!(McuEvent::RouteUnavailable { tunnel_id: None });
            return false;
        };
        let tunnel_id = match &mcu.route {
            Route::Peer(id) => *id,
            Route::Local(_) => {
                ringbuf::ringbuf_entry!(McuEvent::RouteUnavailable { tunnel_id: None });
                return false;
            }
        };
        if Some(tunnel_id) == avoid {
            return false;
        }
        let tunnel = &self.tunnels[tunnel_id.0];
        if tunnel.passive() && !tunnel.enabled() {
            ringbuf::ringbuf_entry!(McuEvent::RouteUnavailable {
                tunnel_id: Some(tunnel_id.0 as u16)
            });
            return false;
        }
        self.tunnels[tunnel_id.0].send(bytes);
        true
    }

    /// Builds the topology broadcast this node should send: every known
    /// core except ones still carrying an unconfirmed cached task, with hop
    /// counts incremented by one (since the next hop will be one further
    /// from the origin than we are).
    pub fn build_topology_entries(&self) -> Vec<CoreEntry> {
        self.mcus
            .iter()
            .filter(|m| !m.is_local())
            .filter(|m| m.tasks.iter().all(|t| !t.cached))
            .map(|m| CoreEntry {
                name: m.core_name.clone(),
                jump: m.hop_count + 1,
                supports_json_extra: m.supports_json_extra,
                tasks: m.tasks.iter().map(|t| t.name.clone()).collect(),
            })
            .collect()
    }

    pub fn local_tunnels(&self) -> Vec<TunnelId> {
        match self.local().map(|m| &m.route) {
            Some(Route::Local(tunnels)) => tunnels.clone(),
            _ => Vec::new(),
        }
    }

    /// Broadcasts this node's topology view on every local tunnel.
    pub fn broadcast_topology(&mut self) {
        let Some(local_name) = self.local_core_name().map(str::to_string) else { return };
        let entries = self.build_topology_entries();
        let encoded = envelope::encode_cores(&local_name, &entries);
        for id in self.local_tunnels() {
            let tunnel = &mut self.tunnels[id.0];
            if tunnel.passive() && !tunnel.enabled() {
                continue;
            }
            tunnel.send(&encoded.to_wire());
        }
    }

    /// Applies a decoded `Cores` envelope arriving on `via`: learns new
    /// peers, re-routes shorter ones, and records their task lists. Returns
    /// `true` if anything changed enough to warrant re-broadcasting our own
    /// topology.
    pub fn apply_topology(&mut self, entries: &[CoreEntry], via: TunnelId) -> bool {
        let mut changed = false;
        for entry in entries {
            if Some(entry.name.as_str()) == self.local_core_name() {
                continue;
            }
            changed |= self.learn_peer(&entry.name, via, entry.jump);
            self.set_supports_json_extra(&entry.name, entry.supports_json_extra);
            for task in &entry.tasks {
                changed |= self.add_task_to(&entry.name, task, false);
            }
            self.clear_cached_tasks(&entry.name);
        }
        if changed {
            ringbuf::ringbuf_entry!(McuEvent::TopologyChanged);
        }
        changed
    }

    /// Serializes the non-local task lists as a `Cores` envelope, for
    /// persisting across a restart. Mirrors [`McuRegistry::restore_from_cache`].
    pub fn backup_to_cache(&self) -> Option<String> {
        if !self.mcus.iter().any(|m| !m.is_local() && m.task_modified) {
            return None;
        }
        let entries = self.build_topology_entries();
        let local_name = self.local_core_name().unwrap_or_default();
        Some(envelope::encode_cores(local_name, &entries).text)
    }

    /// Restores peer/task records from a previous [`McuRegistry::backup_to_cache`]
    /// snapshot. Every recovered task is marked `cached`, so it gets dropped
    /// automatically the first time that core's topology broadcast arrives
    /// without it.
    pub fn restore_from_cache(&mut self, text: &str, via: TunnelId) -> bool {
        let Ok(Envelope::Cores(entries)) = envelope::decode(text, &[]) else { return false };
        let mut restored = 0u16;
        for entry in entries {
            if self.find(&entry.name).is_some() {
                continue;
            }
            self.learn_peer(&entry.name, via, entry.jump);
            self.set_supports_json_extra(&entry.name, entry.supports_json_extra);
            for task in entry.tasks {
                self.add_task_to(&entry.name, &task, true);
            }
            restored += 1;
        }
        if restored > 0 {
            ringbuf::ringbuf_entry!(McuEvent::RestoredFromCache { peer_count: restored });
        }
        restored > 0
    }
}
