//! Memory-mirroring engine between peers (component F).
//!
//! A region is either a "from" region (remote -> local: we receive updates
//! and apply them to local memory) or a "to" region (local -> remote: we own
//! the memory and push diffs outward). `"mmap"` and `"mmap_array"` are
//! reserved region names since they collide with the envelope's own framing
//! keys.

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use abi::Error;

use crate::envelope::{self, MmapRegionEntry};
use crate::mcu::{McuRegistry, TunnelId};

const RESERVED_NAMES: [&str; 2] = ["mmap", "mmap_array"];

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum MmapEvent {
    /// An inbound update's payload size didn't match the local region's; the
    /// update is dropped rather than applied half-sized.
    SizeMismatch { local_len: u16, incoming_len: u16 },
}

ringbuf::ringbuf!(MmapEvent, 16, MmapEvent::SizeMismatch { local_len: 0, incoming_len: 0 });

/// A region this node receives updates into, from `from_core`.
struct FromRegion {
    from_core: String,
    name: String,
    data: Vec<u8>,
    update_callback: Option<alloc::boxed::Box<dyn FnMut(&[u8])>>,
    synced: bool,
}

/// A region this node owns and pushes to `to_core`.
struct ToRegion {
    to_core: String,
    name: String,
    data: Vec<u8>,
    last_sent: Vec<u8>,
}

/// The mmap engine: the set of inbound and outbound regions this node
/// participates in.
#[derive(Default)]
pub struct MmapEngine {
    from_regions: Vec<FromRegion>,
    to_regions: Vec<ToRegion>,
    unsync_retry_due_in_ms: Option<i32>,
}

fn check_reserved(name: &str) -> Result<(), Error> {
    if RESERVED_NAMES.contains(&name) {
        Err(Error::ReservedName)
    } else {
        Ok(())
    }
}

impl MmapEngine {
    pub fn new() -> Self {
        MmapEngine::default()
    }

    /// Declares a region synced *from* `from_core` into local memory of
    /// `initial` bytes. The caller reads the current value back out with
    /// [`MmapEngine::region_from`] after an update lands.
    pub fn mmap_from(
        &mut self,
        from_core: &str,
        name: &str,
        initial: &[u8],
    ) -> Result<(), Error> {
        check_reserved(name)?;
        self.from_regions.push(FromRegion {
            from_core: from_core.to_string(),
            name: name.to_string(),
            data: initial.to_vec(),
            update_callback: None,
            synced: false,
        });
        Ok(())
    }

    /// Declares a region synced *to* `to_core`, initialized from `data`.
    pub fn mmap_to(&mut self, to_core: &str, name: &str, data: &[u8]) -> Result<(), Error> {
        check_reserved(name)?;
        self.to_regions.push(ToRegion {
            to_core: to_core.to_string(),
            name: name.to_string(),
            data: data.to_vec(),
            last_sent: Vec::new(),
        });
        Ok(())
    }

    pub fn set_update_callback(
        &mut self,
        name: &str,
        callback: impl FnMut(&[u8]) + 'static,
    ) {
        if let Some(r) = self.from_regions.iter_mut().find(|r| r.name == name) {
            r.update_callback = Some(alloc::boxed::Box::new(callback));
        }
    }

    pub fn region_from(&self, name: &str) -> Option<&[u8]> {
        self.from_regions.iter().find(|r| r.name == name).map(|r| r.data.as_slice())
    }

    /// Writes new local data into a "to" region, marking it dirty for the
    /// next [`MmapEngine::push_updates`] diff check.
    pub fn write_to_region(&mut self, name: &str, data: &[u8]) -> Result<(), Error> {
        let region = self.to_regions.iter_mut().find(|r| r.name == name);
        match region {
            Some(r) if r.data.len() == data.len() => {
                r.data.copy_from_slice(data);
                Ok(())
            }
            Some(_) => Err(Error::SizeMismatch),
            None => Err(Error::UnknownTarget),
        }
    }

    /// Pushes every "to" region whose data has changed since the last push
    /// (or every region, if `diff_sync` is false) to its destination core.
    /// Mirrors the "send before posting a message, so recipients always see
    /// fresh shared memory" ordering the scheduler relies on.
    pub fn push_updates(
        &mut self,
        mcus: &mut McuRegistry,
        target_core: Option<&str>,
        diff_sync: bool,
    ) {
        let Some(local_name) = mcus.local_core_name().map(str::to_string) else { return };
        for region in &mut self.to_regions {
            if let Some(target) = target_core {
                if region.to_core != target {
                    continue;
                }
            }
            if diff_sync && region.data == region.last_sent {
                continue;
            }
            let entry = MmapRegionEntry {
                name: region.name.clone(),
                src_core: local_name.clone(),
                dst_core: region.to_core.clone(),
                mem_size: region.data.len() as u32,
                mem_data: region.data.clone(),
            };
            let encoded = envelope::encode_mmap(&[entry]);
            if mcus.router_raw(&region.to_core, &encoded.to_wire(), None) {
                region.last_sent = region.data.clone();
            }
        }
    }

    /// Applies an inbound region update. If we are the destination, updates
    /// local memory and fires the region's callback (only if the bytes
    /// actually changed). If we are not the destination, forwards the
    /// update on toward its real destination, avoiding the tunnel it
    /// arrived on.
    pub fn apply_inbound(
        &mut self,
        mcus: &mut McuRegistry,
        entry: &MmapRegionEntry,
        via: TunnelId,
    ) {
        let Some(local_name) = mcus.local_core_name() else { return };
        if entry.dst_core != local_name {
            let encoded = envelope::encode_mmap(core::slice::from_ref(entry));
            mcus.router_raw(&entry.dst_core, &encoded.to_wire(), Some(via));
            return;
        }
        let Some(region) = self
            .from_regions
            .iter_mut()
            .find(|r| r.from_core == entry.src_core && r.name == entry.name)
        else {
            return;
        };
        if region.data.len() != entry.mem_data.len() {
            ringbuf::ringbuf_entry!(MmapEvent::SizeMismatch {
                local_len: region.data.len() as u16,
                incoming_len: entry.mem_data.len() as u16,
            });
            return;
        }
        region.synced = true;
        if region.data != entry.mem_data {
            region.data.copy_from_slice(&entry.mem_data);
            if let Some(cb) = &mut region.update_callback {
                cb(&region.data);
            }
        }
    }

    /// Handles an `mmap_sync_req` envelope: if we are the source it names,
    /// pushes our current data to the requested destination immediately
    /// (not diffed -- the peer asked because it has nothing to diff
    /// against); otherwise forwards the request toward the real source.
    pub fn handle_sync_request(
        &mut self,
        mcus: &mut McuRegistry,
        src_core: &str,
        dst_core: &str,
        via: TunnelId,
    ) {
        if mcus.local_core_name() == Some(src_core) {
            self.push_updates(mcus, Some(dst_core), false);
        } else {
            let encoded = envelope::encode_mmap_sync_req(src_core, dst_core);
            mcus.router_raw(src_core, &encoded.to_wire(), Some(via));
        }
    }

    /// Arms a one-shot timer: after `delay_ms` elapses, request a sync from
    /// every "from" region's source that hasn't synced yet. Called once at
    /// startup and again whenever topology changes.
    pub fn arm_unsync_check(&mut self, delay_ms: i32) {
        self.unsync_retry_due_in_ms = Some(delay_ms);
    }

    /// Milliseconds until the armed unsync-retry timer fires, if any is
    /// armed. Folded into [`crate::sched::Kernel::idle_time_ms`] so the
    /// outer loop never sleeps past it.
    pub fn unsync_retry_due_in_ms(&self) -> Option<u32> {
        self.unsync_retry_due_in_ms.map(|ms| ms.max(0) as u32)
    }

    /// Advances the unsync-retry timer by `delta_ms`; when it fires, sends
    /// an `mmap_sync_req` for every region still unsynced.
    pub fn tick(&mut self, mcus: &mut McuRegistry, delta_ms: u32) {
        let Some(remaining) = self.unsync_retry_due_in_ms.as_mut() else { return };
        *remaining -= delta_ms as i32;
        if *remaining > 0 {
            return;
        }
        self.unsync_retry_due_in_ms = None;
        let Some(local_name) = mcus.local_core_name().map(str::to_string) else { return };

        mcus.reset_all_mmap_req_sent();
        let unsynced_sources: Vec<String> = self
            .from_regions
            .iter()
            .filter(|r| !r.synced)
            .map(|r| r.from_core.clone())
            .collect();
        for source in unsynced_sources {
            if mcus.mmap_req_sent(&source) {
                continue;
            }
            let encoded = envelope::encode_mmap_sync_req(&source, &local_name);
            if mcus.router_raw(&source, &encoded.to_wire(), None) {
                mcus.set_mmap_req_sent(&source, true);
            }
        }
    }
}
