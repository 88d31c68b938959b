// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Ownership-indexed handle table.
//!
//! This is the security kernel of the broker: every tenant-visible resource
//! identifier is an opaque handle minted here, and every access is
//! authorized against the owning zone recorded at insertion. An access to a
//! handle owned by another zone is answered exactly like an access to a
//! handle that does not exist, so a tenant cannot probe the handle space
//! for its neighbors' allocations.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Mutex;

use log::warn;

use crate::device::DevicePtr;

/// Snapshot of the table's live-record accounting.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TableStats {
    pub handles: u64,
    pub bytes: u64,
}

struct HandleRecord {
    owner_zone: u32,
    ptr: DevicePtr,
    size: u64,
}

struct Inner {
    records: HashMap<u64, HandleRecord>,
    next_handle: u64,
    stats: TableStats,
}

pub struct HandleTable {
    inner: Mutex<Inner>,
}

impl HandleTable {
    pub fn new() -> HandleTable {
        HandleTable {
            inner: Mutex::new(Inner {
                records: HashMap::new(),
                // Handle 0 is the reserved null handle.
                next_handle: 1,
                stats: TableStats {
                    handles: 0,
                    bytes: 0,
                },
            }),
        }
    }

    /// Mints a fresh handle for `ptr` owned by `owner_zone`. Handle values
    /// are never reused for the lifetime of the table. Returns 0 only if a
    /// handle cannot be allocated.
    pub fn insert(&self, owner_zone: u32, ptr: DevicePtr, size: u64) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let handle = inner.next_handle;
        inner.next_handle += 1;
        inner.records.insert(
            handle,
            HandleRecord {
                owner_zone,
                ptr,
                size,
            },
        );
        inner.stats.handles += 1;
        inner.stats.bytes += size;
        handle
    }

    /// Resolves `handle` for `requesting_zone`.
    ///
    /// A handle owned by another zone is reported as absent, and the probe
    /// is logged as a security event.
    pub fn lookup(&self, requesting_zone: u32, handle: u64) -> Option<(DevicePtr, u64)> {
        let inner = self.inner.lock().unwrap();
        let record = inner.records.get(&handle)?;
        if record.owner_zone != requesting_zone {
            warn!(
                "security: zone {} attempted access to handle {:#x} owned by zone {}",
                requesting_zone, handle, record.owner_zone
            );
            return None;
        }
        Some((record.ptr, record.size))
    }

    /// Unlinks `handle` for `requesting_zone` and returns the resource for
    /// the caller to release. Authorization matches [`lookup`]; a repeated
    /// remove finds nothing.
    ///
    /// [`lookup`]: HandleTable::lookup
    pub fn remove(&self, requesting_zone: u32, handle: u64) -> Option<DevicePtr> {
        let mut inner = self.inner.lock().unwrap();
        let record = match inner.records.entry(handle) {
            Entry::Occupied(entry) => {
                if entry.get().owner_zone != requesting_zone {
                    warn!(
                        "security: zone {} attempted to free handle {:#x} owned by zone {}",
                        requesting_zone,
                        handle,
                        entry.get().owner_zone
                    );
                    return None;
                }
                entry.remove()
            }
            Entry::Vacant(_) => return None,
        };
        inner.stats.handles -= 1;
        inner.stats.bytes -= record.size;
        Some(record.ptr)
    }

    pub fn stats(&self) -> TableStats {
        self.inner.lock().unwrap().stats
    }

    /// Empties the table at shutdown, yielding every live record so the
    /// broker can release the device allocations.
    pub fn drain(&self) -> Vec<(u64, DevicePtr, u64)> {
        let mut inner = self.inner.lock().unwrap();
        inner.stats = TableStats {
            handles: 0,
            bytes: 0,
        };
        inner
            .records
            .drain()
            .map(|(handle, record)| (handle, record.ptr, record.size))
            .collect()
    }
}

impl Default for HandleTable {
    fn default() -> HandleTable {
        HandleTable::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_are_unique_and_nonzero() {
        let table = HandleTable::new();
        let mut seen = std::collections::HashSet::new();
        for i in 0..100 {
            let handle = table.insert(2, DevicePtr(0x1000 + i), 64);
            assert_ne!(handle, 0);
            assert!(seen.insert(handle));
        }
        // Uniqueness holds across removal too.
        let freed = *seen.iter().next().unwrap();
        table.remove(2, freed).unwrap();
        let fresh = table.insert(2, DevicePtr(0x9000), 64);
        assert!(seen.insert(fresh));
    }

    #[test]
    fn lookup_returns_record_for_owner() {
        let table = HandleTable::new();
        let handle = table.insert(2, DevicePtr(0xabc), 4096);
        assert_eq!(table.lookup(2, handle), Some((DevicePtr(0xabc), 4096)));
    }

    #[test]
    fn foreign_zone_is_indistinguishable_from_absent() {
        let table = HandleTable::new();
        let handle = table.insert(2, DevicePtr(0xabc), 4096);

        // Wrong owner and nonexistent handle produce the same answer.
        assert_eq!(table.lookup(3, handle), None);
        assert_eq!(table.lookup(3, handle + 100), None);
        assert_eq!(table.remove(3, handle), None);

        // The record survived the denied attempts.
        assert_eq!(table.lookup(2, handle), Some((DevicePtr(0xabc), 4096)));
        assert_eq!(
            table.stats(),
            TableStats {
                handles: 1,
                bytes: 4096
            }
        );
    }

    #[test]
    fn remove_is_idempotent() {
        let table = HandleTable::new();
        let handle = table.insert(2, DevicePtr(0xabc), 128);
        assert_eq!(table.remove(2, handle), Some(DevicePtr(0xabc)));
        assert_eq!(table.remove(2, handle), None);
        assert_eq!(table.lookup(2, handle), None);
    }

    #[test]
    fn stats_track_live_records_only() {
        let table = HandleTable::new();
        let a = table.insert(2, DevicePtr(1), 100);
        let b = table.insert(3, DevicePtr(2), 200);
        assert_eq!(
            table.stats(),
            TableStats {
                handles: 2,
                bytes: 300
            }
        );

        table.remove(2, a).unwrap();
        assert_eq!(
            table.stats(),
            TableStats {
                handles: 1,
                bytes: 200
            }
        );

        table.remove(3, b).unwrap();
        assert_eq!(
            table.stats(),
            TableStats {
                handles: 0,
                bytes: 0
            }
        );
    }

    #[test]
    fn drain_yields_all_records_and_resets_stats() {
        let table = HandleTable::new();
        table.insert(2, DevicePtr(1), 100);
        table.insert(3, DevicePtr(2), 200);

        let mut drained = table.drain();
        drained.sort_by_key(|&(handle, _, _)| handle);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].1, DevicePtr(1));
        assert_eq!(drained[1].1, DevicePtr(2));
        assert_eq!(
            table.stats(),
            TableStats {
                handles: 0,
                bytes: 0
            }
        );
    }
}
