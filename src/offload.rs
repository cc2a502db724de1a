//! Offload lifetime: RSS and QEO configuration, installed with a
//! snapshot-before/install/revert-on-`Drop` discipline and serialized by a
//! `spin::RwLock`-backed push lock, the same kind of primitive
//! `XskDeviceControl` uses to guard the set of device queues attached to
//! one UMEM, generalized here to guard per-interface offload state instead.
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::RwLock;

use crate::error::XdpError;

/// Fixed capabilities reported by `OFFLOAD_RSS_GET_CAPABILITIES`. Not
/// interface-dependent in this software implementation — there is no real
/// NIC whose capabilities to query.
pub const RSS_MAX_HASH_KEY_SIZE: usize = 40;
pub const RSS_MAX_INDIRECTION_TABLE_SIZE: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RssCapabilities {
    pub max_hash_key_size: u32,
    pub max_indirection_table_size: u32,
}

impl Default for RssCapabilities {
    fn default() -> Self {
        RssCapabilities {
            max_hash_key_size: RSS_MAX_HASH_KEY_SIZE as u32,
            max_indirection_table_size: RSS_MAX_INDIRECTION_TABLE_SIZE as u32,
        }
    }
}

/// RSS hash type bits, `OR`ed together.
pub mod rss_hash_type {
    pub const IPV4: u32 = 1 << 0;
    pub const IPV4_UDP: u32 = 1 << 1;
    pub const IPV4_TCP: u32 = 1 << 2;
    pub const IPV6: u32 = 1 << 3;
    pub const IPV6_UDP: u32 = 1 << 4;
    pub const IPV6_TCP: u32 = 1 << 5;
}

/// An RSS hash configuration: which headers are hashed, the secret key,
/// and the queue indirection table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RssConfiguration {
    pub hash_type: u32,
    pub hash_secret_key: Vec<u8>,
    pub indirection_table: Vec<u16>,
}

impl RssConfiguration {
    fn validate(&self) -> Result<(), XdpError> {
        if self.hash_secret_key.len() > RSS_MAX_HASH_KEY_SIZE {
            return Err(XdpError::InvalidArgument("RSS hash key too long"));
        }
        if self.indirection_table.len() > RSS_MAX_INDIRECTION_TABLE_SIZE {
            return Err(XdpError::InvalidArgument("RSS indirection table too long"));
        }
        if self.indirection_table.is_empty() {
            return Err(XdpError::InvalidArgument("RSS indirection table must not be empty"));
        }
        Ok(())
    }
}

/// One QEO (QUIC Encapsulation Offload) entry: add or remove a connection's
/// decrypt state from the datapath, keyed by its connection ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QeoOperation {
    Add,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QeoConnection {
    pub operation: QeoOperation,
    pub connection_id: Vec<u8>,
}

/// Which configuration an [`OffloadHandle`] will restore on `Drop`.
enum Snapshot {
    Rss(Option<RssConfiguration>),
    Qeo(Option<Vec<QeoConnection>>),
}

/// Per-interface RSS/QEO state, shared by every [`OffloadHandle`] issued
/// against it. One push lock per offload kind, each guarding a map keyed
/// by `if_index` — the same shape as `XskDeviceControl`, just generalized
/// to two maps instead of one set.
#[derive(Default)]
pub struct OffloadRegistry {
    rss: RwLock<BTreeMap<u32, RssConfiguration>>,
    qeo: RwLock<BTreeMap<u32, Vec<QeoConnection>>>,
}

impl OffloadRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(OffloadRegistry::default())
    }

    pub fn rss_capabilities(&self, _if_index: u32) -> RssCapabilities {
        RssCapabilities::default()
    }

    pub fn rss_get(&self, if_index: u32) -> Option<RssConfiguration> {
        self.rss.read().get(&if_index).cloned()
    }

    /// Install `config` for `if_index`, returning a handle that restores
    /// whatever was installed before (or clears the entry, if nothing was)
    /// when dropped. The read-then-insert happens under one write-lock
    /// acquisition, so a second `rss_set` racing on the same interface
    /// either fully precedes or fully follows this one.
    pub fn rss_set(self: &Arc<Self>, if_index: u32, config: RssConfiguration) -> Result<OffloadHandle, XdpError> {
        config.validate()?;
        let mut guard = self.rss.write();
        let previous = guard.insert(if_index, config);
        drop(guard);
        Ok(OffloadHandle {
            registry: self.clone(),
            if_index,
            snapshot: Snapshot::Rss(previous),
        })
    }

    pub fn rss_clear(&self, if_index: u32) {
        self.rss.write().remove(&if_index);
    }

    pub fn qeo_get(&self, if_index: u32) -> Vec<QeoConnection> {
        self.qeo.read().get(&if_index).cloned().unwrap_or_default()
    }

    pub fn qeo_set(
        self: &Arc<Self>,
        if_index: u32,
        connections: Vec<QeoConnection>,
    ) -> Result<OffloadHandle, XdpError> {
        let mut guard = self.qeo.write();
        let previous = guard.insert(if_index, connections);
        drop(guard);
        Ok(OffloadHandle {
            registry: self.clone(),
            if_index,
            snapshot: Snapshot::Qeo(previous),
        })
    }
}

/// A live offload installation. Reverts its interface to the
/// pre-installation configuration when dropped — closing the handle is the
/// only way to undo an install ("snapshot on install, revert
/// on close").
pub struct OffloadHandle {
    registry: Arc<OffloadRegistry>,
    if_index: u32,
    snapshot: Snapshot,
}

impl Drop for OffloadHandle {
    fn drop(&mut self) {
        match &self.snapshot {
            Snapshot::Rss(previous) => {
                let mut guard = self.registry.rss.write();
                match previous {
                    Some(config) => {
                        guard.insert(self.if_index, config.clone());
                    }
                    None => {
                        guard.remove(&self.if_index);
                    }
                }
            }
            Snapshot::Qeo(previous) => {
                let mut guard = self.registry.qeo.write();
                match previous {
                    Some(connections) => {
                        guard.insert(self.if_index, connections.clone());
                    }
                    None => {
                        guard.remove(&self.if_index);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rss_config(key_len: usize, table_len: usize) -> RssConfiguration {
        RssConfiguration {
            hash_type: rss_hash_type::IPV4_UDP,
            hash_secret_key: alloc::vec![0u8; key_len],
            indirection_table: (0..table_len as u16).collect(),
        }
    }

    #[test]
    fn rejects_oversized_hash_key() {
        let registry = OffloadRegistry::new();
        let err = registry
            .rss_set(1, rss_config(RSS_MAX_HASH_KEY_SIZE + 1, 4))
            .unwrap_err();
        assert!(matches!(err, XdpError::InvalidArgument(_)));
    }

    #[test]
    fn rejects_empty_indirection_table() {
        let registry = OffloadRegistry::new();
        let err = registry.rss_set(1, rss_config(16, 0)).unwrap_err();
        assert!(matches!(err, XdpError::InvalidArgument(_)));
    }

    #[test]
    fn drop_reverts_to_prior_configuration() {
        let registry = OffloadRegistry::new();
        let first = registry.rss_set(7, rss_config(16, 4)).unwrap();
        assert_eq!(registry.rss_get(7), Some(rss_config(16, 4)));

        let second = registry.rss_set(7, rss_config(16, 8)).unwrap();
        assert_eq!(registry.rss_get(7), Some(rss_config(16, 8)));

        drop(second);
        assert_eq!(registry.rss_get(7), Some(rss_config(16, 4)));

        drop(first);
        assert_eq!(registry.rss_get(7), None);
    }

    #[test]
    fn clear_removes_without_needing_a_handle() {
        let registry = OffloadRegistry::new();
        let handle = registry.rss_set(3, rss_config(16, 4)).unwrap();
        registry.rss_clear(3);
        assert_eq!(registry.rss_get(3), None);
        // Dropping the now-stale handle still only touches interface 3;
        // it reinstalls the pre-`rss_set` state (`None`), which the
        // explicit `rss_clear` already produced.
        drop(handle);
        assert_eq!(registry.rss_get(3), None);
    }

    #[test]
    fn qeo_set_reverts_on_drop() {
        let registry = OffloadRegistry::new();
        let entry = QeoConnection {
            operation: QeoOperation::Add,
            connection_id: alloc::vec![1, 2, 3, 4],
        };
        let handle = registry.qeo_set(9, alloc::vec![entry.clone()]).unwrap();
        assert_eq!(registry.qeo_get(9), alloc::vec![entry]);

        drop(handle);
        assert!(registry.qeo_get(9).is_empty());
    }
}
