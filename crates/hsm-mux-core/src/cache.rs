//! Two-tier key location cache.
//!
//! The master table maps a router-issued master key id to every device that
//! holds the key; each device table maps that device's local key id back to
//! the master id. Mutations hold the write locks of every table they touch
//! (master first, then device tables in ascending index order) for their
//! whole duration, so lookups never observe one side of a pair without the
//! other.

use std::{
    collections::BTreeMap,
    path::Path,
    sync::atomic::{AtomicBool, Ordering},
};

use parking_lot::{Mutex, RwLock};
use rand::{RngCore, rngs::OsRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{MuxError, MuxResult},
    persist,
};

pub type MasterKeyId = Uuid;
pub type DeviceKeyId = Uuid;

pub const MASTER_BACKUP_FILE: &str = "cache_master.db";
pub const MAPPING_BACKUP_FILE: &str = "cache_mapping.db";

pub fn device_backup_file(index: usize) -> String {
    format!("cache_alpha_{index}.db")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterRow {
    #[serde(rename = "keytype")]
    pub key_type: u32,
    pub flags: u32,
    #[serde(rename = "uuid_list")]
    pub locations: BTreeMap<usize, DeviceKeyId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRow {
    pub master_key_id: MasterKeyId,
}

/// Consistent copy of every table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheSnapshot {
    pub master: BTreeMap<MasterKeyId, MasterRow>,
    pub devices: Vec<BTreeMap<DeviceKeyId, DeviceRow>>,
}

type DeviceTable = BTreeMap<DeviceKeyId, DeviceRow>;

pub struct KeyCache {
    master: RwLock<BTreeMap<MasterKeyId, MasterRow>>,
    devices: Vec<RwLock<DeviceTable>>,
    rng: Mutex<Box<dyn RngCore + Send>>,
    initialized: AtomicBool,
}

impl std::fmt::Debug for KeyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyCache")
            .field("device_count", &self.devices.len())
            .field("keys", &self.key_count())
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

impl KeyCache {
    pub fn new(device_count: usize) -> Self {
        Self::with_rng(device_count, OsRng)
    }

    /// Cache drawing master ids from `rng`.
    pub fn with_rng<R: RngCore + Send + 'static>(device_count: usize, rng: R) -> Self {
        Self {
            master: RwLock::new(BTreeMap::new()),
            devices: (0..device_count).map(|_| RwLock::new(BTreeMap::new())).collect(),
            rng: Mutex::new(Box::new(rng)),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::Release);
    }

    fn device_table(&self, device_index: usize) -> MuxResult<&RwLock<DeviceTable>> {
        self.devices.get(device_index).ok_or_else(|| {
            MuxError::invalid(format!(
                "device index {device_index} out of range ({} devices)",
                self.devices.len()
            ))
        })
    }

    fn fresh_master_id(&self, master: &BTreeMap<MasterKeyId, MasterRow>) -> MasterKeyId {
        let mut rng = self.rng.lock();
        loop {
            let mut bytes = [0u8; 16];
            rng.fill_bytes(&mut bytes);
            let id = uuid::Builder::from_random_bytes(bytes).into_uuid();
            if !id.is_nil() && !master.contains_key(&id) {
                return id;
            }
        }
    }

    /// Registers `device_key_id` on `device_index` and returns its master id.
    ///
    /// An existing `master_key_id` gains `device_index` as another location.
    /// Without one, or when it is unknown, a fresh master id is issued.
    pub fn add_key(
        &self,
        device_index: usize,
        device_key_id: DeviceKeyId,
        key_type: u32,
        flags: u32,
        master_key_id: Option<MasterKeyId>,
    ) -> MuxResult<MasterKeyId> {
        let table = self.device_table(device_index)?;
        let mut master = self.master.write();
        let mut device = table.write();

        if let Some(existing) = device.get(&device_key_id) {
            warn!(
                device = device_index,
                key = %device_key_id,
                master = %existing.master_key_id,
                "device key already cached; registration ignored"
            );
            return Ok(existing.master_key_id);
        }

        let id = match master_key_id.filter(|id| master.contains_key(id)) {
            Some(id) => {
                let Some(row) = master.get_mut(&id) else {
                    return Err(MuxError::invalid("master row vanished under write lock"));
                };
                if let Some(existing) = row.locations.get(&device_index) {
                    warn!(
                        master = %id,
                        device = device_index,
                        existing = %existing,
                        requested = %device_key_id,
                        "duplicate key registration ignored"
                    );
                    return Ok(id);
                }
                row.locations.insert(device_index, device_key_id);
                id
            }
            None => {
                let id = self.fresh_master_id(&master);
                master.insert(
                    id,
                    MasterRow {
                        key_type,
                        flags,
                        locations: BTreeMap::from([(device_index, device_key_id)]),
                    },
                );
                id
            }
        };

        device.insert(device_key_id, DeviceRow { master_key_id: id });
        metrics::gauge!("hsm_mux_cache_keys").set(master.len() as f64);
        debug!(master = %id, device = device_index, key = %device_key_id, "key cached");
        Ok(id)
    }

    /// Drops the master row and all of its device rows, returning the removed
    /// locations. Unknown ids remove nothing.
    pub fn remove_key(&self, master_key_id: &MasterKeyId) -> BTreeMap<usize, DeviceKeyId> {
        let mut master = self.master.write();
        let Some(row) = master.remove(master_key_id) else {
            return BTreeMap::new();
        };
        for (&index, device_key_id) in &row.locations {
            let Some(table) = self.devices.get(index) else {
                continue;
            };
            let mut device = table.write();
            if device
                .get(device_key_id)
                .is_some_and(|entry| entry.master_key_id == *master_key_id)
            {
                device.remove(device_key_id);
            }
        }
        metrics::gauge!("hsm_mux_cache_keys").set(master.len() as f64);
        debug!(master = %master_key_id, locations = row.locations.len(), "key removed from cache");
        row.locations
    }

    /// Drops one device-table row. The master row is left as is.
    pub fn remove_key_on_device(
        &self,
        device_index: usize,
        device_key_id: &DeviceKeyId,
    ) -> Option<MasterKeyId> {
        let table = self.devices.get(device_index)?;
        let removed = table.write().remove(device_key_id)?;
        debug!(device = device_index, key = %device_key_id, "device key removed from cache");
        Some(removed.master_key_id)
    }

    pub fn lookup_master(
        &self,
        device_index: usize,
        device_key_id: &DeviceKeyId,
    ) -> Option<MasterKeyId> {
        let table = self.devices.get(device_index)?;
        table.read().get(device_key_id).map(|row| row.master_key_id)
    }

    pub fn lowest_device_for(&self, master_key_id: &MasterKeyId) -> Option<(usize, DeviceKeyId)> {
        self.master
            .read()
            .get(master_key_id)
            .and_then(|row| row.locations.first_key_value())
            .map(|(&index, &key)| (index, key))
    }

    pub fn locations_of(&self, master_key_id: &MasterKeyId) -> BTreeMap<usize, DeviceKeyId> {
        self.master
            .read()
            .get(master_key_id)
            .map(|row| row.locations.clone())
            .unwrap_or_default()
    }

    pub fn master_row(&self, master_key_id: &MasterKeyId) -> Option<MasterRow> {
        self.master.read().get(master_key_id).cloned()
    }

    pub fn key_count(&self) -> usize {
        self.master.read().len()
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        let master = self.master.read();
        let devices = self.devices.iter().map(|table| table.read().clone()).collect();
        CacheSnapshot {
            master: master.clone(),
            devices,
        }
    }

    /// Flat device key id -> master key id view across every device.
    pub fn mapping(&self) -> BTreeMap<DeviceKeyId, MasterKeyId> {
        let mut mapping = BTreeMap::new();
        for table in &self.devices {
            for (device_key_id, row) in table.read().iter() {
                mapping.insert(*device_key_id, row.master_key_id);
            }
        }
        mapping
    }

    pub fn clear(&self) {
        let mut master = self.master.write();
        let mut devices: Vec<_> = self.devices.iter().map(|table| table.write()).collect();
        master.clear();
        for device in devices.iter_mut() {
            device.clear();
        }
        metrics::gauge!("hsm_mux_cache_keys").set(0.0);
        self.mark_initialized();
    }

    /// Writes the master table as a JSON array of `{master_id: row}` objects.
    pub fn persist_to_file(&self, path: &Path) -> MuxResult<()> {
        let master = self.master.read();
        let rows: Vec<BTreeMap<&MasterKeyId, &MasterRow>> =
            master.iter().map(|(id, row)| BTreeMap::from([(id, row)])).collect();
        persist::write_json(path, &rows)
    }

    /// Writes the master table, every device table and the flat mapping into
    /// `dir`.
    pub fn backup(&self, dir: &Path) -> MuxResult<()> {
        persist::ensure_backup_dir(dir)?;
        let snapshot = self.snapshot();

        let master: Vec<BTreeMap<&MasterKeyId, &MasterRow>> = snapshot
            .master
            .iter()
            .map(|(id, row)| BTreeMap::from([(id, row)]))
            .collect();
        persist::write_json(&dir.join(MASTER_BACKUP_FILE), &master)?;

        let mut mapping = BTreeMap::new();
        for (index, table) in snapshot.devices.iter().enumerate() {
            let rows: Vec<BTreeMap<&DeviceKeyId, &DeviceRow>> = table
                .iter()
                .map(|(id, row)| BTreeMap::from([(id, row)]))
                .collect();
            persist::write_json(&dir.join(device_backup_file(index)), &rows)?;
            mapping.extend(table.iter().map(|(id, row)| (*id, row.master_key_id)));
        }
        persist::write_json(&dir.join(MAPPING_BACKUP_FILE), &mapping)?;

        info!(dir = %dir.display(), keys = snapshot.master.len(), "cache backup written");
        Ok(())
    }

    /// Replaces the tables with the master table found in `dir`. Device tables
    /// are rebuilt from the master rows.
    pub fn restore(&self, dir: &Path) -> MuxResult<usize> {
        let rows: Vec<BTreeMap<MasterKeyId, MasterRow>> =
            persist::read_json(&dir.join(MASTER_BACKUP_FILE))?;

        let mut master = self.master.write();
        let mut devices: Vec<_> = self.devices.iter().map(|table| table.write()).collect();
        master.clear();
        for device in devices.iter_mut() {
            device.clear();
        }

        for (id, mut row) in rows.into_iter().flatten() {
            row.locations.retain(|&index, key| {
                let Some(device) = devices.get(index) else {
                    warn!(master = %id, device = index, key = %key, "dropping location on unknown device");
                    return false;
                };
                if let Some(claimed) = device.get(key) {
                    warn!(
                        master = %id,
                        device = index,
                        key = %key,
                        claimed_by = %claimed.master_key_id,
                        "dropping location already claimed by another master id"
                    );
                    return false;
                }
                true
            });
            if row.locations.is_empty() || id.is_nil() || master.contains_key(&id) {
                warn!(master = %id, "skipping unusable cache row");
                continue;
            }
            for (&index, &device_key_id) in &row.locations {
                devices[index].insert(device_key_id, DeviceRow { master_key_id: id });
            }
            master.insert(id, row);
        }

        let restored = master.len();
        metrics::gauge!("hsm_mux_cache_keys").set(restored as f64);
        self.mark_initialized();
        info!(dir = %dir.display(), keys = restored, "cache restored");
        Ok(restored)
    }
}
