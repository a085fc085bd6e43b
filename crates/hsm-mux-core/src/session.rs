use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Instant,
};

use parking_lot::{Mutex, RwLock};
use tracing::info;
use uuid::Uuid;

use crate::{cache::DeviceKeyId, cache::MasterKeyId, protocol::KeyType};

pub type ClientHandle = u32;
pub type HashHandle = u32;
pub type KeyHandle = u32;

/// Where an open key handle lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyRoute {
    pub device_index: usize,
    pub device_key_id: DeviceKeyId,
    pub master_key_id: Option<MasterKeyId>,
}

/// The key the session touched last; used by operations that carry no handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurrentKeyOp {
    pub device_index: usize,
    pub handle: Option<KeyHandle>,
    pub device_key_id: DeviceKeyId,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SessionDefaults {
    pub pinned_device: Option<usize>,
    pub allow_exportable_private_keys: bool,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub client: ClientHandle,
    /// Connected from outside the appliance; not allowed to change routing.
    pub from_ethernet: bool,
    pub pinned_device: Option<usize>,
    pub cache_generated_keys: bool,
    pub incoming_ids_are_device_ids: bool,
    pub allow_exportable_private_keys: bool,
    pub hash_op_routes: HashMap<HashHandle, usize>,
    pub key_op_routes: HashMap<KeyHandle, KeyRoute>,
    pub current_key_op: Option<CurrentKeyOp>,
    /// Type of the last key this session created.
    pub last_key_type: Option<KeyType>,
    pub opened_at: Instant,
}

impl Session {
    fn new(client: ClientHandle, from_ethernet: bool, defaults: SessionDefaults) -> Self {
        Self {
            client,
            from_ethernet,
            pinned_device: defaults.pinned_device,
            cache_generated_keys: true,
            incoming_ids_are_device_ids: false,
            allow_exportable_private_keys: defaults.allow_exportable_private_keys,
            hash_op_routes: HashMap::new(),
            key_op_routes: HashMap::new(),
            current_key_op: None,
            last_key_type: None,
            opened_at: Instant::now(),
        }
    }

    /// Pinned device, else the device of the current key operation.
    pub fn current_device(&self) -> Option<usize> {
        self.pinned_device
            .or_else(|| self.current_key_op.map(|op| op.device_index))
    }

    pub fn set_current_key(&mut self, device_index: usize, handle: Option<KeyHandle>, key: Uuid) {
        self.current_key_op = Some(CurrentKeyOp {
            device_index,
            handle,
            device_key_id: key,
        });
    }
}

pub type SharedSession = Arc<Mutex<Session>>;

/// Owns every live session, keyed by the handle issued at connect time.
pub struct SessionStore {
    sessions: RwLock<HashMap<ClientHandle, SharedSession>>,
    next_handle: AtomicU32,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_handle: AtomicU32::new(1),
        }
    }

    pub fn create(&self, from_ethernet: bool, defaults: SessionDefaults) -> ClientHandle {
        let mut sessions = self.sessions.write();
        let client = loop {
            let candidate = self.next_handle.fetch_add(1, Ordering::SeqCst);
            if candidate != 0 && !sessions.contains_key(&candidate) {
                break candidate;
            }
        };
        sessions.insert(
            client,
            Arc::new(Mutex::new(Session::new(client, from_ethernet, defaults))),
        );
        info!(client = format_args!("0x{client:x}"), from_ethernet, "session opened");
        client
    }

    pub fn get(&self, client: ClientHandle) -> Option<SharedSession> {
        self.sessions.read().get(&client).cloned()
    }

    pub fn remove(&self, client: ClientHandle) -> Option<SharedSession> {
        let removed = self.sessions.write().remove(&client);
        if removed.is_some() {
            info!(client = format_args!("0x{client:x}"), "session closed");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn clients(&self) -> Vec<ClientHandle> {
        self.sessions.read().keys().copied().collect()
    }
}
