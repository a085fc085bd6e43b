//! The RPC router: presents the device pool as one HSM.
//!
//! Each request is tagged with the handle of the client session that sent it.
//! The router picks the device(s) that must serve it, rewrites identifiers
//! where the device and the client disagree, and always answers with a well
//! formed reply whose client handle is the caller's own.

mod keys;
mod matching;
mod table;

pub use table::Route;

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::{
    balancer::LoadBalancer,
    cache::KeyCache,
    device::{DeviceLoad, DeviceState},
    error::{MuxError, MuxResult},
    protocol::{HalError, RpcFunc, TRANSPORT_FAILURE_CODE},
    session::{ClientHandle, SessionDefaults, SessionStore, SharedSession},
    settings::MuxSettings,
    transport::DeviceHandle,
    wire::{self, PacketWriter},
};

/// Busy weight held by every open key handle.
pub const OPEN_HANDLE_WEIGHT: u64 = 1;

/// Busy weight held for the duration of a key creation call.
pub const KEYGEN_WEIGHT: u64 = 100;

/// Device index in a set-device request that returns the session to
/// automatic selection.
pub const AUTO_DEVICE: u32 = u32::MAX;

/// Router outcome before the client handle is restored. `Err` becomes a
/// header-only reply carrying the result code.
type Reply = Result<Bytes, HalError>;

fn result_of(reply: &[u8]) -> Result<u32, HalError> {
    wire::result_code(reply).map_err(|_| HalError::RpcTransport)
}

/// Holds extra busy weight on a device until dropped.
struct BusyGuard<'a> {
    load: &'a DeviceLoad,
    amount: u64,
}

impl<'a> BusyGuard<'a> {
    fn new(load: &'a DeviceLoad, amount: u64) -> Self {
        load.increment(amount);
        Self { load, amount }
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.load.decrement(self.amount);
    }
}

pub struct Router {
    devices: Vec<Arc<DeviceHandle>>,
    loads: Vec<Arc<DeviceLoad>>,
    balancer: LoadBalancer,
    sessions: SessionStore,
    cache: Arc<KeyCache>,
    settings: RwLock<MuxSettings>,
    default_device: RwLock<Option<usize>>,
    locked: AtomicBool,
    tamper_detected: AtomicBool,
}

impl Router {
    pub fn new(
        devices: Vec<Arc<DeviceHandle>>,
        cache: Arc<KeyCache>,
        settings: MuxSettings,
    ) -> MuxResult<Self> {
        if cache.device_count() != devices.len() {
            return Err(MuxError::config(format!(
                "cache tracks {} devices but {} are attached",
                cache.device_count(),
                devices.len()
            )));
        }
        let loads = devices.iter().map(|device| Arc::clone(device.load())).collect();
        Ok(Self {
            devices,
            loads,
            balancer: LoadBalancer::new(),
            sessions: SessionStore::new(),
            cache,
            settings: RwLock::new(settings),
            default_device: RwLock::new(None),
            locked: AtomicBool::new(false),
            tamper_detected: AtomicBool::new(false),
        })
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn devices(&self) -> &[Arc<DeviceHandle>] {
        &self.devices
    }

    pub fn loads(&self) -> &[Arc<DeviceLoad>] {
        &self.loads
    }

    pub fn cache(&self) -> &Arc<KeyCache> {
        &self.cache
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn settings(&self) -> MuxSettings {
        self.settings.read().clone()
    }

    pub fn update_settings(&self, update: impl FnOnce(&mut MuxSettings)) {
        update(&mut *self.settings.write());
    }

    pub fn default_device(&self) -> Option<usize> {
        *self.default_device.read()
    }

    /// Device pinned on every session opened from now on.
    pub fn set_default_device(&self, device: Option<usize>) -> MuxResult<()> {
        if let Some(index) = device
            && index >= self.devices.len()
        {
            return Err(MuxError::invalid(format!(
                "device index {index} out of range ({} devices)",
                self.devices.len()
            )));
        }
        *self.default_device.write() = device;
        info!(device = ?device, "default device changed");
        Ok(())
    }

    pub fn device_states(&self) -> Vec<DeviceState> {
        self.loads.iter().map(|load| load.state()).collect()
    }

    pub fn open_session(&self, from_ethernet: bool) -> ClientHandle {
        let defaults = SessionDefaults {
            pinned_device: self.default_device(),
            allow_exportable_private_keys: self.settings.read().enable_exportable_private_keys,
        };
        self.sessions.create(from_ethernet, defaults)
    }

    /// Drops the session and logs its handle out of every device.
    pub async fn close_session(&self, client: ClientHandle) {
        let Some(session) = self.sessions.remove(client) else {
            return;
        };
        let routes: Vec<_> = session.lock().key_op_routes.drain().collect();
        for (_, route) in routes {
            if let Some(load) = self.loads.get(route.device_index) {
                load.decrement(OPEN_HANDLE_WEIGHT);
            }
        }
        let mut logout = PacketWriter::new();
        logout.u32(RpcFunc::Logout.code()).u32(client);
        let logout = logout.finish();
        for device in &self.devices {
            if let Err(err) = device.send(logout.clone(), client).await {
                debug!(device = device.index(), "logout on disconnect failed: {err}");
            }
        }
    }

    pub fn lock(&self) {
        self.locked.store(true, Ordering::SeqCst);
        for load in &self.loads {
            load.change_state(DeviceState::Locked);
        }
        info!("router locked");
    }

    pub fn unlock(&self) {
        self.locked.store(false, Ordering::SeqCst);
        for load in &self.loads {
            load.unlock();
        }
        info!("router unlocked");
    }

    /// Untrusted connections are refused while this holds.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
            || !self.cache.is_initialized()
            || !self.settings.read().master_key_set
    }

    /// Result code sent to connections refused while locked.
    pub fn rejection(&self) -> HalError {
        if self.settings.read().master_key_set {
            HalError::Forbidden
        } else {
            HalError::MasterKeyNotSet
        }
    }

    pub fn tamper_detected(&self) -> bool {
        self.tamper_detected.load(Ordering::SeqCst)
    }

    /// Start or end of a tamper event. Either edge leaves the router locked.
    pub fn on_tamper_event(&self, detected: bool) {
        if self.tamper_detected.swap(detected, Ordering::SeqCst) == detected {
            return;
        }
        self.locked.store(true, Ordering::SeqCst);
        if detected {
            error!("tamper detected; all devices disabled");
            for load in &self.loads {
                load.change_state(DeviceState::Tamper);
            }
        } else {
            warn!("tamper event ended; devices need to be checked and unlocked");
            for load in &self.loads {
                load.clear_tamper(DeviceState::TamperReset);
            }
        }
    }

    /// Serves one request from `client`. The reply always carries the client
    /// handle found in `request`.
    pub async fn handle(&self, client: ClientHandle, request: &[u8]) -> Bytes {
        let (code, caller) = match (wire::opcode(request), wire::client_handle(request)) {
            (Ok(code), Ok(caller)) => (code, caller),
            (code, _) => {
                warn!(client = format_args!("0x{client:x}"), len = request.len(), "short request");
                return wire::error_response(code.unwrap_or(0), 0, HalError::BadArguments);
            }
        };

        let reply = match self.route(code, client, request).await {
            Ok(reply) => reply,
            Err(err) => {
                debug!(client = format_args!("0x{client:x}"), code, ?err, "request refused");
                wire::error_response(code, client, err)
            }
        };
        wire::with_client_handle(&reply, caller)
            .unwrap_or_else(|_| wire::error_response(code, caller, HalError::RpcTransport))
    }

    async fn route(&self, code: u32, client: ClientHandle, request: &[u8]) -> Reply {
        let session = self.sessions.get(client).ok_or(HalError::BadArguments)?;
        let from_ethernet = session.lock().from_ethernet;
        if from_ethernet && self.tamper_detected() {
            return Err(HalError::Tamper);
        }
        let Some(func) = RpcFunc::from_code(code) else {
            warn!(code, "unknown operation code");
            return Err(HalError::BadArguments);
        };
        metrics::counter!("hsm_mux_requests_total", "operation" => func.name()).increment(1);

        let request =
            wire::with_client_handle(request, client).map_err(|_| HalError::BadArguments)?;
        match Route::of(func) {
            Route::Any => self.any_device(client, &session, request).await,
            Route::All => self.all_devices(func, client, &session, request).await,
            Route::HashStart => self.hash_start(client, &session, request).await,
            Route::Hash => self.hash_op(client, &session, request, false).await,
            Route::HashEnd => self.hash_op(client, &session, request, true).await,
            Route::PkeyOpen => self.pkey_open(client, &session, request).await,
            Route::Pkey => self.pkey_op(func, client, &session, request).await,
            Route::KeyCreate => self.key_create(func, client, &session, request).await,
            Route::PkeyMatch => self.key_match(client, &session, request).await,
            Route::PkeyExport => self.pkey_export(client, &session, request).await,
            Route::UseCurrent => self.use_current(client, &session, request).await,
            Route::SessionSetting => self.session_setting(func, client, &session, &request),
            Route::DeviceState => Ok(self.device_state_reply(code, client)),
            Route::DeviceIp => Ok(self.device_ip_reply(code, client)),
        }
    }

    /// Pinned device, else the balancer's choice.
    fn pick_device(&self, pinned: Option<usize>) -> Result<usize, HalError> {
        match pinned {
            Some(device) => Ok(device),
            None => self.balancer.choose(&self.loads).ok_or_else(|| {
                warn!("no usable device");
                HalError::NotReady
            }),
        }
    }

    /// One round trip. Replies for a different operation, including the
    /// transport failure marker, become `RpcTransport`.
    async fn call(&self, device: usize, client: ClientHandle, request: Bytes) -> Reply {
        let handle = self.devices.get(device).ok_or(HalError::BadArguments)?;
        let code = wire::opcode(&request).map_err(|_| HalError::BadArguments)?;
        let reply = handle.round_trip(client, request).await;
        match wire::opcode(&reply) {
            Ok(reply_code) if reply_code == code && reply.len() >= wire::RESULT_OFFSET + 4 => Ok(reply),
            Ok(TRANSPORT_FAILURE_CODE) => {
                warn!(device, code, "transport failure");
                Err(HalError::RpcTransport)
            }
            other => {
                warn!(device, code, reply = ?other.ok(), "mismatched reply");
                Err(HalError::RpcTransport)
            }
        }
    }

    async fn any_device(&self, client: ClientHandle, session: &SharedSession, request: Bytes) -> Reply {
        let pinned = session.lock().pinned_device;
        let device = self.pick_device(pinned)?;
        self.call(device, client, request).await
    }

    /// Pinned device only, else each device exactly once. The first failure
    /// wins; idempotent broadcasts still reach every device.
    async fn all_devices(
        &self,
        func: RpcFunc,
        client: ClientHandle,
        session: &SharedSession,
        request: Bytes,
    ) -> Reply {
        let pinned = session.lock().pinned_device;
        if let Some(device) = pinned {
            return self.call(device, client, request).await;
        }
        if self.devices.is_empty() {
            return Err(HalError::NotReady);
        }

        let code = func.code();
        let mut first_reply = None;
        let mut failure = None;
        for device in 0..self.devices.len() {
            let status = match self.call(device, client, request.clone()).await {
                Ok(reply) => {
                    let status = result_of(&reply)?;
                    if status == HalError::Ok.code() && first_reply.is_none() {
                        first_reply = Some(reply);
                    }
                    status
                }
                Err(err) => err.code(),
            };
            if status != HalError::Ok.code() {
                debug!(device, code, status, "broadcast failed on device");
                failure.get_or_insert(status);
                if !Route::is_idempotent_broadcast(func) {
                    break;
                }
            }
        }

        match failure {
            Some(status) => Ok(wire::status_response(code, client, status)),
            None => first_reply.ok_or(HalError::RpcTransport),
        }
    }

    async fn hash_start(&self, client: ClientHandle, session: &SharedSession, request: Bytes) -> Reply {
        let pinned = session.lock().pinned_device;
        let device = self.pick_device(pinned)?;
        let reply = self.call(device, client, request).await?;
        if result_of(&reply)? == HalError::Ok.code() {
            let handle = wire::read_u32_at(&reply, 12).map_err(|_| HalError::RpcTransport)?;
            session.lock().hash_op_routes.insert(handle, device);
        }
        Ok(reply)
    }

    async fn hash_op(
        &self,
        client: ClientHandle,
        session: &SharedSession,
        request: Bytes,
        finalize: bool,
    ) -> Reply {
        let handle = wire::read_u32_at(&request, 8).map_err(|_| HalError::BadArguments)?;
        let device = session
            .lock()
            .hash_op_routes
            .get(&handle)
            .copied()
            .ok_or(HalError::BadArguments)?;
        let reply = self.call(device, client, request).await?;
        if finalize {
            session.lock().hash_op_routes.remove(&handle);
        }
        Ok(reply)
    }

    async fn use_current(&self, client: ClientHandle, session: &SharedSession, request: Bytes) -> Reply {
        let device = session.lock().current_device().ok_or(HalError::Impossible)?;
        self.call(device, client, request).await
    }

    fn session_setting(
        &self,
        func: RpcFunc,
        client: ClientHandle,
        session: &SharedSession,
        request: &[u8],
    ) -> Reply {
        let mut session = session.lock();
        if session.from_ethernet {
            warn!(client = format_args!("0x{client:x}"), %func, "session setting refused for untrusted connection");
            return Err(HalError::Forbidden);
        }
        match func {
            RpcFunc::SetRpcDevice => {
                let index = wire::read_u32_at(request, 8).map_err(|_| HalError::BadArguments)?;
                if index == AUTO_DEVICE {
                    session.pinned_device = None;
                } else if (index as usize) < self.devices.len() {
                    session.pinned_device = Some(index as usize);
                } else {
                    return Err(HalError::BadArguments);
                }
                info!(client = format_args!("0x{client:x}"), device = ?session.pinned_device, "session device set");
            }
            RpcFunc::EnableCacheKeygen => session.cache_generated_keys = true,
            RpcFunc::DisableCacheKeygen => session.cache_generated_keys = false,
            RpcFunc::UseIncomingDeviceUuids => session.incoming_ids_are_device_ids = true,
            RpcFunc::UseIncomingMasterUuids => session.incoming_ids_are_device_ids = false,
            _ => return Err(HalError::BadArguments),
        }
        Ok(wire::error_response(func.code(), client, HalError::Ok))
    }

    fn device_state_reply(&self, code: u32, client: ClientHandle) -> Bytes {
        let mut writer = PacketWriter::new();
        writer
            .u32(code)
            .u32(client)
            .u32(HalError::Ok.code())
            .u32(self.loads.len() as u32);
        for load in &self.loads {
            writer.opaque(load.state().description().as_bytes());
        }
        writer.finish()
    }

    fn device_ip_reply(&self, code: u32, client: ClientHandle) -> Bytes {
        let ip = self.settings.read().advertised_ip.clone();
        let mut writer = PacketWriter::new();
        writer
            .u32(code)
            .u32(client)
            .u32(HalError::Ok.code())
            .opaque(ip.as_bytes());
        writer.finish()
    }
}
