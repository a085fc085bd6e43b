#![allow(dead_code)]

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use hsm_mux_core::{
    DeviceHandle, DeviceTransport, HalError, KeyCache, MuxError, MuxResult, MuxSettings, Router,
    RpcFunc,
    wire::{self, PacketReader, PacketWriter},
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Caller-side client handle used in every request; the router must hand it
/// back untouched.
pub const CALLER: u32 = 0x5151;

#[derive(Default)]
struct DeviceKeys {
    keys: BTreeMap<Uuid, u32>,
    open: HashMap<u32, Uuid>,
    hashes: HashSet<u32>,
    next_handle: u32,
    requests: Vec<Bytes>,
    broadcast_status: u32,
}

/// In-memory stand-in for one physical device. Replies carry the device index
/// where the protocol leaves room for a payload.
pub struct MockDevice {
    pub index: usize,
    keys: Mutex<DeviceKeys>,
    tx: mpsc::UnboundedSender<MuxResult<Bytes>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MuxResult<Bytes>>>,
}

impl MockDevice {
    pub fn new(index: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            index,
            keys: Mutex::new(DeviceKeys {
                next_handle: 100,
                ..DeviceKeys::default()
            }),
            tx,
            rx: tokio::sync::Mutex::new(rx),
        })
    }

    /// Stores a key directly, as if created before the router started.
    pub fn insert_key(&self, flags: u32) -> Uuid {
        let id = Uuid::new_v4();
        self.keys.lock().keys.insert(id, flags);
        id
    }

    pub fn has_key(&self, id: &Uuid) -> bool {
        self.keys.lock().keys.contains_key(id)
    }

    pub fn open_handles(&self) -> usize {
        self.keys.lock().open.len()
    }

    pub fn requests(&self) -> Vec<Bytes> {
        self.keys.lock().requests.clone()
    }

    pub fn requests_for(&self, func: RpcFunc) -> Vec<Bytes> {
        self.requests()
            .into_iter()
            .filter(|packet| wire::opcode(packet).ok() == Some(func.code()))
            .collect()
    }

    /// Result code returned by login-style broadcast operations.
    pub fn set_broadcast_status(&self, status: u32) {
        self.keys.lock().broadcast_status = status;
    }

    pub fn break_connection(&self) {
        let _ = self.tx.send(Err(MuxError::transport("cable pulled")));
    }

    fn respond(&self, request: &[u8]) -> MuxResult<Bytes> {
        let code = wire::opcode(request)?;
        let client = wire::client_handle(request)?;
        let mut state = self.keys.lock();
        state.requests.push(Bytes::copy_from_slice(request));

        let ok = HalError::Ok.code();
        let mut reply = PacketWriter::new();
        reply.u32(code).u32(client);
        let Some(func) = RpcFunc::from_code(code) else {
            reply.u32(HalError::BadArguments.code());
            return Ok(reply.finish());
        };

        match func {
            RpcFunc::GetVersion | RpcFunc::GetRandom | RpcFunc::CheckTamper | RpcFunc::PkeyExport => {
                reply.u32(ok).u32(self.index as u32);
            }
            RpcFunc::SetPin | RpcFunc::Login | RpcFunc::Logout | RpcFunc::LogoutAll
            | RpcFunc::IsLoggedIn => {
                reply.u32(state.broadcast_status);
            }
            RpcFunc::HashInitialize => {
                let handle = next_handle(&mut state);
                state.hashes.insert(handle);
                reply.u32(ok).u32(handle);
            }
            RpcFunc::HashUpdate | RpcFunc::HashGetAlgorithm | RpcFunc::HashFinalize => {
                let handle = wire::read_u32_at(request, 8)?;
                let known = if func == RpcFunc::HashFinalize {
                    state.hashes.remove(&handle)
                } else {
                    state.hashes.contains(&handle)
                };
                if known {
                    reply.u32(ok).u32(self.index as u32);
                } else {
                    reply.u32(HalError::BadArguments.code());
                }
            }
            RpcFunc::PkeyGenerateRsa
            | RpcFunc::PkeyGenerateEc
            | RpcFunc::PkeyGenerateHashsig
            | RpcFunc::PkeyLoad
            | RpcFunc::PkeyImport => {
                let id = Uuid::new_v4();
                state.keys.insert(id, 0);
                let handle = next_handle(&mut state);
                state.open.insert(handle, id);
                reply.u32(ok).u32(handle).uuid(&id);
            }
            RpcFunc::PkeyOpen => {
                let mut reader = PacketReader::after_header(request)?;
                reader.u32()?;
                let id = reader.uuid()?;
                if state.keys.contains_key(&id) {
                    let handle = next_handle(&mut state);
                    state.open.insert(handle, id);
                    reply.u32(ok).u32(handle);
                } else {
                    reply.u32(HalError::KeyNotFound.code());
                }
            }
            RpcFunc::PkeyMatch => {
                let (result_max, start) = match_bounds(request)?;
                let ids: Vec<Uuid> = state
                    .keys
                    .keys()
                    .filter(|id| start.is_nil() || **id > start)
                    .take(result_max)
                    .copied()
                    .collect();
                reply.u32(ok).u32(0).u32(ids.len() as u32);
                for id in &ids {
                    reply.uuid(id);
                }
            }
            _ => {
                let handle = wire::read_u32_at(request, 8)?;
                match state.open.get(&handle).copied() {
                    Some(id) => {
                        if func == RpcFunc::PkeyClose {
                            state.open.remove(&handle);
                        } else if func == RpcFunc::PkeyDelete {
                            state.open.remove(&handle);
                            state.keys.remove(&id);
                        }
                        reply.u32(ok).u32(self.index as u32);
                    }
                    None => {
                        reply.u32(HalError::BadArguments.code());
                    }
                }
            }
        }
        Ok(reply.finish())
    }
}

fn next_handle(state: &mut DeviceKeys) -> u32 {
    state.next_handle += 1;
    state.next_handle
}

fn match_bounds(request: &[u8]) -> MuxResult<(usize, Uuid)> {
    let mut reader = PacketReader::after_header(request)?;
    for _ in 0..5 {
        reader.u32()?;
    }
    let attributes = reader.u32()?;
    for _ in 0..attributes {
        reader.u32()?;
        reader.opaque()?;
    }
    reader.u32()?;
    let result_max = reader.u32()? as usize;
    Ok((result_max, reader.uuid()?))
}

#[async_trait]
impl DeviceTransport for MockDevice {
    fn describe(&self) -> String {
        format!("mock-{}", self.index)
    }

    async fn write_packet(&self, packet: Bytes) -> MuxResult<()> {
        let reply = self.respond(&packet)?;
        let _ = self.tx.send(Ok(reply));
        Ok(())
    }

    async fn read_packet(&self) -> MuxResult<Bytes> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .unwrap_or_else(|| Err(MuxError::transport("mock closed")))
    }
}

pub struct Pool {
    pub router: Arc<Router>,
    pub devices: Vec<Arc<MockDevice>>,
}

impl Pool {
    pub fn new(count: usize) -> Self {
        Self::with_settings(count, MuxSettings::default())
    }

    pub fn with_settings(count: usize, settings: MuxSettings) -> Self {
        let devices: Vec<_> = (0..count).map(MockDevice::new).collect();
        let handles = devices
            .iter()
            .map(|device| DeviceHandle::spawn(device.index, device.clone()))
            .collect();
        let cache = Arc::new(KeyCache::new(count));
        cache.mark_initialized();
        let router = Router::new(handles, cache, settings).expect("router");
        Self {
            router: Arc::new(router),
            devices,
        }
    }

    pub fn cache(&self) -> &KeyCache {
        self.router.cache()
    }

    /// Trusted session pinned to `device`.
    pub async fn pinned_session(&self, device: u32) -> u32 {
        let client = self.router.open_session(false);
        let reply = self.router.handle(client, &set_device(device)).await;
        assert_eq!(status(&reply), HalError::Ok.code());
        client
    }
}

pub fn status(reply: &[u8]) -> u32 {
    wire::result_code(reply).expect("result code")
}

/// Fourth word of a reply: a handle, or the serving device for mock replies.
pub fn payload(reply: &[u8]) -> u32 {
    wire::read_u32_at(reply, 12).expect("payload")
}

pub fn simple(func: RpcFunc, args: &[u32]) -> Bytes {
    let mut writer = PacketWriter::new();
    writer.u32(func.code()).u32(CALLER);
    for arg in args {
        writer.u32(*arg);
    }
    writer.finish()
}

pub fn set_device(index: u32) -> Bytes {
    simple(RpcFunc::SetRpcDevice, &[index])
}

pub fn generate_ec(flags: u32) -> Bytes {
    simple(RpcFunc::PkeyGenerateEc, &[0, 2, flags])
}

pub fn generate_rsa(flags: u32) -> Bytes {
    let mut writer = PacketWriter::new();
    writer
        .u32(RpcFunc::PkeyGenerateRsa.code())
        .u32(CALLER)
        .u32(0)
        .u32(2048)
        .opaque(&[0x01, 0x00, 0x01])
        .u32(flags);
    writer.finish()
}

pub fn load_key(flags: u32) -> Bytes {
    let mut writer = PacketWriter::new();
    writer
        .u32(RpcFunc::PkeyLoad.code())
        .u32(CALLER)
        .u32(0)
        .opaque(b"public key der")
        .u32(flags);
    writer.finish()
}

pub fn open(id: &Uuid) -> Bytes {
    let mut writer = PacketWriter::new();
    writer.u32(RpcFunc::PkeyOpen.code()).u32(CALLER).u32(0).uuid(id);
    writer.finish()
}

pub fn key_match(start: &Uuid, result_max: u32) -> Bytes {
    let mut writer = PacketWriter::new();
    writer
        .u32(RpcFunc::PkeyMatch.code())
        .u32(CALLER)
        .u32(0)
        .u32(0)
        .u32(0)
        .u32(0)
        .u32(0)
        .u32(1)
        .u32(0x100)
        .opaque(b"label")
        .u32(0)
        .u32(result_max)
        .uuid(start);
    writer.finish()
}

/// `(handle, key id)` from a key creation reply.
pub fn created(reply: &[u8]) -> (u32, Uuid) {
    let mut reader = PacketReader::new(reply);
    reader.skip(12).expect("header");
    let handle = reader.u32().expect("handle");
    (handle, reader.uuid().expect("uuid"))
}

/// Master ids from a key match reply.
pub fn matched(reply: &[u8]) -> Vec<Uuid> {
    let mut reader = PacketReader::new(reply);
    reader.skip(16).expect("header");
    let count = reader.u32().expect("count");
    (0..count).map(|_| reader.uuid().expect("uuid")).collect()
}
