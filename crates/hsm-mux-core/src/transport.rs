//! Device handles: one connection to one physical device, a background reader
//! loop, and per-client inboxes that receive exactly the replies addressed to
//! that client.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, warn};

use crate::{
    device::{DeviceLoad, DeviceState},
    error::{MuxError, MuxResult},
    protocol::{HalError, TRANSPORT_FAILURE_CODE},
    session::ClientHandle,
    wire,
};

/// Framed packet connection to one device.
///
/// `read_packet` is only ever called from the handle's reader loop, while
/// `write_packet` may be called from many workers at once.
#[async_trait]
pub trait DeviceTransport: Send + Sync + 'static {
    fn describe(&self) -> String;
    async fn write_packet(&self, packet: Bytes) -> MuxResult<()>;
    async fn read_packet(&self) -> MuxResult<Bytes>;
}

/// Reply synthesized for waiters when the device connection is lost.
pub fn transport_failure(client: ClientHandle) -> Bytes {
    wire::error_response(TRANSPORT_FAILURE_CODE, client, HalError::RpcTransport)
}

pub fn is_transport_failure(packet: &[u8]) -> bool {
    wire::opcode(packet).is_ok_and(|code| code == TRANSPORT_FAILURE_CODE)
}

#[derive(Default)]
struct Inboxes {
    alive: bool,
    senders: HashMap<ClientHandle, mpsc::UnboundedSender<Bytes>>,
}

/// Receiving end registered by one client on one device.
#[derive(Debug)]
pub struct Inbox {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl Inbox {
    /// Next reply; a transport failure packet once the device is gone.
    pub async fn recv(&mut self, client: ClientHandle) -> Bytes {
        self.rx
            .recv()
            .await
            .unwrap_or_else(|| transport_failure(client))
    }
}

pub struct DeviceHandle {
    index: usize,
    name: String,
    transport: Arc<dyn DeviceTransport>,
    inboxes: Arc<Mutex<Inboxes>>,
    load: Arc<DeviceLoad>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("state", &self.load.state())
            .finish()
    }
}

impl DeviceHandle {
    /// Wraps `transport` and starts its reader loop. Must be called from
    /// within a tokio runtime.
    pub fn spawn(index: usize, transport: Arc<dyn DeviceTransport>) -> Arc<Self> {
        Self::spawn_with_load(index, transport, Arc::new(DeviceLoad::new(index)))
    }

    pub fn spawn_with_load(
        index: usize,
        transport: Arc<dyn DeviceTransport>,
        load: Arc<DeviceLoad>,
    ) -> Arc<Self> {
        let name = transport.describe();
        let inboxes = Arc::new(Mutex::new(Inboxes {
            alive: true,
            senders: HashMap::new(),
        }));
        let reader = tokio::spawn(reader_loop(
            index,
            Arc::clone(&transport),
            Arc::clone(&inboxes),
            Arc::clone(&load),
        ));
        Arc::new(Self {
            index,
            name,
            transport,
            inboxes,
            load,
            reader: Mutex::new(Some(reader)),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn load(&self) -> &Arc<DeviceLoad> {
        &self.load
    }

    pub fn is_alive(&self) -> bool {
        self.inboxes.lock().alive
    }

    /// Replaces any inbox already registered for `client`. On a dead device
    /// the inbox immediately holds a transport failure.
    pub fn register_inbox(&self, client: ClientHandle) -> Inbox {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inboxes = self.inboxes.lock();
        if inboxes.alive {
            inboxes.senders.insert(client, tx);
        } else {
            let _ = tx.send(transport_failure(client));
        }
        Inbox { rx }
    }

    pub fn unregister_inbox(&self, client: ClientHandle) {
        self.inboxes.lock().senders.remove(&client);
    }

    pub async fn send(&self, packet: Bytes, client: ClientHandle) -> MuxResult<()> {
        if !self.is_alive() {
            return Err(MuxError::transport(format!("device {} is disconnected", self.name)));
        }
        debug!(device = self.index, client = format_args!("0x{client:x}"), len = packet.len(), "send");
        self.transport.write_packet(packet).await.inspect_err(|err| {
            warn!(device = self.index, "write to {} failed: {err}", self.name);
            self.load.change_state(DeviceState::NotReady);
        })
    }

    /// Sends `packet` and waits for the reply addressed to `client`. Transport
    /// problems come back as a transport failure packet.
    pub async fn round_trip(&self, client: ClientHandle, packet: Bytes) -> Bytes {
        let mut inbox = self.register_inbox(client);
        let reply = match self.send(packet, client).await {
            Ok(()) => inbox.recv(client).await,
            Err(_) => transport_failure(client),
        };
        self.unregister_inbox(client);
        reply
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}

async fn reader_loop(
    index: usize,
    transport: Arc<dyn DeviceTransport>,
    inboxes: Arc<Mutex<Inboxes>>,
    load: Arc<DeviceLoad>,
) {
    loop {
        match transport.read_packet().await {
            Ok(packet) => {
                let client = match wire::client_handle(&packet) {
                    Ok(client) => client,
                    Err(err) => {
                        warn!(device = index, "discarding reply: {err}");
                        continue;
                    }
                };
                let sender = inboxes.lock().senders.get(&client).cloned();
                match sender {
                    Some(tx) => {
                        let _ = tx.send(packet);
                    }
                    None => debug!(
                        device = index,
                        client = format_args!("0x{client:x}"),
                        "no inbox for reply"
                    ),
                }
            }
            Err(err) => {
                error!(device = index, "device connection {} lost: {err}", transport.describe());
                metrics::counter!("hsm_mux_transport_failures_total", "device" => index.to_string())
                    .increment(1);
                load.change_state(DeviceState::NotReady);
                let mut inboxes = inboxes.lock();
                inboxes.alive = false;
                for (client, tx) in inboxes.senders.drain() {
                    let _ = tx.send(transport_failure(client));
                }
                return;
            }
        }
    }
}
