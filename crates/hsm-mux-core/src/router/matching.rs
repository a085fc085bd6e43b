use bytes::Bytes;
use tracing::debug;
use uuid::Uuid;

use super::{Reply, Router, result_of};
use crate::{
    error::MuxResult,
    protocol::{HalError, RpcFunc},
    session::{ClientHandle, SharedSession},
    wire::{self, PacketReader, PacketWriter},
};

/// Decoded key search request. `start` is the id to continue after, nil to
/// search from the beginning.
#[derive(Debug, Clone, PartialEq, Eq)]
struct MatchRequest {
    pkcs11_session: u32,
    key_type: u32,
    curve: u32,
    mask: u32,
    flags: u32,
    attributes: Vec<(u32, Bytes)>,
    status: u32,
    result_max: u32,
    start: Uuid,
}

impl MatchRequest {
    fn parse(request: &[u8]) -> MuxResult<Self> {
        let mut reader = PacketReader::after_header(request)?;
        let pkcs11_session = reader.u32()?;
        let key_type = reader.u32()?;
        let curve = reader.u32()?;
        let mask = reader.u32()?;
        let flags = reader.u32()?;
        let count = reader.u32()?;
        let mut attributes = Vec::new();
        for _ in 0..count {
            let kind = reader.u32()?;
            let value = Bytes::copy_from_slice(reader.opaque()?);
            attributes.push((kind, value));
        }
        Ok(Self {
            pkcs11_session,
            key_type,
            curve,
            mask,
            flags,
            attributes,
            status: reader.u32()?,
            result_max: reader.u32()?,
            start: reader.uuid()?,
        })
    }

    fn encode(&self, client: ClientHandle) -> Bytes {
        let mut writer = PacketWriter::new();
        writer
            .u32(RpcFunc::PkeyMatch.code())
            .u32(client)
            .u32(self.pkcs11_session)
            .u32(self.key_type)
            .u32(self.curve)
            .u32(self.mask)
            .u32(self.flags)
            .u32(self.attributes.len() as u32);
        for (kind, value) in &self.attributes {
            writer.u32(*kind).opaque(value);
        }
        writer
            .u32(self.status)
            .u32(self.result_max)
            .uuid(&self.start);
        writer.finish()
    }
}

/// `(pkcs11_session, device key ids)` from a device's match reply.
fn parse_match_reply(reply: &[u8]) -> MuxResult<(u32, Vec<Uuid>)> {
    let mut reader = PacketReader::new(reply);
    reader.skip(12)?;
    let pkcs11_session = reader.u32()?;
    let count = reader.u32()?;
    let mut ids = Vec::new();
    for _ in 0..count {
        ids.push(reader.uuid()?);
    }
    Ok((pkcs11_session, ids))
}

impl Router {
    /// Searches device by device, translating ids to master ids and reporting
    /// a replicated key only from its lowest-indexed location.
    pub(super) async fn key_match(
        &self,
        client: ClientHandle,
        session: &SharedSession,
        request: Bytes,
    ) -> Reply {
        let code = RpcFunc::PkeyMatch.code();
        let (pinned, device_ids, current) = {
            let session = session.lock();
            (
                session.pinned_device,
                session.incoming_ids_are_device_ids,
                session.current_device(),
            )
        };
        if device_ids {
            let device = current.ok_or(HalError::Impossible)?;
            return self.call(device, client, request).await;
        }

        let mut search = MatchRequest::parse(&request).map_err(|_| HalError::BadArguments)?;
        let mut device = if search.start.is_nil() {
            pinned.unwrap_or(0)
        } else {
            let (device, device_key_id) = match pinned {
                Some(device) => self
                    .cache
                    .locations_of(&search.start)
                    .get(&device)
                    .map(|key| (device, *key)),
                None => self.cache.lowest_device_for(&search.start),
            }
            .ok_or(HalError::KeyNotFound)?;
            search.start = device_key_id;
            device
        };

        let limit = search.result_max as usize;
        let mut pkcs11_session = search.pkcs11_session;
        let mut found = Vec::new();
        loop {
            let reply = self.call(device, client, search.encode(client)).await?;
            let status = result_of(&reply)?;
            if status != HalError::Ok.code() {
                return Ok(wire::status_response(code, client, status));
            }
            let (session_id, ids) =
                parse_match_reply(&reply).map_err(|_| HalError::RpcTransport)?;
            pkcs11_session = session_id;
            debug!(device, matches = ids.len(), "key match page");

            for device_key_id in ids {
                let Some(master) = self.cache.lookup_master(device, &device_key_id) else {
                    continue;
                };
                let owned = self
                    .cache
                    .lowest_device_for(&master)
                    .is_some_and(|(lowest, _)| lowest == device);
                if owned {
                    found.push(master);
                }
            }

            if found.len() >= limit || device + 1 >= self.devices.len() {
                break;
            }
            device += 1;
            search.start = Uuid::nil();
        }

        found.truncate(limit);
        let mut writer = PacketWriter::new();
        writer
            .u32(code)
            .u32(client)
            .u32(HalError::Ok.code())
            .u32(pkcs11_session)
            .u32(found.len() as u32);
        for master in &found {
            writer.uuid(master);
        }
        Ok(writer.finish())
    }
}
