use bytes::{Bytes, BytesMut};
use tracing::{info, warn};

use super::{BusyGuard, KEYGEN_WEIGHT, OPEN_HANDLE_WEIGHT, Reply, Router, result_of};
use crate::{
    error::MuxResult,
    protocol::{HalError, KeyType, RpcFunc, key_flags},
    session::{ClientHandle, KeyRoute, SharedSession},
    wire::{self, PacketReader, PacketWriter},
};

/// Offset of the flags word in a key creation request.
fn flags_offset(func: RpcFunc, request: &[u8]) -> MuxResult<Option<usize>> {
    let mut reader = PacketReader::after_header(request)?;
    reader.u32()?; // pkcs11 session
    match func {
        RpcFunc::PkeyGenerateRsa => {
            reader.u32()?; // key length
            reader.opaque()?; // public exponent
        }
        RpcFunc::PkeyGenerateEc => {
            reader.u32()?; // curve
        }
        RpcFunc::PkeyGenerateHashsig => {
            reader.u32()?; // levels
            reader.u32()?; // lms type
            reader.u32()?; // lmots type
        }
        RpcFunc::PkeyLoad => {
            reader.opaque()?; // der
        }
        RpcFunc::PkeyImport => {
            reader.u32()?; // kekek handle
            reader.opaque()?; // pkcs8
            reader.opaque()?; // kek
        }
        _ => return Ok(None),
    }
    Ok(Some(reader.position()))
}

fn wants_exportable(flags: u32) -> bool {
    flags & (key_flags::USAGE_KEY_ENCIPHERMENT | key_flags::USAGE_DATA_ENCIPHERMENT) == 0
}

impl Router {
    pub(super) async fn pkey_open(
        &self,
        client: ClientHandle,
        session: &SharedSession,
        request: Bytes,
    ) -> Reply {
        let code = RpcFunc::PkeyOpen.code();
        let mut reader = PacketReader::after_header(&request).map_err(|_| HalError::BadArguments)?;
        let pkcs11_session = reader.u32().map_err(|_| HalError::BadArguments)?;
        let incoming = reader.uuid().map_err(|_| HalError::BadArguments)?;

        let (pinned, device_ids) = {
            let session = session.lock();
            (session.pinned_device, session.incoming_ids_are_device_ids)
        };

        let (device, device_key_id, master_key_id) = if device_ids {
            let Some(device) = pinned else {
                info!(client = format_args!("0x{client:x}"), "device id open without a pinned device");
                return Err(HalError::Impossible);
            };
            (device, incoming, self.cache.lookup_master(device, &incoming))
        } else {
            let locations = self.cache.locations_of(&incoming);
            if locations.is_empty() {
                info!(master = %incoming, "open of unknown master id");
                return Err(HalError::KeyNotFound);
            }
            match pinned {
                Some(device) => {
                    let Some(device_key_id) = locations.get(&device).copied() else {
                        info!(master = %incoming, device, "key not present on pinned device");
                        return Err(HalError::KeyNotFound);
                    };
                    (device, device_key_id, Some(incoming))
                }
                None => {
                    let (device, device_key_id) = self
                        .balancer
                        .choose_from(&self.loads, &locations)
                        .ok_or(HalError::NotReady)?;
                    (device, device_key_id, Some(incoming))
                }
            }
        };

        let mut rebuilt = PacketWriter::new();
        rebuilt
            .u32(code)
            .u32(client)
            .u32(pkcs11_session)
            .uuid(&device_key_id);
        session.lock().set_current_key(device, None, device_key_id);

        let reply = self.call(device, client, rebuilt.finish()).await?;
        if result_of(&reply)? != HalError::Ok.code() {
            return Ok(reply);
        }
        let handle = wire::read_u32_at(&reply, 12).map_err(|_| HalError::RpcTransport)?;
        {
            let mut session = session.lock();
            session.key_op_routes.insert(
                handle,
                KeyRoute {
                    device_index: device,
                    device_key_id,
                    master_key_id,
                },
            );
            session.set_current_key(device, Some(handle), device_key_id);
        }
        self.loads[device].increment(OPEN_HANDLE_WEIGHT);
        Ok(reply)
    }

    pub(super) async fn pkey_op(
        &self,
        func: RpcFunc,
        client: ClientHandle,
        session: &SharedSession,
        request: Bytes,
    ) -> Reply {
        let handle = wire::read_u32_at(&request, 8).map_err(|_| HalError::BadArguments)?;
        let route = {
            let mut session = session.lock();
            let route = session
                .key_op_routes
                .get(&handle)
                .copied()
                .ok_or(HalError::BadArguments)?;
            session.set_current_key(route.device_index, Some(handle), route.device_key_id);
            route
        };

        let reply = self.call(route.device_index, client, request).await?;
        let closes = matches!(func, RpcFunc::PkeyClose | RpcFunc::PkeyDelete);
        if closes && result_of(&reply)? == HalError::Ok.code() {
            self.loads[route.device_index].decrement(OPEN_HANDLE_WEIGHT);
            if func == RpcFunc::PkeyDelete {
                self.cache
                    .remove_key_on_device(route.device_index, &route.device_key_id);
            }
            let mut session = session.lock();
            session.key_op_routes.remove(&handle);
            session.current_key_op = None;
        }
        Ok(reply)
    }

    pub(super) async fn pkey_export(
        &self,
        client: ClientHandle,
        session: &SharedSession,
        request: Bytes,
    ) -> Reply {
        let from_ethernet = session.lock().from_ethernet;
        if from_ethernet && !self.settings.read().enable_key_export {
            warn!(client = format_args!("0x{client:x}"), "key export disabled");
            return Err(HalError::Forbidden);
        }
        self.use_current(client, session, request).await
    }

    /// Generate, load or import. The new key is cached unless the session
    /// opted out, and the reply carries the id the session addresses keys by.
    pub(super) async fn key_create(
        &self,
        func: RpcFunc,
        client: ClientHandle,
        session: &SharedSession,
        request: Bytes,
    ) -> Reply {
        let code = func.code();
        let offset = flags_offset(func, &request)
            .map_err(|_| HalError::BadArguments)?
            .ok_or(HalError::BadArguments)?;
        let mut flags = wire::read_u32_at(&request, offset).map_err(|_| HalError::BadArguments)?;

        let generated = KeyType::generated_by(func);
        let (pinned, allow_exportable, key_type) = {
            let mut session = session.lock();
            let key_type = match (generated, session.last_key_type) {
                (Some(generated), _) => generated,
                (None, Some(last)) if flags & key_flags::PUBLIC != 0 => {
                    last.public_counterpart().unwrap_or(last)
                }
                (None, Some(last)) => last,
                (None, None) => KeyType::None,
            };
            session.last_key_type = Some(key_type);
            (
                session.pinned_device,
                session.allow_exportable_private_keys,
                key_type,
            )
        };

        let mut outgoing = BytesMut::from(&request[..]);
        if generated.is_some() && allow_exportable && wants_exportable(flags) {
            flags |= key_flags::EXPORTABLE;
            wire::write_u32_at(&mut outgoing, offset, flags)
                .map_err(|_| HalError::BadArguments)?;
        }

        let device = self.pick_device(pinned)?;
        let load = self.loads.get(device).ok_or(HalError::BadArguments)?;
        let reply = {
            let _busy = BusyGuard::new(load, KEYGEN_WEIGHT);
            self.call(device, client, outgoing.freeze()).await?
        };
        let status = result_of(&reply)?;
        if status != HalError::Ok.code() {
            return Ok(wire::status_response(code, client, status));
        }

        let mut reader = PacketReader::new(&reply);
        reader.skip(12).map_err(|_| HalError::RpcTransport)?;
        let handle = reader.u32().map_err(|_| HalError::RpcTransport)?;
        let device_key_id = reader.uuid().map_err(|_| HalError::RpcTransport)?;
        load.increment(OPEN_HANDLE_WEIGHT);

        let (cache_keys, device_ids) = {
            let session = session.lock();
            (session.cache_generated_keys, session.incoming_ids_are_device_ids)
        };
        let master_key_id = if cache_keys {
            let master = self
                .cache
                .add_key(device, device_key_id, key_type.code(), flags, None)
                .map_err(|err| {
                    warn!(device, key = %device_key_id, "caching new key failed: {err}");
                    HalError::AllocationFailure
                })?;
            Some(master)
        } else {
            None
        };

        {
            let mut session = session.lock();
            session.key_op_routes.insert(
                handle,
                KeyRoute {
                    device_index: device,
                    device_key_id,
                    master_key_id,
                },
            );
            session.set_current_key(device, Some(handle), device_key_id);
        }
        info!(
            %func,
            device,
            key = %device_key_id,
            master = ?master_key_id,
            key_type = ?key_type,
            flags = format_args!("0x{flags:x}"),
            "key created"
        );

        let reported = match master_key_id {
            Some(master) if !device_ids => master,
            _ => device_key_id,
        };
        let mut writer = PacketWriter::new();
        writer
            .u32(code)
            .u32(client)
            .u32(HalError::Ok.code())
            .u32(handle)
            .uuid(&reported);
        Ok(writer.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rsa_flags_follow_padded_exponent() {
        let mut writer = PacketWriter::new();
        writer
            .u32(RpcFunc::PkeyGenerateRsa.code())
            .u32(1)
            .u32(0)
            .u32(2048)
            .opaque(&[1, 0, 1])
            .u32(key_flags::USAGE_DIGITAL_SIGNATURE);
        let request = writer.finish();
        assert_eq!(
            flags_offset(RpcFunc::PkeyGenerateRsa, &request).expect("offset"),
            Some(20 + 4)
        );
    }

    #[test]
    fn fixed_layout_offsets() {
        let request = Bytes::from(vec![0u8; 64]);
        assert_eq!(flags_offset(RpcFunc::PkeyGenerateEc, &request).expect("ec"), Some(16));
        assert_eq!(
            flags_offset(RpcFunc::PkeyGenerateHashsig, &request).expect("hashsig"),
            Some(24)
        );
        assert_eq!(flags_offset(RpcFunc::PkeySign, &request).expect("sign"), None);
    }

    #[test]
    fn encipherment_keys_are_never_made_exportable() {
        assert!(wants_exportable(key_flags::USAGE_DIGITAL_SIGNATURE));
        assert!(!wants_exportable(key_flags::USAGE_KEY_ENCIPHERMENT));
        assert!(!wants_exportable(
            key_flags::USAGE_DATA_ENCIPHERMENT | key_flags::USAGE_DIGITAL_SIGNATURE
        ));
    }
}
