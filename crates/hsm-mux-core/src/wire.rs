//! Minimal packet codec for the device RPC wire format.
//!
//! Every field is a big-endian `u32` except opaque fields, which are a `u32`
//! length followed by the bytes and zero padding up to a 4 byte boundary.
//! Every packet starts with `(operation_code, client_handle)`; replies add the
//! result code at offset 8.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::{
    error::{MuxError, MuxResult},
    protocol::HalError,
};

pub const CODE_OFFSET: usize = 0;
pub const CLIENT_OFFSET: usize = 4;
pub const RESULT_OFFSET: usize = 8;
pub const HEADER_LEN: usize = 8;

const UUID_LEN: usize = 16;

pub fn read_u32_at(packet: &[u8], offset: usize) -> MuxResult<u32> {
    let end = offset
        .checked_add(4)
        .ok_or_else(|| MuxError::malformed("offset overflow"))?;
    let mut field = packet
        .get(offset..end)
        .ok_or_else(|| MuxError::malformed(format!("packet too short for field at {offset}")))?;
    Ok(field.get_u32())
}

pub fn write_u32_at(packet: &mut [u8], offset: usize, value: u32) -> MuxResult<()> {
    let end = offset
        .checked_add(4)
        .ok_or_else(|| MuxError::malformed("offset overflow"))?;
    let mut field = packet
        .get_mut(offset..end)
        .ok_or_else(|| MuxError::malformed(format!("packet too short for field at {offset}")))?;
    field.put_u32(value);
    Ok(())
}

pub fn opcode(packet: &[u8]) -> MuxResult<u32> {
    read_u32_at(packet, CODE_OFFSET)
}

pub fn client_handle(packet: &[u8]) -> MuxResult<u32> {
    read_u32_at(packet, CLIENT_OFFSET)
}

pub fn result_code(packet: &[u8]) -> MuxResult<u32> {
    read_u32_at(packet, RESULT_OFFSET)
}

/// Returns a copy of `packet` with the client handle replaced.
pub fn with_client_handle(packet: &[u8], client: u32) -> MuxResult<Bytes> {
    let mut rewritten = BytesMut::from(packet);
    write_u32_at(&mut rewritten, CLIENT_OFFSET, client)?;
    Ok(rewritten.freeze())
}

/// Reply carrying only the header and a result code.
pub fn error_response(code: u32, client: u32, err: HalError) -> Bytes {
    status_response(code, client, err.code())
}

/// Like [`error_response`] for result codes reported by a device.
pub fn status_response(code: u32, client: u32, status: u32) -> Bytes {
    let mut writer = PacketWriter::new();
    writer.u32(code).u32(client).u32(status);
    writer.finish()
}

fn padded(len: usize) -> usize {
    (len + 3) & !3
}

/// Sequential field reader over a borrowed packet.
#[derive(Debug, Clone)]
pub struct PacketReader<'a> {
    packet: &'a [u8],
    rest: &'a [u8],
}

impl<'a> PacketReader<'a> {
    pub fn new(packet: &'a [u8]) -> Self {
        Self {
            packet,
            rest: packet,
        }
    }

    /// Reader positioned just after the `(code, client)` header.
    pub fn after_header(packet: &'a [u8]) -> MuxResult<Self> {
        let mut reader = Self::new(packet);
        reader.skip(HEADER_LEN)?;
        Ok(reader)
    }

    pub fn position(&self) -> usize {
        self.packet.len() - self.rest.len()
    }

    pub fn remaining(&self) -> usize {
        self.rest.remaining()
    }

    pub fn skip(&mut self, len: usize) -> MuxResult<()> {
        if self.rest.remaining() < len {
            return Err(MuxError::malformed(format!(
                "cannot skip {len} bytes at offset {}",
                self.position()
            )));
        }
        self.rest.advance(len);
        Ok(())
    }

    pub fn u32(&mut self) -> MuxResult<u32> {
        if self.rest.remaining() < 4 {
            return Err(MuxError::malformed(format!(
                "truncated u32 at offset {}",
                self.position()
            )));
        }
        Ok(self.rest.get_u32())
    }

    pub fn opaque(&mut self) -> MuxResult<&'a [u8]> {
        let len = self.u32()? as usize;
        let rest = self.rest;
        if rest.len() < padded(len) {
            return Err(MuxError::malformed(format!(
                "opaque field of {len} bytes exceeds packet at offset {}",
                self.position()
            )));
        }
        let (value, tail) = rest.split_at(len);
        self.rest = tail;
        self.rest.advance(padded(len) - len);
        Ok(value)
    }

    pub fn uuid(&mut self) -> MuxResult<Uuid> {
        let raw = self.opaque()?;
        if raw.len() != UUID_LEN {
            return Err(MuxError::malformed(format!(
                "expected {UUID_LEN} byte uuid, got {}",
                raw.len()
            )));
        }
        Uuid::from_slice(raw).map_err(MuxError::malformed)
    }
}

/// Append-only packet builder.
#[derive(Debug, Default)]
pub struct PacketWriter {
    buf: BytesMut,
}

impl PacketWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u32(&mut self, value: u32) -> &mut Self {
        self.buf.put_u32(value);
        self
    }

    pub fn opaque(&mut self, value: &[u8]) -> &mut Self {
        self.buf.put_u32(value.len() as u32);
        self.buf.put_slice(value);
        self.buf.put_bytes(0, padded(value.len()) - value.len());
        self
    }

    pub fn uuid(&mut self, id: &Uuid) -> &mut Self {
        self.opaque(id.as_bytes())
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}
