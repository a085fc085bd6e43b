//! SLIP framing (RFC 1055) used on client connections and device links.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

pub const END: u8 = 0xC0;
pub const ESC: u8 = 0xDB;
pub const ESC_END: u8 = 0xDC;
pub const ESC_ESC: u8 = 0xDD;

/// Largest decoded frame accepted from a peer.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Frame delimited by `END` on both sides, so a receiver can resync after
/// line noise.
pub fn encode(packet: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(packet.len() + 2);
    out.put_u8(END);
    for byte in packet {
        match *byte {
            END => out.put_slice(&[ESC, ESC_END]),
            ESC => out.put_slice(&[ESC, ESC_ESC]),
            other => out.put_u8(other),
        }
    }
    out.put_u8(END);
    out.freeze()
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SlipError {
    #[error("invalid escape sequence 0x{0:02x}")]
    BadEscape(u8),
    #[error("frame exceeds {MAX_FRAME_LEN} bytes")]
    TooLarge,
}

/// Incremental decoder; bytes may arrive split at any point.
#[derive(Debug, Default)]
pub struct SlipDecoder {
    frame: BytesMut,
    escaped: bool,
    discarding: bool,
}

impl SlipDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes `input` up to and including the first complete frame.
    /// Returns the number of bytes used and the frame, if one finished.
    /// Empty frames between back-to-back `END` bytes are skipped; a corrupt
    /// frame is reported once and dropped.
    pub fn decode(&mut self, input: &[u8]) -> (usize, Option<Result<Bytes, SlipError>>) {
        for (used, byte) in input.iter().enumerate() {
            if *byte == END {
                let escaped = std::mem::take(&mut self.escaped);
                if std::mem::take(&mut self.discarding) {
                    self.frame.clear();
                    continue;
                }
                if escaped {
                    self.frame.clear();
                    return (used + 1, Some(Err(SlipError::BadEscape(END))));
                }
                if self.frame.is_empty() {
                    continue;
                }
                return (used + 1, Some(Ok(self.frame.split().freeze())));
            }
            if self.discarding {
                continue;
            }
            let decoded = if std::mem::take(&mut self.escaped) {
                match *byte {
                    ESC_END => END,
                    ESC_ESC => ESC,
                    other => {
                        self.discarding = true;
                        return (used + 1, Some(Err(SlipError::BadEscape(other))));
                    }
                }
            } else if *byte == ESC {
                self.escaped = true;
                continue;
            } else {
                *byte
            };
            if self.frame.len() >= MAX_FRAME_LEN {
                self.discarding = true;
                return (used + 1, Some(Err(SlipError::TooLarge)));
            }
            self.frame.put_u8(decoded);
        }
        (input.len(), None)
    }
}

/// Buffered reader half of a SLIP stream.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    decoder: SlipDecoder,
    pending: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            decoder: SlipDecoder::new(),
            pending: BytesMut::with_capacity(4096),
        }
    }

    /// Next good frame, `None` at end of stream. Corrupt frames are skipped.
    pub async fn next_frame(&mut self) -> std::io::Result<Option<Bytes>> {
        loop {
            while !self.pending.is_empty() {
                let (used, frame) = self.decoder.decode(&self.pending);
                let _ = self.pending.split_to(used);
                match frame {
                    Some(Ok(frame)) => return Ok(Some(frame)),
                    Some(Err(err)) => debug!("dropping corrupt frame: {err}"),
                    None => {}
                }
            }
            if self.inner.read_buf(&mut self.pending).await? == 0 {
                return Ok(None);
            }
        }
    }
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, packet: &[u8]) -> std::io::Result<()> {
    writer.write_all(&encode(packet)).await?;
    writer.flush().await
}
