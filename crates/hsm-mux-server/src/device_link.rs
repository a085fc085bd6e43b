use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use hsm_mux_core::{DeviceTransport, MuxError, MuxResult};
use tokio::{
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::Mutex,
    time::timeout,
};
use tracing::info;

use crate::slip::{self, FrameReader};

/// SLIP-framed TCP connection to one device (or its serial bridge).
pub struct TcpDeviceLink {
    addr: String,
    reader: Mutex<FrameReader<OwnedReadHalf>>,
    writer: Mutex<OwnedWriteHalf>,
}

impl TcpDeviceLink {
    pub async fn connect(addr: &str, connect_timeout: Duration) -> anyhow::Result<Self> {
        let stream = timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .with_context(|| format!("timed out connecting to device {addr}"))?
            .with_context(|| format!("failed to connect to device {addr}"))?;
        stream
            .set_nodelay(true)
            .with_context(|| format!("failed to configure device socket {addr}"))?;
        let (read_half, write_half) = stream.into_split();
        info!(device = addr, "device link established");
        Ok(Self {
            addr: addr.to_string(),
            reader: Mutex::new(FrameReader::new(read_half)),
            writer: Mutex::new(write_half),
        })
    }
}

#[async_trait]
impl DeviceTransport for TcpDeviceLink {
    fn describe(&self) -> String {
        self.addr.clone()
    }

    async fn write_packet(&self, packet: Bytes) -> MuxResult<()> {
        let mut writer = self.writer.lock().await;
        slip::write_frame(&mut *writer, &packet)
            .await
            .map_err(MuxError::transport)
    }

    async fn read_packet(&self) -> MuxResult<Bytes> {
        let mut reader = self.reader.lock().await;
        match reader.next_frame().await {
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => Err(MuxError::transport(format!("{} closed the connection", self.addr))),
            Err(err) => Err(MuxError::transport(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hsm_mux_core::{DeviceHandle, wire::PacketWriter};
    use tokio::{io::AsyncWriteExt, net::TcpListener};

    #[tokio::test]
    async fn round_trip_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let device = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let (read_half, mut write_half) = stream.into_split();
            let mut frames = FrameReader::new(read_half);
            let request = frames.next_frame().await.expect("read").expect("frame");
            let mut reply = request.to_vec();
            reply.extend_from_slice(&[0, 0, 0, 0]);
            slip::write_frame(&mut write_half, &reply).await.expect("write");
            write_half.shutdown().await.expect("shutdown");
        });

        let link = TcpDeviceLink::connect(&addr, Duration::from_secs(5))
            .await
            .expect("connect");
        let handle = DeviceHandle::spawn(0, std::sync::Arc::new(link));
        let mut request = PacketWriter::new();
        request.u32(0).u32(7);
        let reply = handle.round_trip(7, request.finish()).await;
        assert_eq!(&reply[..], &[0, 0, 0, 0, 0, 0, 0, 7, 0, 0, 0, 0]);

        device.await.expect("device task");
        while handle.is_alive() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}
