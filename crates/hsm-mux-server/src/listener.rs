//! Client listeners. TCP clients are untrusted ("ethernet") sessions; clients
//! on the local Unix socket are trusted.

use std::sync::Arc;

use hsm_mux_core::{Router, wire};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
};
use tracing::{debug, info, warn};

use crate::slip::{self, FrameReader};

pub async fn serve_tcp(listener: TcpListener, router: Arc<Router>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                if let Err(err) = stream.set_nodelay(true) {
                    debug!(%peer, "set_nodelay failed: {err}");
                }
                tokio::spawn(serve_connection(
                    stream,
                    peer.to_string(),
                    Arc::clone(&router),
                    true,
                ));
            }
            Err(err) => warn!("tcp accept failed: {err}"),
        }
    }
}

#[cfg(unix)]
pub async fn serve_unix(listener: tokio::net::UnixListener, router: Arc<Router>) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                tokio::spawn(serve_connection(
                    stream,
                    "local".to_string(),
                    Arc::clone(&router),
                    false,
                ));
            }
            Err(err) => warn!("unix accept failed: {err}"),
        }
    }
}

/// Serves one client connection until it closes, one request at a time.
pub async fn serve_connection<S>(stream: S, peer: String, router: Arc<Router>, from_ethernet: bool)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut frames = FrameReader::new(read_half);

    if from_ethernet && router.is_locked() {
        refuse(&mut frames, &mut write_half, &router, &peer).await;
        return;
    }

    let client = router.open_session(from_ethernet);
    metrics::counter!("hsm_mux_connections_total", "trusted" => (!from_ethernet).to_string())
        .increment(1);
    metrics::gauge!("hsm_mux_sessions").set(router.sessions().len() as f64);
    info!(%peer, client = format_args!("0x{client:x}"), "client connected");

    loop {
        let request = match frames.next_frame().await {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(err) => {
                debug!(%peer, "client read failed: {err}");
                break;
            }
        };
        let reply = router.handle(client, &request).await;
        if let Err(err) = slip::write_frame(&mut write_half, &reply).await {
            debug!(%peer, "client write failed: {err}");
            break;
        }
    }

    router.close_session(client).await;
    metrics::gauge!("hsm_mux_sessions").set(router.sessions().len() as f64);
    info!(%peer, client = format_args!("0x{client:x}"), "client disconnected");
}

/// Answers the first request with the lock reason; the caller then closes the
/// connection.
async fn refuse<R, W>(frames: &mut FrameReader<R>, writer: &mut W, router: &Router, peer: &str)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let reason = router.rejection();
    warn!(%peer, ?reason, "refusing connection while locked");
    let Ok(Some(request)) = frames.next_frame().await else {
        return;
    };
    let code = wire::opcode(&request).unwrap_or(0);
    let client = wire::client_handle(&request).unwrap_or(0);
    let reply = wire::error_response(code, client, reason);
    if let Err(err) = slip::write_frame(writer, &reply).await {
        debug!(%peer, "refusal write failed: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hsm_mux_core::{HalError, KeyCache, MuxSettings, RpcFunc, wire::PacketWriter};
    use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf};

    fn router(initialized: bool, settings: MuxSettings) -> Arc<Router> {
        let cache = Arc::new(KeyCache::new(0));
        if initialized {
            cache.mark_initialized();
        }
        Arc::new(Router::new(Vec::new(), cache, settings).expect("router"))
    }

    fn state_query() -> bytes::Bytes {
        let mut request = PacketWriter::new();
        request.u32(RpcFunc::GetHsmState.code()).u32(0x77);
        request.finish()
    }

    async fn exchange(
        client: &mut tokio::io::WriteHalf<DuplexStream>,
        replies: &mut FrameReader<ReadHalf<DuplexStream>>,
    ) -> Option<bytes::Bytes> {
        slip::write_frame(client, &state_query()).await.expect("write");
        replies.next_frame().await.expect("read")
    }

    #[tokio::test]
    async fn trusted_client_is_served_and_session_closed() {
        let router = router(true, MuxSettings::default());
        let (client, server) = tokio::io::duplex(4096);
        let task = tokio::spawn(serve_connection(server, "test".into(), Arc::clone(&router), false));
        let (read_half, mut write_half) = tokio::io::split(client);
        let mut replies = FrameReader::new(read_half);

        let reply = exchange(&mut write_half, &mut replies).await.expect("reply");
        assert_eq!(wire::client_handle(&reply).expect("client"), 0x77);
        assert_eq!(wire::result_code(&reply).expect("result"), HalError::Ok.code());
        assert_eq!(router.sessions().len(), 1);

        write_half.shutdown().await.expect("shutdown");
        task.await.expect("connection task");
        assert!(router.sessions().is_empty());
    }

    #[tokio::test]
    async fn locked_router_refuses_untrusted_clients() {
        let settings = MuxSettings {
            master_key_set: false,
            ..MuxSettings::default()
        };
        let router = router(true, settings);
        let (client, server) = tokio::io::duplex(4096);
        let task = tokio::spawn(serve_connection(server, "remote".into(), Arc::clone(&router), true));
        let (read_half, mut write_half) = tokio::io::split(client);
        let mut replies = FrameReader::new(read_half);

        let reply = exchange(&mut write_half, &mut replies).await.expect("reply");
        assert_eq!(wire::result_code(&reply).expect("result"), HalError::MasterKeyNotSet.code());
        task.await.expect("connection task");
        assert_eq!(replies.next_frame().await.expect("read"), None);
        assert!(router.sessions().is_empty());
    }

    #[tokio::test]
    async fn uninitialized_cache_locks_out_untrusted_clients() {
        let router = router(false, MuxSettings::default());
        let (client, server) = tokio::io::duplex(4096);
        tokio::spawn(serve_connection(server, "remote".into(), Arc::clone(&router), true));
        let (read_half, mut write_half) = tokio::io::split(client);
        let mut replies = FrameReader::new(read_half);

        let reply = exchange(&mut write_half, &mut replies).await.expect("reply");
        assert_eq!(wire::result_code(&reply).expect("result"), HalError::Forbidden.code());
    }
}
