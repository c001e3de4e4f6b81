//! `run tunnel`'s client-server data plane: a single local TCP connection
//! forwarded over one authenticated QUIC stream opened through the relay.
//!
//! The session manager's job ends at opening and servicing the stream;
//! this module is the thin local TCP listener/forwarder built on top of it.

use anyhow::{Context, Result};
use meshline_core::SessionHandle;
use meshline_core::quic::QuicConnection;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const FORWARD_CHUNK: usize = 16 * 1024;

/// Accept one local TCP connection on `local_port`, open the tunnel's QUIC
/// stream, send the `remote_host:remote_port` the relay-side server should
/// forward to, then shuttle bytes between the two until either side closes
/// or `cancel` is signalled.
pub async fn run(
    handle: &SessionHandle,
    tunnel_id: &str,
    local_port: u16,
    remote_host: &str,
    remote_port: u16,
    cancel: tokio_util::sync::CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(("127.0.0.1", local_port)).await.context("binding local tunnel port")?;
    tracing::info!(local_port, tunnel_id, "tunnel listening for a local connection");

    let (tcp, peer_addr) = tokio::select! {
        accepted = listener.accept() => accepted.context("accepting local tunnel connection")?,
        _ = cancel.cancelled() => return Ok(()),
    };
    tracing::info!(%peer_addr, "local tunnel connection accepted");

    let conn = handle.open_relay_tunnel(tunnel_id).await.context("opening relay tunnel stream")?;
    let connect_line = format!("CONNECT {remote_host}:{remote_port}\n");
    conn.write_stream(tunnel_id, connect_line.as_bytes()).await.context("sending tunnel connect header")?;

    tokio::select! {
        result = forward(tcp, conn, tunnel_id) => result,
        _ = cancel.cancelled() => Ok(()),
    }
}

async fn forward(tcp: TcpStream, conn: Arc<QuicConnection>, tunnel_id: &str) -> Result<()> {
    let (mut tcp_read, mut tcp_write) = tcp.into_split();
    let tunnel_id_a = tunnel_id.to_string();
    let tunnel_id_b = tunnel_id.to_string();
    let conn_a = Arc::clone(&conn);
    let conn_b = conn;

    let to_tunnel = async move {
        let mut buf = vec![0u8; FORWARD_CHUNK];
        loop {
            let n = tcp_read.read(&mut buf).await.context("reading local tunnel connection")?;
            if n == 0 {
                return Ok::<(), anyhow::Error>(());
            }
            conn_a.write_stream(&tunnel_id_a, &buf[..n]).await.context("writing tunnel stream")?;
        }
    };

    let from_tunnel = async move {
        loop {
            let chunk = conn_b.read_stream(&tunnel_id_b, FORWARD_CHUNK).await.context("reading tunnel stream")?;
            if chunk.is_empty() {
                return Ok::<(), anyhow::Error>(());
            }
            tcp_write.write_all(&chunk).await.context("writing local tunnel connection")?;
        }
    };

    tokio::select! {
        result = to_tunnel => result,
        result = from_tunnel => result,
    }
}
