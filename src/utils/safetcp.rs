//! Safe TCP bind/connect/frame read/write helper functions.

use std::net::{Ipv4Addr, SocketAddr};

use bytes::{Buf, Bytes, BytesMut};
use rand::prelude::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};
use tokio::time::{self, Duration};

use crate::utils::PsError;

/// Receives one length-delimited frame from TCP readable connection
/// `conn_read`, using `read_buf` as buffer storage for partial reads. The
/// frame is 8 big-endian length bytes followed by that many payload bytes.
/// The returned `Bytes` shares the read buffer's allocation, so the payload
/// is not copied out; the storage is released when the last holder drops.
pub(crate) async fn read_frame(
    read_buf: &mut BytesMut,
    conn_read: &mut OwnedReadHalf,
) -> Result<Bytes, PsError> {
    // read length of frame first
    while read_buf.len() < 8 {
        if conn_read.read_buf(read_buf).await? == 0 {
            return Err(PsError::msg("connection closed by peer"));
        }
    }
    let frame_len = u64::from_be_bytes(read_buf[..8].try_into()?) as usize;

    // then read the frame itself
    let frame_end = 8 + frame_len;
    if read_buf.capacity() < frame_end {
        read_buf.reserve(frame_end - read_buf.capacity());
    }
    while read_buf.len() < frame_end {
        if conn_read.read_buf(read_buf).await? == 0 {
            return Err(PsError::msg("connection closed mid-frame"));
        }
    }

    read_buf.advance(8);
    Ok(read_buf.split_to(frame_len).freeze())
}

/// Appends one length-delimited frame onto `write_buf`.
pub(crate) fn put_frame(write_buf: &mut BytesMut, frame: &[u8]) {
    write_buf.extend_from_slice(&(frame.len() as u64).to_be_bytes());
    write_buf.extend_from_slice(frame);
}

/// Writes a fully serialized buffer out to the TCP connection. The write
/// half is owned by a dedicated writer task, so a plain `write_all` cannot
/// deadlock against concurrent writers on the same socket.
pub(crate) async fn write_all_buf(
    conn_write: &mut OwnedWriteHalf,
    buf: &[u8],
) -> Result<(), PsError> {
    conn_write.write_all(buf).await?;
    Ok(())
}

/// Wrapper over tokio `TcpListener::bind()` that falls back onto random
/// ports in `[10000, 50000)` up to `max_retry` times. Returns the listener
/// and the actually bound port (the requested port may be 0 for "pick any").
pub(crate) async fn tcp_bind_with_retry(
    port: u16,
    max_retry: u32,
) -> Result<(TcpListener, u16), PsError> {
    let mut port = port;
    let mut retries = max_retry;
    loop {
        let socket = TcpSocket::new_v4()?;
        socket.set_linger(None)?;
        socket.set_reuseaddr(true)?;
        socket.set_nodelay(true)?;

        let bind_addr: SocketAddr = (Ipv4Addr::UNSPECIFIED, port).into();
        match socket.bind(bind_addr).and_then(|()| socket.listen(1024)) {
            Ok(listener) => {
                let bound = listener.local_addr()?.port();
                return Ok((listener, bound));
            }
            Err(err) => {
                if retries == 0 {
                    return Err(err.into());
                }
                retries -= 1;
                port = thread_rng().gen_range(10000..50000);
            }
        }
    }
}

/// Wrapper over tokio `TcpStream::connect()` that provides a retrying logic.
pub(crate) async fn tcp_connect_with_retry(
    addr: &str,
    mut retries: u8,
) -> Result<TcpStream, PsError> {
    let conn_addr = lookup_host(addr)
        .await?
        .next()
        .ok_or_else(|| PsError(format!("failed to resolve address '{}'", addr)))?;

    loop {
        let socket = TcpSocket::new_v4()?;
        socket.set_linger(None)?;
        socket.set_reuseaddr(true)?;
        socket.set_nodelay(true)?;

        match socket.connect(conn_addr).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                if retries == 0 {
                    return Err(err.into());
                }
                retries -= 1;
                time::sleep(Duration::from_millis(200)).await;
            }
        }
    }
}

/// Resolves the local IP address that routes toward the given host, by
/// opening a throwaway UDP socket. Used when no explicit node host is
/// configured.
pub(crate) fn local_ip_toward(host: &str, port: u16) -> Result<String, PsError> {
    let probe = std::net::UdpSocket::bind("0.0.0.0:0")?;
    probe.connect((host, port))?;
    Ok(probe.local_addr()?.ip().to_string())
}
