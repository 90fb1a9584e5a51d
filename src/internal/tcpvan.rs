//! TCP implementation of the Van's byte transport.
//!
//! Connections are one-directional, mirroring a router/dealer socket pair:
//! to send to a node we dial its listener and keep a dedicated writer task;
//! everything inbound arrives through our own listener, where a reader task
//! per connection decodes messages and feeds one shared receive channel.
//! Each message on the wire is a sequence of length-delimited frames: the
//! sender's identity (`ps<id>`), the serialized metadata record, then one
//! frame per payload slice.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::internal::message::{pack_meta, unpack_meta, Message};
use crate::internal::node::{Node, EMPTY};
use crate::internal::van::Transport;
use crate::utils::{
    put_frame, read_frame, tcp_bind_with_retry, tcp_connect_with_retry,
    write_all_buf, PsError,
};

/// Outbound half of one peer connection.
struct PeerSender {
    /// Serialized messages to be written out, in order.
    tx_send: mpsc::UnboundedSender<Bytes>,

    writer_handle: JoinHandle<()>,
}

/// TCP transport backend.
pub(crate) struct TcpTransport {
    /// Feeds decoded inbound messages (with their wire byte counts).
    tx_recv: mpsc::UnboundedSender<(Message, usize)>,

    /// Receive side; taken exclusively by the Van's receive loop.
    rx_recv: tokio::sync::Mutex<mpsc::UnboundedReceiver<(Message, usize)>>,

    /// Node id -> live outbound connection.
    peers: Mutex<HashMap<i32, PeerSender>>,

    acceptor_handle: Mutex<Option<JoinHandle<()>>>,

    /// Reader tasks of accepted inbound connections; shared with the
    /// acceptor task.
    reader_handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl TcpTransport {
    pub(crate) fn new() -> Self {
        let (tx_recv, rx_recv) = mpsc::unbounded_channel();
        TcpTransport {
            tx_recv,
            rx_recv: tokio::sync::Mutex::new(rx_recv),
            peers: Mutex::new(HashMap::new()),
            acceptor_handle: Mutex::new(None),
            reader_handles: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Reads messages off one inbound connection until it closes or breaks.
    async fn reader_loop(
        stream: TcpStream,
        tx_recv: mpsc::UnboundedSender<(Message, usize)>,
    ) {
        let (mut conn_read, _conn_write) = stream.into_split();
        let mut read_buf = BytesMut::with_capacity(8 + 1024);

        'conn: loop {
            let id_frame =
                match read_frame(&mut read_buf, &mut conn_read).await {
                    Ok(frame) => frame,
                    Err(_) => break 'conn, // peer likely exited
                };
            let meta_frame =
                match read_frame(&mut read_buf, &mut conn_read).await {
                    Ok(frame) => frame,
                    Err(_) => break 'conn,
                };

            let meta = match unpack_meta(&meta_frame) {
                Ok(meta) => meta,
                Err(e) => {
                    // stream is desynchronized beyond repair
                    pf_error!("malformed meta record, closing conn: {}", e);
                    break 'conn;
                }
            };

            let num_slices = meta.data_type.len();
            let mut msg = Message {
                meta,
                data: Vec::with_capacity(num_slices),
            };
            msg.meta.sender = parse_identity(&id_frame);

            let mut nbytes = id_frame.len() + meta_frame.len();
            for _ in 0..num_slices {
                match read_frame(&mut read_buf, &mut conn_read).await {
                    Ok(frame) => {
                        nbytes += frame.len();
                        msg.data.push(frame);
                    }
                    Err(_) => break 'conn,
                }
            }
            debug_assert_eq!(
                msg.meta.data_size,
                msg.data.iter().map(|d| d.len() as u64).sum::<u64>()
            );

            if tx_recv.send((msg, nbytes)).is_err() {
                break 'conn; // transport stopped
            }
        }
    }

    /// Writes serialized messages out to one peer until the channel closes
    /// or the socket breaks.
    async fn writer_loop(
        peer_id: i32,
        mut conn_write: OwnedWriteHalf,
        mut rx_send: mpsc::UnboundedReceiver<Bytes>,
    ) {
        while let Some(buf) = rx_send.recv().await {
            if let Err(e) = write_all_buf(&mut conn_write, &buf).await {
                pf_warn!("error writing to node {}: {}", peer_id, e);
                break;
            }
        }
        // dropping rx_send here fails subsequent sends to this peer
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn bind(&self, port: u16, max_retry: u32) -> Result<u16, PsError> {
        let (listener, bound) = tcp_bind_with_retry(port, max_retry).await?;

        let acceptor = tokio::spawn({
            let tx_recv = self.tx_recv.clone();
            let reader_handles = self.reader_handles.clone();
            async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, _addr)) => {
                            let reader = tokio::spawn(Self::reader_loop(
                                stream,
                                tx_recv.clone(),
                            ));
                            reader_handles.lock().unwrap().push(reader);
                        }
                        Err(e) => {
                            pf_warn!("error accepting connection: {}", e);
                        }
                    }
                }
            }
        });
        *self.acceptor_handle.lock().unwrap() = Some(acceptor);

        Ok(bound)
    }

    async fn connect(
        &self,
        node: &Node,
        my_node: &Node,
    ) -> Result<(), PsError> {
        if node.id == EMPTY {
            return logged_err!("cannot connect to an unassigned node");
        }
        // workers don't talk to other workers, nor servers to other servers
        if node.role == my_node.role && node.id != my_node.id {
            return Ok(());
        }

        let stream = tcp_connect_with_retry(&node.addr(), 25).await?;
        let (_conn_read, conn_write) = stream.into_split();

        let (tx_send, rx_send) = mpsc::unbounded_channel();
        let writer_handle =
            tokio::spawn(Self::writer_loop(node.id, conn_write, rx_send));

        let mut peers = self.peers.lock().unwrap();
        if let Some(old) = peers.insert(
            node.id,
            PeerSender {
                tx_send,
                writer_handle,
            },
        ) {
            // reconnecting to the same id closes the prior socket
            old.writer_handle.abort();
        }
        pf_debug!("connected to node {} '{}'", node.id, node.addr());
        Ok(())
    }

    fn send_msg(&self, msg: &Message, my_id: i32) -> Result<usize, PsError> {
        let receiver = msg.meta.receiver;
        if receiver == EMPTY {
            return logged_err!("msg has no receiver set");
        }

        let tx_send = {
            let peers = self.peers.lock().unwrap();
            match peers.get(&receiver) {
                Some(peer) => peer.tx_send.clone(),
                None => {
                    return Err(PsError(format!(
                        "there is no socket to node {}",
                        receiver
                    )));
                }
            }
        };

        let identity = format!("ps{}", my_id);
        let meta_bytes = pack_meta(&msg.meta)?;
        let mut nbytes = identity.len() + meta_bytes.len();

        let mut buf = BytesMut::with_capacity(
            8 * (2 + msg.data.len()) + nbytes + msg.meta.data_size as usize,
        );
        put_frame(&mut buf, identity.as_bytes());
        put_frame(&mut buf, &meta_bytes);
        for slice in &msg.data {
            nbytes += slice.len();
            put_frame(&mut buf, slice);
        }

        // one channel send per message keeps multipart frames contiguous
        tx_send.send(buf.freeze()).map_err(|_| {
            PsError(format!("connection to node {} is gone", receiver))
        })?;
        Ok(nbytes)
    }

    async fn recv_msg(&self) -> Result<(Message, usize), PsError> {
        let mut rx_recv = self.rx_recv.lock().await;
        rx_recv
            .recv()
            .await
            .ok_or_else(|| PsError::msg("recv channel has been closed"))
    }

    fn stop(&self) {
        if let Some(handle) = self.acceptor_handle.lock().unwrap().take() {
            handle.abort();
        }
        for handle in self.reader_handles.lock().unwrap().drain(..) {
            handle.abort();
        }
        for (_, peer) in self.peers.lock().unwrap().drain() {
            peer.writer_handle.abort();
        }
    }
}

/// Parses the sender node id out of an identity frame (`ps<decimal id>`).
/// Unrecognized identities read as unassigned.
fn parse_identity(frame: &Bytes) -> i32 {
    std::str::from_utf8(frame)
        .ok()
        .and_then(|s| s.strip_prefix("ps"))
        .and_then(|digits| digits.parse::<i32>().ok())
        .unwrap_or(EMPTY)
}

#[cfg(test)]
mod tcpvan_tests {
    use super::*;
    use crate::internal::message::Command;
    use crate::internal::node::NodeRole;
    use crate::utils::SArray;

    fn node(role: NodeRole, id: i32, port: u16) -> Node {
        Node {
            role,
            id,
            customer_id: 0,
            hostname: "127.0.0.1".into(),
            port,
            is_recovered: false,
        }
    }

    #[test]
    fn identity_parsing() {
        assert_eq!(parse_identity(&Bytes::from_static(b"ps9")), 9);
        assert_eq!(parse_identity(&Bytes::from_static(b"ps-1")), -1);
        assert_eq!(parse_identity(&Bytes::from_static(b"ps1024")), 1024);
        assert_eq!(parse_identity(&Bytes::from_static(b"bogus")), EMPTY);
        assert_eq!(parse_identity(&Bytes::from_static(b"ps")), EMPTY);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn multipart_send_recv() -> Result<(), PsError> {
        let server = TcpTransport::new();
        let port = server.bind(0, 0).await?;
        let server_node = node(NodeRole::Server, 8, port);

        let client = TcpTransport::new();
        client
            .connect(&server_node, &node(NodeRole::Worker, 9, 0))
            .await?;

        let mut msg = Message::default();
        msg.meta.app_id = 0;
        msg.meta.customer_id = 0;
        msg.meta.receiver = 8;
        msg.meta.request = true;
        msg.meta.push = true;
        msg.meta.timestamp = 0;
        msg.add_data(&SArray::from_vec(vec![1u64, 3, 5]));
        msg.add_data(&SArray::from_vec(vec![0.5f32, 1.5, 2.5]));

        let sent = client.send_msg(&msg, 9)?;
        let (recv, nbytes) = server.recv_msg().await?;
        assert_eq!(sent, nbytes);
        assert_eq!(recv.meta.sender, 9);
        assert_eq!(recv.meta.timestamp, 0);
        assert!(recv.meta.push);
        assert_eq!(recv.data.len(), 2);
        assert_eq!(recv.data[0], msg.data[0]);
        assert_eq!(recv.data[1], msg.data[1]);

        client.stop();
        server.stop();
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn same_role_peers_never_connect() -> Result<(), PsError> {
        let a = TcpTransport::new();
        let worker_a = node(NodeRole::Worker, 9, 0);
        let worker_b = node(NodeRole::Worker, 11, 19);
        a.connect(&worker_b, &worker_a).await?;

        let mut msg = Message::default();
        msg.meta.receiver = 11;
        msg.meta.control.cmd = Command::Heartbeat;
        msg.meta.timestamp = 0;
        assert!(a.send_msg(&msg, 9).is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reconnect_is_idempotent() -> Result<(), PsError> {
        let server = TcpTransport::new();
        let port = server.bind(0, 0).await?;
        let server_node = node(NodeRole::Server, 8, port);
        let me = node(NodeRole::Worker, 9, 0);

        let client = TcpTransport::new();
        for _ in 0..3 {
            client.connect(&server_node, &me).await?;
        }
        assert_eq!(client.peers.lock().unwrap().len(), 1);

        let mut msg = Message::default();
        msg.meta.receiver = 8;
        msg.meta.control.cmd = Command::Heartbeat;
        msg.meta.timestamp = 7;
        client.send_msg(&msg, 9)?;
        let (recv, _) = server.recv_msg().await?;
        assert_eq!(recv.meta.control.cmd, Command::Heartbeat);

        client.stop();
        server.stop();
        Ok(())
    }
}
