//! Bidirectional byte relay between a stream transport and a WebSocket.
//!
//! One session owns exactly one transport connection and one WebSocket
//! connection. Two tasks pump bytes, one per direction: transport chunks
//! become binary messages, binary messages become transport writes. The
//! first direction to stop takes the whole session down; both write handles
//! live in take-once slots so teardown stays idempotent no matter which side
//! initiates it.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

/// Transport reads are forwarded in chunks of at most this many bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 256;

/// One established tunnel: a transport connection paired with a WebSocket.
pub struct RelaySession<T, S> {
    transport: T,
    ws: WebSocketStream<S>,
    chunk_size: usize,
    idle_timeout: Option<Duration>,
}

impl<T, S> RelaySession<T, S>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(transport: T, ws: WebSocketStream<S>) -> Self {
        Self {
            transport,
            ws,
            chunk_size: DEFAULT_CHUNK_SIZE,
            idle_timeout: None,
        }
    }

    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Terminates a direction whose read stays quiet this long. `None`
    /// disables the deadline.
    pub fn idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Pumps both directions until either one stops, then closes both
    /// connections.
    pub async fn run(self) {
        let chunk_size = self.chunk_size;
        let idle_timeout = self.idle_timeout;
        let (transport_rd, transport_wr) = tokio::io::split(self.transport);
        let (ws_tx, ws_rx) = self.ws.split();
        let closer = Arc::new(SessionCloser {
            transport_wr: Mutex::new(Some(transport_wr)),
            ws_tx: Mutex::new(Some(ws_tx)),
        });

        let mut to_ws = tokio::spawn(transport_to_ws(
            transport_rd,
            closer.clone(),
            chunk_size,
            idle_timeout,
        ));
        let mut to_transport = tokio::spawn(ws_to_transport(ws_rx, closer.clone(), idle_timeout));

        // whichever direction stops first takes the other down with it
        tokio::select! {
            _ = &mut to_ws => to_transport.abort(),
            _ = &mut to_transport => to_ws.abort(),
        }
        closer.close().await;
        debug!("relay session closed");
    }
}

/// Shared write handles of one session. `close` empties both slots, so only
/// the first teardown performs any I/O.
struct SessionCloser<T, S> {
    transport_wr: Mutex<Option<WriteHalf<T>>>,
    ws_tx: Mutex<Option<SplitSink<WebSocketStream<S>, Message>>>,
}

impl<T, S> SessionCloser<T, S>
where
    T: AsyncRead + AsyncWrite,
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Sends one chunk as a binary message. Returns false when the session
    /// is already torn down or the send failed.
    async fn forward_to_ws(&self, chunk: &[u8]) -> bool {
        let mut slot = self.ws_tx.lock().await;
        match slot.as_mut() {
            Some(ws_tx) => ws_tx
                .send(Message::Binary(Bytes::copy_from_slice(chunk)))
                .await
                .is_ok(),
            None => false,
        }
    }

    /// Writes one message payload to the transport. Returns false when the
    /// session is already torn down or the write failed.
    async fn write_to_transport(&self, data: &[u8]) -> bool {
        let mut slot = self.transport_wr.lock().await;
        match slot.as_mut() {
            Some(transport_wr) => transport_wr.write_all(data).await.is_ok(),
            None => false,
        }
    }

    /// Closes both write handles. Returns true only for the call that
    /// actually performed the teardown.
    async fn close(&self) -> bool {
        let ws_tx = self.ws_tx.lock().await.take();
        let transport_wr = self.transport_wr.lock().await.take();
        let mut closed = false;
        if let Some(mut ws_tx) = ws_tx {
            let _ = ws_tx.close().await;
            closed = true;
        }
        if let Some(mut transport_wr) = transport_wr {
            let _ = transport_wr.shutdown().await;
            closed = true;
        }
        closed
    }
}

async fn transport_to_ws<T, S>(
    mut transport_rd: ReadHalf<T>,
    closer: Arc<SessionCloser<T, S>>,
    chunk_size: usize,
    idle_timeout: Option<Duration>,
) where
    T: AsyncRead + AsyncWrite,
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; chunk_size];
    let mut forwarded: u64 = 0;
    loop {
        let n = match read_chunk(&mut transport_rd, &mut buf, idle_timeout).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                debug!("transport read ended: {}", err);
                break;
            }
        };
        if !closer.forward_to_ws(&buf[..n]).await {
            break;
        }
        forwarded += n as u64;
    }
    debug!("transport->ws finished after {} bytes", forwarded);
}

async fn ws_to_transport<T, S>(
    mut ws_rx: SplitStream<WebSocketStream<S>>,
    closer: Arc<SessionCloser<T, S>>,
    idle_timeout: Option<Duration>,
) where
    T: AsyncRead + AsyncWrite,
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut forwarded: u64 = 0;
    loop {
        let message = match next_message(&mut ws_rx, idle_timeout).await {
            Some(Ok(message)) => message,
            Some(Err(err)) => {
                debug!("ws read ended: {}", err);
                break;
            }
            None => break,
        };
        match message {
            Message::Binary(data) => {
                if !closer.write_to_transport(&data).await {
                    break;
                }
                forwarded += data.len() as u64;
            }
            Message::Close(_) => break,
            Message::Text(text) => {
                debug!("ignoring unexpected text message of {} bytes", text.len());
            }
            // ping/pong are answered by the protocol layer
            _ => {}
        }
    }
    debug!("ws->transport finished after {} bytes", forwarded);
}

async fn read_chunk<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
    idle_timeout: Option<Duration>,
) -> std::io::Result<usize> {
    match idle_timeout {
        Some(limit) => match tokio::time::timeout(limit, reader.read(buf)).await {
            Ok(result) => result,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "idle timeout",
            )),
        },
        None => reader.read(buf).await,
    }
}

async fn next_message<S>(
    ws_rx: &mut SplitStream<WebSocketStream<S>>,
    idle_timeout: Option<Duration>,
) -> Option<Result<Message, tokio_tungstenite::tungstenite::Error>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match idle_timeout {
        Some(limit) => match tokio::time::timeout(limit, ws_rx.next()).await {
            Ok(item) => item,
            Err(_) => {
                debug!("ws read idle timeout");
                None
            }
        },
        None => ws_rx.next().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;

    async fn ws_pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        (client, server)
    }

    #[tokio::test]
    async fn relays_bytes_in_both_directions() {
        let (ws_remote, ws_session) = ws_pair().await;
        let (mut transport_local, transport_session) = tokio::io::duplex(4096);

        let session = RelaySession::new(transport_session, ws_session).chunk_size(16);
        let session = tokio::spawn(session.run());

        // transport -> ws; 256 bytes cross as several 16-byte messages
        let payload: Vec<u8> = (0u8..=255).collect();
        transport_local.write_all(&payload).await.unwrap();

        let (mut ws_tx, mut ws_rx) = ws_remote.split();
        let mut received = Vec::new();
        while received.len() < payload.len() {
            match ws_rx.next().await {
                Some(Ok(Message::Binary(data))) => received.extend_from_slice(&data),
                other => panic!("unexpected frame: {:?}", other),
            }
        }
        assert_eq!(received, payload);

        // ws -> transport; one message arrives byte for byte
        ws_tx
            .send(Message::Binary(Bytes::from_static(b"jdwp-handshake")))
            .await
            .unwrap();
        let mut echo = vec![0u8; 14];
        transport_local.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, b"jdwp-handshake");

        // remote websocket goes away, the session must fold
        drop(ws_tx);
        drop(ws_rx);
        session.await.unwrap();

        let mut rest = [0u8; 8];
        let n = transport_local.read(&mut rest).await.unwrap();
        assert_eq!(n, 0, "transport should see EOF after teardown");
    }

    #[tokio::test]
    async fn transport_eof_closes_the_websocket() {
        let (mut ws_remote, ws_session) = ws_pair().await;
        let (transport_local, transport_session) = tokio::io::duplex(1024);

        let session = tokio::spawn(RelaySession::new(transport_session, ws_session).run());
        drop(transport_local);

        // the remote observes a close instead of hanging
        loop {
            match ws_remote.next().await {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => continue,
            }
        }
        session.await.unwrap();
    }

    #[tokio::test]
    async fn empty_messages_do_not_end_the_session() {
        let (ws_remote, ws_session) = ws_pair().await;
        let (mut transport_local, transport_session) = tokio::io::duplex(1024);
        let session = tokio::spawn(RelaySession::new(transport_session, ws_session).run());

        let (mut ws_tx, ws_rx) = ws_remote.split();
        ws_tx.send(Message::Binary(Bytes::new())).await.unwrap();
        ws_tx
            .send(Message::Binary(Bytes::from_static(b"after")))
            .await
            .unwrap();

        let mut buf = vec![0u8; 5];
        transport_local.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"after");

        drop(ws_tx);
        drop(ws_rx);
        session.await.unwrap();
    }

    #[tokio::test]
    async fn teardown_is_idempotent() {
        let (_ws_remote, ws_session) = ws_pair().await;
        let (_transport_local, transport_session) = tokio::io::duplex(1024);

        let (_rd, transport_wr) = tokio::io::split(transport_session);
        let (ws_tx, _ws_rx) = ws_session.split();
        let closer = SessionCloser {
            transport_wr: Mutex::new(Some(transport_wr)),
            ws_tx: Mutex::new(Some(ws_tx)),
        };

        assert!(closer.close().await);
        assert!(!closer.close().await, "second teardown must be a no-op");
        assert!(!closer.forward_to_ws(b"late").await);
        assert!(!closer.write_to_transport(b"late").await);
    }

    #[tokio::test]
    async fn idle_timeout_ends_a_quiet_session() {
        let (_ws_remote, ws_session) = ws_pair().await;
        let (_transport_local, transport_session) = tokio::io::duplex(1024);

        let session = RelaySession::new(transport_session, ws_session)
            .idle_timeout(Some(Duration::from_millis(50)));
        tokio::time::timeout(Duration::from_secs(5), session.run())
            .await
            .expect("session should end on its own");
    }
}
