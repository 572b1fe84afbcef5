//! Tunnel-opening side: a plain TCP endpoint the debugger dials, bridged to
//! a remote acceptor over one WebSocket per connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use log::{debug, info, warn};
use rsa::RsaPublicKey;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, ORIGIN};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::auth;
use crate::config::{self, InitiatorArgs};
use crate::error::TunnelError;
use crate::relay::RelaySession;
use crate::supervisor::{self, RestartPolicy};

/// Listens for a local debugger and opens one authenticated tunnel per
/// accepted connection.
pub struct Initiator {
    bind_host: String,
    bind_port: u16,
    server_host: String,
    server_port: u16,
    ws_path: String,
    ws_origin: Option<String>,
    jdwp_port: u16,
    public_key: RsaPublicKey,
    idle_timeout: Option<Duration>,
}

impl Initiator {
    pub fn new(args: &InitiatorArgs, public_key: RsaPublicKey) -> Self {
        Self {
            bind_host: args.bind_host.clone(),
            bind_port: args.bind_port,
            server_host: args.server_host.clone(),
            server_port: args.server_port,
            ws_path: config::normalize_ws_path(&args.ws_path),
            ws_origin: args.ws_origin.clone(),
            jdwp_port: args.jdwp_port,
            public_key,
            idle_timeout: config::idle_timeout(args.idle_timeout),
        }
    }

    /// Binds the local endpoint and serves it until the process ends,
    /// rebinding with backoff if the listener ever fails.
    pub async fn start(self) -> anyhow::Result<()> {
        let bind_addr = format!("{}:{}", self.bind_host, self.bind_port);
        let initiator = Arc::new(self);
        supervisor::supervise(
            "debugger endpoint",
            RestartPolicy::default(),
            || {
                let bind_addr = bind_addr.clone();
                async move {
                    TcpListener::bind(&bind_addr)
                        .await
                        .with_context(|| format!("can't bind {bind_addr}"))
                }
            },
            |listener| initiator.clone().serve(listener),
        )
        .await
    }

    pub(crate) async fn serve(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        info!(
            "Listening for debugger connections on {}",
            listener.local_addr()?
        );
        loop {
            let (conn, peer) = listener.accept().await.context("accept failed")?;
            let initiator = self.clone();
            tokio::spawn(initiator.handle(conn, peer));
        }
    }

    async fn handle(self: Arc<Self>, conn: TcpStream, peer: SocketAddr) {
        debug!("Debugger connected from {peer}");
        let _ = conn.set_nodelay(true);
        let _ = conn.set_linger(Some(Duration::from_secs(3)));

        // a failed handshake drops the local connection, which is the only
        // refusal a debugger understands
        let ws = match self.connect().await {
            Ok(ws) => ws,
            Err(err) => {
                warn!("Can't open tunnel for {peer}: {err}");
                return;
            }
        };

        info!("Tunnel open for {peer}");
        RelaySession::new(conn, ws)
            .idle_timeout(self.idle_timeout)
            .run()
            .await;
        info!("Tunnel closed for {peer}");
    }

    /// Performs the authenticated WebSocket handshake with the acceptor. A
    /// fresh token is minted for every attempt.
    async fn connect(
        &self,
    ) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>, TunnelError> {
        let url = format!(
            "ws://{}:{}{}",
            self.server_host, self.server_port, self.ws_path
        );
        debug!("Connecting to acceptor at {url}");

        let mut request = url.into_client_request()?;
        let token = auth::generate_token(&self.public_key)?;
        let headers = request.headers_mut();
        headers.insert(auth::TOKEN_HEADER, HeaderValue::from_str(&token)?);
        headers.insert(
            auth::PORT_HEADER,
            HeaderValue::from_str(&self.jdwp_port.to_string())?,
        );
        if let Some(origin) = &self.ws_origin {
            headers.insert(ORIGIN, HeaderValue::from_str(origin)?);
        }

        let (ws, _) = connect_async(request).await?;
        Ok(ws)
    }
}
