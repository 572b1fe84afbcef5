//! Tunnel-terminating side: an authenticated WebSocket endpoint in front of
//! the debuggee.
//!
//! Every upgrade request must carry a fresh token and name an allow-listed
//! debuggee port. Anything else is turned away before the WebSocket exists.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use log::{debug, info, warn};
use rsa::RsaPrivateKey;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderMap, StatusCode};

use crate::auth;
use crate::config::{self, AcceptorArgs};
use crate::error::TunnelError;
use crate::relay::RelaySession;
use crate::supervisor::{self, RestartPolicy};

/// Why an upgrade was refused. Logged locally only; the wire answer is the
/// same for every reason.
#[derive(Debug, thiserror::Error)]
enum RejectReason {
    #[error("missing port header")]
    MissingPort,
    #[error("malformed port header")]
    MalformedPort,
    #[error("port {0} is not allow-listed")]
    PortNotAllowed(u16),
    #[error("missing or invalid token")]
    BadToken,
}

/// Accepts authenticated WebSocket upgrades and bridges each one to a local
/// debuggee port.
pub struct Acceptor {
    bind_host: String,
    bind_port: u16,
    ws_path: String,
    allowed_ports: HashSet<u16>,
    target_host: String,
    private_key: RsaPrivateKey,
    token_window: Duration,
    idle_timeout: Option<Duration>,
}

impl Acceptor {
    pub fn new(args: &AcceptorArgs, private_key: RsaPrivateKey) -> Self {
        Self {
            bind_host: args.bind_host.clone(),
            bind_port: args.bind_port,
            ws_path: config::normalize_ws_path(&args.ws_path),
            allowed_ports: args.allowed_ports.iter().copied().collect(),
            target_host: args.target_host.clone(),
            private_key,
            token_window: Duration::from_secs(args.token_window),
            idle_timeout: config::idle_timeout(args.idle_timeout),
        }
    }

    /// Binds the endpoint and serves it until the process ends, rebinding
    /// with backoff if the listener ever fails.
    pub async fn start(self) -> anyhow::Result<()> {
        let bind_addr = format!("{}:{}", self.bind_host, self.bind_port);
        let acceptor = Arc::new(self);
        supervisor::supervise(
            "tunnel endpoint",
            RestartPolicy::default(),
            || {
                let bind_addr = bind_addr.clone();
                async move {
                    TcpListener::bind(&bind_addr)
                        .await
                        .with_context(|| format!("can't bind {bind_addr}"))
                }
            },
            |listener| acceptor.clone().serve(listener),
        )
        .await
    }

    pub(crate) async fn serve(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        info!(
            "Accepting tunnels on {}{}",
            listener.local_addr()?,
            self.ws_path
        );
        loop {
            let (conn, peer) = listener.accept().await.context("accept failed")?;
            let acceptor = self.clone();
            tokio::spawn(async move {
                if let Err(err) = acceptor.handle(conn, peer).await {
                    debug!("Session with {peer} ended: {err}");
                }
            });
        }
    }

    async fn handle(
        self: Arc<Self>,
        conn: TcpStream,
        peer: SocketAddr,
    ) -> Result<(), TunnelError> {
        let _ = conn.set_nodelay(true);

        let mut authorized = None;
        let mut ws = accept_hdr_async(conn, |request: &Request, response: Response| {
            if request.uri().path() != self.ws_path {
                debug!("Unknown path {} from {peer}", request.uri().path());
                return Err(plain_response(StatusCode::NOT_FOUND));
            }
            match self.authorize(request.headers()) {
                Ok(port) => {
                    authorized = Some(port);
                    Ok(response)
                }
                Err(reason) => {
                    warn!("Rejecting upgrade from {peer}: {reason}");
                    Err(plain_response(StatusCode::FORBIDDEN))
                }
            }
        })
        .await?;

        // the callback records the port before approving the upgrade
        let Some(port) = authorized else {
            return Ok(());
        };

        let target_addr = format!("{}:{}", self.target_host, port);
        let target = match TcpStream::connect(&target_addr).await {
            Ok(target) => target,
            Err(err) => {
                warn!("Can't reach debuggee at {target_addr}: {err}");
                let _ = ws.close(None).await;
                return Err(err.into());
            }
        };
        let _ = target.set_nodelay(true);
        let _ = target.set_linger(Some(Duration::from_secs(3)));

        info!("Tunnel open: {peer} <-> {target_addr}");
        RelaySession::new(target, ws)
            .idle_timeout(self.idle_timeout)
            .run()
            .await;
        info!("Tunnel closed: {peer} <-> {target_addr}");
        Ok(())
    }

    /// Checks the upgrade headers and hands back the verified debuggee port.
    /// The port travels as a return value so nothing per-request is ever
    /// parked on the shared acceptor state.
    fn authorize(&self, headers: &HeaderMap) -> Result<u16, RejectReason> {
        let port_header = headers
            .get(auth::PORT_HEADER)
            .and_then(|value| value.to_str().ok())
            .ok_or(RejectReason::MissingPort)?;
        let port = port_header
            .parse::<u16>()
            .map_err(|_| RejectReason::MalformedPort)?;
        if !self.allowed_ports.contains(&port) {
            return Err(RejectReason::PortNotAllowed(port));
        }

        let token = headers
            .get(auth::TOKEN_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        if !auth::verify_token(&self.private_key, token, self.token_window) {
            return Err(RejectReason::BadToken);
        }
        Ok(port)
    }
}

/// Bodyless error response. Bad tokens and bad ports answer identically so a
/// probing caller can't tell which check failed.
fn plain_response(status: StatusCode) -> ErrorResponse {
    let mut response = ErrorResponse::new(None);
    *response.status_mut() = status;
    response
}
