//! Error types for the tunnel.

/// Custom error types for tunnel-related operations.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("Key generation failed: {0}")]
    KeyGeneration(rsa::Error),

    #[error("Token encryption failed: {0}")]
    TokenEncryption(rsa::Error),

    #[error("Invalid public key: {0}")]
    PublicKeyCodec(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Invalid header value: {0}")]
    HeaderValue(#[from] tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
