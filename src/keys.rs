//! RSA key pair lifecycle and the public key file exchanged between roles.

use std::fs;
use std::path::Path;

use log::info;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};

use crate::error::TunnelError;

/// Default public key file, written by the acceptor and read by the initiator.
pub const DEFAULT_KEY_FILE: &str = "jdwptun_key.pem";

const KEY_BITS: usize = 2048;

/// Generates the acceptor's RSA key pair. Failure is fatal to startup.
pub fn generate_key_pair() -> Result<RsaPrivateKey, TunnelError> {
    RsaPrivateKey::new(&mut rand::thread_rng(), KEY_BITS).map_err(TunnelError::KeyGeneration)
}

/// PEM-encodes a public key in PKIX/SPKI form.
pub fn export_public_key(public_key: &RsaPublicKey) -> Result<String, TunnelError> {
    public_key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|err| TunnelError::PublicKeyCodec(err.to_string()))
}

/// Decodes a PEM-encoded PKIX public key.
pub fn load_public_key(pem: &str) -> Result<RsaPublicKey, TunnelError> {
    RsaPublicKey::from_public_key_pem(pem)
        .map_err(|err| TunnelError::PublicKeyCodec(err.to_string()))
}

/// Acceptor startup: generate a fresh key pair, publish the public half to
/// `path` and keep the private half in memory. The PEM is also logged so
/// operators can hand it to initiators out of band.
pub fn init_key_pair(path: &Path) -> Result<RsaPrivateKey, TunnelError> {
    info!("Generating {}-bit RSA key pair...", KEY_BITS);
    let private_key = generate_key_pair()?;
    let pem = export_public_key(&private_key.to_public_key())?;
    fs::write(path, &pem)?;
    info!("Public key written to {}", path.display());
    info!("Published public key:\n\n{}", pem);
    Ok(private_key)
}

/// Initiator startup: read the acceptor's published public key from `path`.
pub fn read_public_key(path: &Path) -> Result<RsaPublicKey, TunnelError> {
    let pem = fs::read_to_string(path)?;
    load_public_key(&pem)
}
