//! Freshness tokens that gate tunnel establishment.
//!
//! The initiator encrypts the current unix time under the acceptor's RSA
//! public key; the acceptor decrypts it and accepts the upgrade only while
//! the timestamp is inside the configured acceptance window. The token rides
//! on the upgrade request as a hex-encoded header, so the check costs no
//! extra round trip.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::debug;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use crate::error::TunnelError;

/// Header carrying the hex-encoded encrypted freshness token.
pub const TOKEN_HEADER: &str = "x-jdwp-token";

/// Header carrying the requested debuggee port as a decimal string.
pub const PORT_HEADER: &str = "x-jdwp-port";

/// Default number of seconds a token stays acceptable after generation.
pub const DEFAULT_TOKEN_WINDOW_SECS: u64 = 60;

/// Tolerated clock skew for tokens stamped ahead of the acceptor's clock.
const MAX_CLOCK_SKEW_SECS: u64 = 10;

/// Encodes the current wall-clock time as the shared secret: the decimal
/// ASCII string of whole unix seconds.
pub fn generate_secret() -> Vec<u8> {
    secret_at(SystemTime::now())
}

fn secret_at(now: SystemTime) -> Vec<u8> {
    unix_seconds(now).to_string().into_bytes()
}

fn unix_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Encrypts a fresh secret under `public_key` (RSA-OAEP with SHA-256) and
/// hex-encodes the ciphertext. Failure here is fatal for the initiator: no
/// tunnel can be opened without a token.
pub fn generate_token(public_key: &RsaPublicKey) -> Result<String, TunnelError> {
    token_at(public_key, SystemTime::now())
}

pub(crate) fn token_at(public_key: &RsaPublicKey, now: SystemTime) -> Result<String, TunnelError> {
    let ciphertext = public_key
        .encrypt(&mut rand::thread_rng(), Oaep::new::<Sha256>(), &secret_at(now))
        .map_err(TunnelError::TokenEncryption)?;
    Ok(hex::encode(ciphertext))
}

/// Checks a token against `private_key`. Returns true only when the token
/// decrypts to a unix timestamp no older than `window` and no further ahead
/// of the local clock than the fixed skew tolerance. Malformed input of any
/// kind yields false, never an error.
pub fn verify_token(private_key: &RsaPrivateKey, token: &str, window: Duration) -> bool {
    verify_token_at(private_key, token, window, SystemTime::now())
}

fn verify_token_at(
    private_key: &RsaPrivateKey,
    token: &str,
    window: Duration,
    now: SystemTime,
) -> bool {
    if token.is_empty() {
        debug!("rejecting empty token");
        return false;
    }
    let ciphertext = match hex::decode(token) {
        Ok(bytes) => bytes,
        Err(err) => {
            debug!("token is not valid hex: {}", err);
            return false;
        }
    };
    let plaintext = match private_key.decrypt(Oaep::new::<Sha256>(), &ciphertext) {
        Ok(bytes) => bytes,
        Err(err) => {
            debug!("token decryption failed: {}", err);
            return false;
        }
    };
    let stamp = match std::str::from_utf8(&plaintext)
        .ok()
        .and_then(|text| text.parse::<u64>().ok())
    {
        Some(stamp) => stamp,
        None => {
            debug!("token plaintext is not a timestamp");
            return false;
        }
    };
    let now_secs = unix_seconds(now);
    let oldest = now_secs.saturating_sub(window.as_secs());
    let newest = now_secs.saturating_add(MAX_CLOCK_SKEW_SECS);
    (oldest..=newest).contains(&stamp)
}
