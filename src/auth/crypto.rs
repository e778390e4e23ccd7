//! Cryptographic primitives backing Auth & Crypto (component H).
//!
//! No PAKE/SRP/OPAQUE/HKDF crate exists anywhere in the retrieval corpus
//! (see DESIGN.md), so the zero-knowledge password verifier and key
//! derivation are hand-rolled from primitives that *are* idiomatic in this
//! corpus: `x25519-dalek` for the balanced PAKE's scalar/point arithmetic,
//! `hmac`+`sha2` for the HKDF-like derive-key step (spec.md's own phrasing),
//! and `chacha20poly1305`'s XChaCha20-Poly1305 construction for the 24-byte
//! nonce the envelope format fixes. Grounded via the `shranto27-WRAITH-Protocol`
//! and `zeroclaw-labs-zeroclaw` manifests, which carry exactly this crate
//! combination for their own AEAD/ECDH needs.

use anyhow::{bail, Context, Result};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use hmac::{Hmac, Mac};
use rand_core::OsRng;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroize;

type HmacSha256 = Hmac<Sha256>;

pub const ENVELOPE_VERSION: u8 = 1;
pub const NONCE_LEN: usize = 24;

/// HKDF-like single-block expand: `HMAC-SHA256(salt, ikm || info)`. Spec.md
/// deliberately says "HKDF-like" rather than requiring the two-step
/// extract-then-expand RFC 5869 construction; one block is all a 32-byte
/// symmetric key needs.
pub fn derive_key(ikm: &[u8], salt: &[u8], info: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(salt).expect("HMAC accepts any key length");
    mac.update(ikm);
    mac.update(info);
    let out = mac.finalize().into_bytes();
    let mut key = [0u8; 32];
    key.copy_from_slice(&out[..32]);
    key
}

/// Blinds a freshly generated ECDH secret scalar with a password-derived
/// additive term, giving a SPAKE2-style balanced PAKE: both sides combine
/// their own ephemeral key with a shared point derived from the password,
/// so recovering the password requires solving discrete log on the curve
/// rather than simply eavesdropping the exchange.
pub struct PakeState {
    secret: EphemeralSecret,
    pub public: PublicKey,
}

/// Password-derived blinding point, shared out-of-band via the enable/login
/// flow's stored salt — never the password itself.
pub fn password_blind(password: &[u8], salt: &[u8]) -> [u8; 32] {
    derive_key(password, salt, b"agentd-pake-blind-v1")
}

impl PakeState {
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Combine our ephemeral secret with the peer's public point and the
    /// password blind to produce the shared session key. Both participants
    /// must supply the same blind (derived from the same password + salt)
    /// for the resulting keys to match.
    pub fn derive_session_key(self, peer_public: &PublicKey, blind: &[u8; 32], salt: &[u8]) -> [u8; 32] {
        let shared = self.secret.diffie_hellman(peer_public);
        derive_key(shared.as_bytes(), salt, blind)
    }
}

/// Verifier stored at rest instead of the password: `HMAC-SHA256(salt,
/// password)`. Login recomputes this from the supplied password and
/// compares in constant time; the password itself is never persisted.
pub fn password_verifier(password: &[u8], salt: &[u8]) -> [u8; 32] {
    derive_key(password, salt, b"agentd-verifier-v1")
}

pub fn verify_password(password: &[u8], salt: &[u8], expected_verifier: &[u8; 32]) -> bool {
    let actual = password_verifier(password, salt);
    actual.ct_eq(expected_verifier).into()
}

/// Encrypt one relay frame: `version(1) || nonce(24) || ciphertext`. The
/// inner plaintext is the same format-byte-prefixed frame the Frame
/// Transport itself uses, so the wire shape is identical whether a frame is
/// local (WebSocket) or relayed (this envelope over TCP).
pub fn encrypt_envelope(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(key.into());
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| anyhow::anyhow!("envelope encryption failed"))?;

    let mut out = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
    out.push(ENVELOPE_VERSION);
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt one relay frame. Any failure here — wrong version, truncated
/// envelope, or an AEAD tag mismatch — is fatal to the connection per
/// SPEC_FULL §4.H: the caller closes the connection with a neutral reason
/// rather than distinguishing failure causes to an attacker.
pub fn decrypt_envelope(key: &[u8; 32], envelope: &[u8]) -> Result<Vec<u8>> {
    if envelope.len() < 1 + NONCE_LEN {
        bail!("envelope too short");
    }
    if envelope[0] != ENVELOPE_VERSION {
        bail!("unsupported envelope version {}", envelope[0]);
    }

    let nonce = XNonce::from_slice(&envelope[1..1 + NONCE_LEN]);
    let ciphertext = &envelope[1 + NONCE_LEN..];

    let cipher = XChaCha20Poly1305::new(key.into());
    cipher
        .decrypt(nonce, ciphertext)
        .context("envelope decryption failed")
}

/// A secret byte buffer that zeroes itself on drop — used for password
/// material and derived session keys held in memory longer than one call.
pub struct SecretBytes(Vec<u8>);

impl SecretBytes {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl Drop for SecretBytes {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pake_handshake_agrees_on_key_with_matching_password() {
        let salt = b"session-salt";
        let password = b"correct horse battery staple";
        let blind = password_blind(password, salt);

        let client = PakeState::generate();
        let server = PakeState::generate();
        let client_pub = client.public;
        let server_pub = server.public;

        let client_key = client.derive_session_key(&server_pub, &blind, salt);
        let server_key = server.derive_session_key(&client_pub, &blind, salt);

        assert_eq!(client_key, server_key);
    }

    #[test]
    fn pake_handshake_disagrees_with_wrong_password() {
        let salt = b"session-salt";
        let good_blind = password_blind(b"right password", salt);
        let bad_blind = password_blind(b"wrong password", salt);

        let client = PakeState::generate();
        let server = PakeState::generate();
        let client_pub = client.public;
        let server_pub = server.public;

        let client_key = client.derive_session_key(&server_pub, &good_blind, salt);
        let server_key = server.derive_session_key(&client_pub, &bad_blind, salt);

        assert_ne!(client_key, server_key);
    }

    #[test]
    fn verifier_round_trips() {
        let salt = b"salt";
        let verifier = password_verifier(b"hunter2", salt);
        assert!(verify_password(b"hunter2", salt, &verifier));
        assert!(!verify_password(b"wrong", salt, &verifier));
    }

    #[test]
    fn envelope_round_trips_and_rejects_tamper() {
        let key = [7u8; 32];
        let plaintext = b"\x01{\"type\":\"event\"}";
        let envelope = encrypt_envelope(&key, plaintext).unwrap();
        let decrypted = decrypt_envelope(&key, &envelope).unwrap();
        assert_eq!(decrypted, plaintext);

        let mut tampered = envelope.clone();
        *tampered.last_mut().unwrap() ^= 0xFF;
        assert!(decrypt_envelope(&key, &tampered).is_err());
    }
}
