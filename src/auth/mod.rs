//! Auth & Crypto (component H) — cookie auth for local clients and relay
//! auth for tunneled clients, both built on the zero-knowledge password
//! verifier in [`crypto`].
//!
//! Persistence follows the same config-file conventions used elsewhere in
//! this crate (atomic write-then-rename) rather than a database:
//! `{dataDir}/auth.json` holds the verifier and salt, never the password.

pub mod crypto;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::AppError;

#[derive(Debug, Serialize, Deserialize, Clone)]
struct PersistedAuthState {
    salt: Vec<u8>,
    verifier: Vec<u8>,
}

#[derive(Clone)]
pub struct AuthState {
    inner: Arc<RwLock<Option<PersistedAuthState>>>,
    path: PathBuf,
    /// Rotates on process restart: bearer cookies from a previous run of
    /// the server never validate against a new one, matching SPEC_FULL
    /// §4.H's "cookie bound to process lifetime" rule.
    restart_secret: [u8; 32],
}

impl AuthState {
    pub async fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join("auth.json");
        let inner = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).context("parsing auth.json")?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e).context("reading auth.json"),
        };

        let mut restart_secret = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut restart_secret);

        Ok(Self {
            inner: Arc::new(RwLock::new(inner)),
            path,
            restart_secret,
        })
    }

    pub async fn is_enabled(&self) -> bool {
        self.inner.read().await.is_some()
    }

    /// Enable password auth for the first time. Fails if already enabled —
    /// callers must `disable()` first to change the password via reset.
    pub async fn enable(&self, password: &str) -> Result<(), AppError> {
        let mut guard = self.inner.write().await;
        if guard.is_some() {
            return Err(AppError::Conflict("auth already enabled".into()));
        }

        let mut salt = vec![0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        let verifier = crypto::password_verifier(password.as_bytes(), &salt).to_vec();

        *guard = Some(PersistedAuthState {
            salt: salt.clone(),
            verifier,
        });
        drop(guard);
        self.persist().await.map_err(AppError::internal)?;
        Ok(())
    }

    pub async fn disable(&self) -> Result<(), AppError> {
        *self.inner.write().await = None;
        self.persist().await.map_err(AppError::internal)?;
        Ok(())
    }

    pub async fn change_password(&self, old: &str, new: &str) -> Result<(), AppError> {
        self.login(old).await?;
        let mut salt = vec![0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        let verifier = crypto::password_verifier(new.as_bytes(), &salt).to_vec();
        *self.inner.write().await = Some(PersistedAuthState { salt, verifier });
        self.persist().await.map_err(AppError::internal)?;
        Ok(())
    }

    /// Verify a password against the stored verifier and mint a bearer
    /// cookie value bound to this process's restart secret.
    pub async fn login(&self, password: &str) -> Result<String, AppError> {
        let guard = self.inner.read().await;
        let state = guard
            .as_ref()
            .ok_or_else(|| AppError::Unauthorized("auth not enabled".into()))?;

        if !crypto::verify_password(password.as_bytes(), &state.salt, &to_array(&state.verifier)) {
            return Err(AppError::Unauthorized("invalid password".into()));
        }

        Ok(self.mint_cookie())
    }

    fn mint_cookie(&self) -> String {
        let mut nonce = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let mac = crypto::derive_key(&self.restart_secret, &nonce, b"agentd-cookie-v1");
        format!("{}.{}", hex::encode(nonce), hex::encode(mac))
    }

    pub fn verify_cookie(&self, cookie: &str) -> bool {
        let Some((nonce_hex, mac_hex)) = cookie.split_once('.') else {
            return false;
        };
        let (Ok(nonce), Ok(mac)) = (hex::decode(nonce_hex), hex::decode(mac_hex)) else {
            return false;
        };
        let expected = crypto::derive_key(&self.restart_secret, &nonce, b"agentd-cookie-v1");
        mac.len() == expected.len() && mac == expected
    }

    /// Logout is a client-side concern (forget the cookie) — the server
    /// holds no session table to invalidate, matching the Non-goal that we
    /// do not persist operator state beyond what enable/login need.
    pub fn logout(&self) {}

    async fn persist(&self) -> Result<()> {
        let guard = self.inner.read().await;
        let bytes = serde_json::to_vec_pretty(&*guard)?;
        let tmp = self.path.with_extension("json.tmp");
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

fn to_array(bytes: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    let len = bytes.len().min(32);
    out[..len].copy_from_slice(&bytes[..len]);
    out
}

/// Minimal hex encode/decode so we don't pull in a dedicated `hex` crate for
/// two call sites; kept private to this module.
mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().map(|b| format!("{b:02x}")).collect()
    }

    pub fn decode(s: &str) -> Result<Vec<u8>, ()> {
        if s.len() % 2 != 0 {
            return Err(());
        }
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| ()))
            .collect()
    }
}

/// Relay handshake runs the same verifier protocol as cookie auth, then
/// derives a per-connection symmetric key via the PAKE exchange in
/// [`crypto`]. Per SPEC_FULL §9's resolved open question, this is always a
/// fresh handshake — there is no long-lived re-association across relay
/// connections.
///
/// Split into two steps because the PAKE exchange needs our ephemeral public
/// key on the wire *before* the session key can be derived: `begin()` checks
/// the password proof and hands back our half of the exchange plus a pending
/// state to finish once the peer's public key arrives.
pub struct RelayHandshake;

/// Our half of an in-progress relay handshake, held between sending our
/// public key and receiving the peer's.
pub struct PendingRelayHandshake {
    pake: crypto::PakeState,
    blind: [u8; 32],
    salt: Vec<u8>,
}

impl PendingRelayHandshake {
    pub fn public_key(&self) -> x25519_dalek::PublicKey {
        self.pake.public
    }

    /// Combine with the peer's public key to derive the shared session key
    /// both sides now use to encrypt every subsequent frame.
    pub fn finish(self, peer_public: &x25519_dalek::PublicKey) -> [u8; 32] {
        self.pake.derive_session_key(peer_public, &self.blind, &self.salt)
    }
}

impl RelayHandshake {
    /// Verify the peer's password proof and prepare our half of the PAKE
    /// exchange. `password_attempt` comes from the same verifier store
    /// cookie auth uses — a mismatch fails the same way an invalid cookie
    /// login would, with no detail distinguishing the cause.
    pub async fn begin(auth: &AuthState, password_attempt: &str) -> Result<PendingRelayHandshake, AppError> {
        let guard = auth.inner.read().await;
        let state = guard
            .as_ref()
            .ok_or_else(|| AppError::Unauthorized("auth not enabled".into()))?;

        if !crypto::verify_password(
            password_attempt.as_bytes(),
            &state.salt,
            &to_array(&state.verifier),
        ) {
            return Err(AppError::Unauthorized("invalid password".into()));
        }

        let blind = crypto::password_blind(password_attempt.as_bytes(), &state.salt);
        let pake = crypto::PakeState::generate();
        Ok(PendingRelayHandshake {
            pake,
            blind,
            salt: state.salt.clone(),
        })
    }
}
