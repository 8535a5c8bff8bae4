//! Device identity and challenge signing for the device-authenticated gateway.
//!
//! An identity is a device id plus an Ed25519 keypair stored as PEM
//! (PKCS#8 private key, SPKI public key). When the gateway issues a
//! `connect.challenge`, the client signs a pipe-delimited payload:
//!
//! ```text
//! v2|deviceId|clientId|clientMode|role|scope1,scope2|signedAtMs|token|nonce
//! ```
//!
//! Field order and delimiter are part of the wire contract. The signature and
//! the raw 32-byte public key travel as unpadded URL-safe base64.

use crate::error::IdentityError;
use crate::gateway::protocol::DeviceAuth;
use base64::Engine;
use ed25519_dalek::pkcs8::{DecodePrivateKey, DecodePublicKey, PrivateKeyInfo};
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Version tag at the head of the signed payload.
pub const AUTH_PAYLOAD_VERSION: &str = "v2";

/// Only identity file schema this client understands.
pub const IDENTITY_FILE_VERSION: u32 = 1;

/// Private key material of a device.
pub enum DeviceKey {
    Ed25519 {
        signing: SigningKey,
        verifying: VerifyingKey,
    },
    /// A well-formed key of some other algorithm. Loading succeeds so the
    /// failure surfaces when a challenge actually has to be signed.
    Unsupported { algorithm: String },
}

impl fmt::Debug for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ed25519 { .. } => f.write_str("DeviceKey::Ed25519(..)"),
            Self::Unsupported { algorithm } => write!(f, "DeviceKey::Unsupported({algorithm})"),
        }
    }
}

/// A loaded device identity. Immutable once constructed.
#[derive(Debug)]
pub struct Identity {
    pub device_id: String,
    key: DeviceKey,
}

impl Identity {
    /// Build an identity from PEM-encoded keys.
    ///
    /// The private key must be PKCS#8. A non-Ed25519 PKCS#8 key (or a PKCS#1 /
    /// SEC1 key) yields an identity whose [`DeviceKey`] is `Unsupported`.
    pub fn from_pem(
        device_id: impl Into<String>,
        public_key_pem: &str,
        private_key_pem: &str,
    ) -> Result<Self, IdentityError> {
        let key = match parse_private_key(private_key_pem)? {
            ParsedKey::Ed25519(signing) => {
                let verifying = VerifyingKey::from_public_key_pem(public_key_pem.trim())
                    .map_err(|e| IdentityError::Malformed(format!("public key: {e}")))?;
                if signing.verifying_key() != verifying {
                    return Err(IdentityError::KeyMismatch);
                }
                DeviceKey::Ed25519 { signing, verifying }
            }
            ParsedKey::Other(algorithm) => DeviceKey::Unsupported { algorithm },
        };

        Ok(Self {
            device_id: device_id.into(),
            key,
        })
    }

    /// Build an identity directly from an Ed25519 signing key.
    pub fn from_signing_key(device_id: impl Into<String>, signing: SigningKey) -> Self {
        let verifying = signing.verifying_key();
        Self {
            device_id: device_id.into(),
            key: DeviceKey::Ed25519 { signing, verifying },
        }
    }

    pub fn key(&self) -> &DeviceKey {
        &self.key
    }

    /// Raw 32-byte public key, if the key is Ed25519.
    pub fn public_key_raw(&self) -> Option<[u8; 32]> {
        match &self.key {
            DeviceKey::Ed25519 { verifying, .. } => Some(verifying.to_bytes()),
            DeviceKey::Unsupported { .. } => None,
        }
    }
}

enum ParsedKey {
    Ed25519(SigningKey),
    Other(String),
}

fn parse_private_key(pem: &str) -> Result<ParsedKey, IdentityError> {
    let mut reader = BufReader::new(pem.as_bytes());
    let item = rustls_pemfile::read_one(&mut reader)
        .map_err(|e| IdentityError::Malformed(format!("private key: {e}")))?
        .ok_or_else(|| IdentityError::Malformed("private key: no PEM block".into()))?;

    match item {
        rustls_pemfile::Item::Pkcs8Key(der) => {
            let der = der.secret_pkcs8_der();
            let info = PrivateKeyInfo::try_from(der)
                .map_err(|e| IdentityError::Malformed(format!("private key: {e}")))?;
            if info.algorithm.oid != ed25519_dalek::pkcs8::ALGORITHM_OID {
                return Ok(ParsedKey::Other(info.algorithm.oid.to_string()));
            }
            let signing = SigningKey::from_pkcs8_der(der)
                .map_err(|e| IdentityError::Malformed(format!("private key: {e}")))?;
            Ok(ParsedKey::Ed25519(signing))
        }
        rustls_pemfile::Item::Pkcs1Key(_) => Ok(ParsedKey::Other("rsa".into())),
        rustls_pemfile::Item::Sec1Key(_) => Ok(ParsedKey::Other("ec".into())),
        _ => Err(IdentityError::Malformed(
            "private key: expected a PKCS#8 PEM block".into(),
        )),
    }
}

/// Everything besides the identity that goes into the signed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthClaims {
    pub client_id: String,
    pub client_mode: String,
    pub role: String,
    pub scopes: Vec<String>,
    pub token: String,
    pub nonce: String,
}

/// Canonical payload string that gets signed.
pub fn build_auth_payload(device_id: &str, claims: &AuthClaims, signed_at_ms: i64) -> String {
    [
        AUTH_PAYLOAD_VERSION,
        device_id,
        &claims.client_id,
        &claims.client_mode,
        &claims.role,
        &claims.scopes.join(","),
        &signed_at_ms.to_string(),
        &claims.token,
        &claims.nonce,
    ]
    .join("|")
}

/// Sign `claims` at `signed_at_ms`. Deterministic for identical inputs.
pub fn sign(
    identity: &Identity,
    claims: &AuthClaims,
    signed_at_ms: i64,
) -> Result<DeviceAuth, IdentityError> {
    let (signing, verifying) = match &identity.key {
        DeviceKey::Ed25519 { signing, verifying } => (signing, verifying),
        DeviceKey::Unsupported { algorithm } => {
            return Err(IdentityError::UnsupportedKeyType(algorithm.clone()));
        }
    };

    let payload = build_auth_payload(&identity.device_id, claims, signed_at_ms);
    let signature = signing.sign(payload.as_bytes());

    Ok(DeviceAuth {
        id: identity.device_id.clone(),
        public_key: base64url_encode(verifying.as_bytes()),
        signature: base64url_encode(&signature.to_bytes()),
        signed_at: signed_at_ms,
        nonce: claims.nonce.clone(),
    })
}

/// [`sign`] stamped with the current wall clock.
pub fn sign_now(identity: &Identity, claims: &AuthClaims) -> Result<DeviceAuth, IdentityError> {
    sign(identity, claims, chrono::Utc::now().timestamp_millis())
}

/// Unpadded URL-safe base64.
pub fn base64url_encode(bytes: &[u8]) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

// ── Store ───────────────────────────────────────────────────────────────────

/// Tokens available to a paired device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PairedTokens {
    /// Shared gateway token from the main config.
    pub gateway: Option<String>,
    /// Per-device operator token issued at pairing.
    pub operator: Option<String>,
}

impl PairedTokens {
    /// Bearer token for `connect`: the gateway token, else the operator token.
    pub fn auth_token(&self) -> Option<&str> {
        self.gateway.as_deref().or(self.operator.as_deref())
    }
}

/// Read-only source of device identity and tokens.
pub trait IdentityStore: Send + Sync {
    fn load_identity(&self) -> Result<Identity, IdentityError>;
    fn load_tokens(&self, device_id: &str) -> Result<PairedTokens, IdentityError>;
}

/// Identity store backed by an OpenClaw state directory (`~/.openclaw`).
///
/// ```text
/// <root>/identity/device.json   {version, deviceId, publicKeyPem, privateKeyPem}
/// <root>/openclaw.json          {gateway: {remote: {token}, auth: {token}}}
/// <root>/devices/paired.json    {<deviceId>: {tokens: {operator: {token}}}}
/// ```
#[derive(Debug, Clone)]
pub struct FileIdentityStore {
    root: PathBuf,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceFile {
    device_id: String,
    public_key_pem: String,
    private_key_pem: String,
}

impl FileIdentityStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `~/.openclaw`, or `.openclaw` in the working directory without a home.
    pub fn default_root() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".openclaw")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn identity_path(&self) -> PathBuf {
        self.root.join("identity").join("device.json")
    }

    fn read_json(&self, path: &Path) -> Result<Option<Value>, IdentityError> {
        match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text)
                .map(Some)
                .map_err(|e| IdentityError::Malformed(format!("{}: {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(IdentityError::Malformed(format!("{}: {e}", path.display()))),
        }
    }
}

impl Default for FileIdentityStore {
    fn default() -> Self {
        Self::new(Self::default_root())
    }
}

fn non_empty(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

impl IdentityStore for FileIdentityStore {
    fn load_identity(&self) -> Result<Identity, IdentityError> {
        let path = self.identity_path();
        let value = self
            .read_json(&path)?
            .ok_or_else(|| IdentityError::Missing(path.clone()))?;

        let version = value.get("version").and_then(Value::as_u64).unwrap_or(0);
        if version != u64::from(IDENTITY_FILE_VERSION) {
            return Err(IdentityError::UnsupportedVersion(
                u32::try_from(version).unwrap_or(u32::MAX),
            ));
        }

        let file: DeviceFile = serde_json::from_value(value)
            .map_err(|e| IdentityError::Malformed(format!("{}: {e}", path.display())))?;

        debug!(device_id = %file.device_id, path = %path.display(), "Loaded device identity");
        Identity::from_pem(file.device_id, &file.public_key_pem, &file.private_key_pem)
    }

    fn load_tokens(&self, device_id: &str) -> Result<PairedTokens, IdentityError> {
        let gateway = self
            .read_json(&self.root.join("openclaw.json"))?
            .and_then(|config| {
                let gw = config.get("gateway")?;
                non_empty(gw.pointer("/remote/token")).or_else(|| non_empty(gw.pointer("/auth/token")))
            });

        let operator = self
            .read_json(&self.root.join("devices").join("paired.json"))?
            .and_then(|paired| {
                non_empty(paired.get(device_id)?.pointer("/tokens/operator/token"))
            });

        Ok(PairedTokens { gateway, operator })
    }
}
