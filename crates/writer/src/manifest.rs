//! Package manifest and its optional signature.

use crate::asset::AssetKind;
use crate::config::SigningConfig;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// File name of the manifest inside the package directory.
pub const MANIFEST_FILE: &str = "manifest.json";
/// File name of the hex signature sidecar.
pub const SIGNATURE_FILE: &str = "manifest.json.sig";

#[derive(Debug, Error)]
pub enum SignError {
    #[error("Signing is enabled but no key is configured")]
    MissingKey,

    #[error("Signing key is empty")]
    EmptyKey,

    #[error("Signing key rejected: {0}")]
    InvalidKey(String),
}

/// Signs the encoded manifest bytes.
pub trait Signer: Send + Sync {
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, SignError>;
}

/// HMAC-SHA256 with a shared secret.
pub struct HmacSigner {
    key: Vec<u8>,
}

impl HmacSigner {
    pub fn new(key: impl Into<Vec<u8>>) -> Result<Self, SignError> {
        let key = key.into();
        if key.is_empty() {
            return Err(SignError::EmptyKey);
        }
        Ok(Self { key })
    }
}

impl Signer for HmacSigner {
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, SignError> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| SignError::InvalidKey(e.to_string()))?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

/// Build the signer the configuration asks for, if any.
pub fn signer_from_config(cfg: &SigningConfig) -> Result<Option<Box<dyn Signer>>, SignError> {
    if !cfg.enabled {
        return Ok(None);
    }
    let key = cfg.key.as_deref().ok_or(SignError::MissingKey)?;
    Ok(Some(Box::new(HmacSigner::new(key.as_bytes())?)))
}

/// One finalized asset as listed in the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestAsset {
    pub id: Uuid,
    pub kind: AssetKind,
    /// File name relative to the package directory
    pub file: String,
    pub size: u64,
    /// Lowercase hex SHA-256 of the whole file
    pub digest: String,
    pub duration: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub id: Uuid,
    pub name: String,
    pub frame_rate: u32,
    pub duration: u64,
    pub stereoscopic: bool,
    pub assets: Vec<ManifestAsset>,
}

impl Manifest {
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }

    pub fn asset(&self, kind_name: &str) -> Option<&ManifestAsset> {
        self.assets.iter().find(|a| a.kind.name() == kind_name)
    }
}
