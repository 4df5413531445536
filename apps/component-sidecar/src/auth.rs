use std::path::Path;

use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Claim settings for ASAP tokens presented to the selector and to the
/// local component.
#[derive(Debug, Clone)]
pub struct AsapConfig {
    pub issuer: String,
    pub audience: String,
    pub key_id: String,
    pub ttl: Duration,
}

impl Default for AsapConfig {
    fn default() -> Self {
        Self {
            issuer: "jitsi-component-sidecar".into(),
            audience: "jitsi-component-selector".into(),
            key_id: "jitsi/default".into(),
            ttl: Duration::hours(1),
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("failed to read signing key {path}: {source}")]
    KeyFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("signing key is neither an RSA nor an EC private key in PEM format")]
    UnsupportedKey,
    #[error("token signing failed: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsapClaims {
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
}

/// Signs short-lived bearer tokens from a static private key. Signing never
/// touches the network, so a fresh token is minted for every attempt.
#[derive(Clone)]
pub struct AsapSigner {
    key: EncodingKey,
    algorithm: Algorithm,
    config: AsapConfig,
}

impl AsapSigner {
    pub fn from_pem(pem: &[u8], config: AsapConfig) -> Result<Self, AuthError> {
        let (key, algorithm) = if let Ok(key) = EncodingKey::from_rsa_pem(pem) {
            (key, Algorithm::RS256)
        } else if let Ok(key) = EncodingKey::from_ec_pem(pem) {
            (key, Algorithm::ES256)
        } else {
            return Err(AuthError::UnsupportedKey);
        };
        Ok(Self {
            key,
            algorithm,
            config,
        })
    }

    pub fn from_key_file(path: impl AsRef<Path>, config: AsapConfig) -> Result<Self, AuthError> {
        let path = path.as_ref();
        let pem = std::fs::read(path).map_err(|source| AuthError::KeyFile {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_pem(&pem, config)
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn sign(&self) -> Result<String, AuthError> {
        let iat = Utc::now().timestamp();
        let claims = AsapClaims {
            iss: self.config.issuer.clone(),
            aud: self.config.audience.clone(),
            iat,
            exp: iat + self.config.ttl.num_seconds(),
            jti: Uuid::new_v4().to_string(),
        };
        let mut header = Header::new(self.algorithm);
        header.kid = Some(self.config.key_id.clone());
        Ok(jsonwebtoken::encode(&header, &claims, &self.key)?)
    }
}
