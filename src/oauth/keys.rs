//! RSA signing key management and JWKS publication.

use base64::prelude::*;
use jsonwebtoken::{DecodingKey, EncodingKey};
use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;

use crate::errors::KeyError;

const RSA_KEY_BITS: usize = 2048;

/// Public RSA key in JWK form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    #[serde(rename = "use")]
    pub use_: String,
    pub alg: String,
    pub kid: String,
    pub n: String,
    pub e: String,
}

/// JSON Web Key Set document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

/// Owns the server's RS256 signing key pair.
pub struct KeyManager {
    kid: String,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    jwk: Jwk,
}

impl KeyManager {
    /// Generate a fresh 2048-bit key pair.
    pub fn generate() -> Result<Self, KeyError> {
        let private_key = RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS)
            .map_err(|e| KeyError::GenerationFailed(e.to_string()))?;
        Self::from_private_key(private_key)
    }

    /// Load a PKCS#8 PEM private key.
    pub fn from_pem(pem: &str) -> Result<Self, KeyError> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(pem)
            .map_err(|e| KeyError::InvalidKey(e.to_string()))?;
        Self::from_private_key(private_key)
    }

    /// Load the key at `path`, or generate an ephemeral one when no path is configured.
    pub fn load_or_generate(path: Option<&Path>) -> Result<Self, KeyError> {
        match path {
            Some(path) => {
                let pem = std::fs::read_to_string(path).map_err(|e| {
                    KeyError::InvalidKey(format!("{}: {}", path.display(), e))
                })?;
                let manager = Self::from_pem(&pem)?;
                tracing::info!(kid = %manager.kid, "loaded signing key");
                Ok(manager)
            }
            None => {
                let manager = Self::generate()?;
                tracing::warn!(
                    kid = %manager.kid,
                    "no SIGNING_KEY_PATH configured; generated an ephemeral signing key"
                );
                Ok(manager)
            }
        }
    }

    fn from_private_key(private_key: RsaPrivateKey) -> Result<Self, KeyError> {
        let public_key = RsaPublicKey::from(&private_key);
        let n = BASE64_URL_SAFE_NO_PAD.encode(public_key.n().to_bytes_be());
        let e = BASE64_URL_SAFE_NO_PAD.encode(public_key.e().to_bytes_be());
        let kid = thumbprint(&n, &e);

        let private_pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| KeyError::InvalidKey(e.to_string()))?;
        let encoding_key = EncodingKey::from_rsa_pem(private_pem.as_bytes())
            .map_err(|e| KeyError::InvalidKey(e.to_string()))?;

        let public_pem = public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| KeyError::InvalidKey(e.to_string()))?;
        let decoding_key = DecodingKey::from_rsa_pem(public_pem.as_bytes())
            .map_err(|e| KeyError::InvalidKey(e.to_string()))?;

        let jwk = Jwk {
            kty: "RSA".to_string(),
            use_: "sig".to_string(),
            alg: "RS256".to_string(),
            kid: kid.clone(),
            n,
            e,
        };

        Ok(Self {
            kid,
            encoding_key,
            decoding_key,
            jwk,
        })
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub fn encoding_key(&self) -> &EncodingKey {
        &self.encoding_key
    }

    pub fn decoding_key(&self) -> &DecodingKey {
        &self.decoding_key
    }

    pub fn jwks(&self) -> Jwks {
        Jwks {
            keys: vec![self.jwk.clone()],
        }
    }
}

/// Generate a new private key as PKCS#8 PEM, suitable for `SIGNING_KEY_PATH`.
pub fn generate_private_key_pem() -> Result<String, KeyError> {
    let private_key = RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS)
        .map_err(|e| KeyError::GenerationFailed(e.to_string()))?;
    let pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| KeyError::InvalidKey(e.to_string()))?;
    Ok(pem.to_string())
}

/// RFC 7638 JWK thumbprint over the required RSA members in lexical order.
fn thumbprint(n: &str, e: &str) -> String {
    let canonical = format!(r#"{{"e":"{}","kty":"RSA","n":"{}"}}"#, e, n);
    BASE64_URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes()))
}
