//! Proof Key for Code Exchange (RFC 7636).

use base64::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::errors::OAuthError;

/// PKCE transformation applied to the verifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodeChallengeMethod {
    S256,
    #[serde(rename = "plain")]
    Plain,
}

impl CodeChallengeMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            CodeChallengeMethod::S256 => "S256",
            CodeChallengeMethod::Plain => "plain",
        }
    }
}

impl std::str::FromStr for CodeChallengeMethod {
    type Err = OAuthError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "S256" => Ok(CodeChallengeMethod::S256),
            "plain" => Ok(CodeChallengeMethod::Plain),
            other => Err(OAuthError::InvalidRequest(format!(
                "Unsupported code_challenge_method: {}",
                other
            ))),
        }
    }
}

/// Compute the S256 challenge for a verifier: BASE64URL(SHA256(verifier)).
pub fn s256_challenge(code_verifier: &str) -> String {
    let digest = Sha256::digest(code_verifier.as_bytes());
    BASE64_URL_SAFE_NO_PAD.encode(digest)
}

/// RFC 7636 syntax shared by verifiers and challenges: 43 to 128 characters of `[A-Za-z0-9-._~]`.
pub fn is_well_formed(value: &str) -> bool {
    (43..=128).contains(&value.len())
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~'))
}

/// Verify a presented verifier against the stored challenge in constant time.
pub fn verify(code_verifier: &str, code_challenge: &str, method: CodeChallengeMethod) -> bool {
    let computed = match method {
        CodeChallengeMethod::S256 => s256_challenge(code_verifier),
        CodeChallengeMethod::Plain => code_verifier.to_string(),
    };
    computed.as_bytes().ct_eq(code_challenge.as_bytes()).into()
}
