use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::error::ChatError;
use crate::types::IdentityId;

/// Claims carried by a session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenClaims {
    pub identity: IdentityId,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

// Token format: base64url(claims json) "." base64url(ed25519 signature)
// The signature covers the exact claim bytes, so no re-serialization is
// needed to verify.

/// Signs session tokens after a successful login.
#[derive(Clone)]
pub struct TokenIssuer {
    signing_key: SigningKey,
    ttl: Duration,
}

impl TokenIssuer {
    pub fn generate(ttl: Duration) -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
            ttl,
        }
    }

    pub fn from_secret_bytes(secret: &[u8; 32], ttl: Duration) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(secret),
            ttl,
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issue a token for `identity` valid from now for the configured TTL.
    pub fn issue(&self, identity: &IdentityId) -> Result<(String, TokenClaims), ChatError> {
        let now = Utc::now();
        let expires_at = now
            .checked_add_signed(self.ttl)
            .ok_or_else(|| ChatError::Internal("token lifetime out of range".into()))?;
        let claims = TokenClaims {
            identity: identity.clone(),
            issued_at: now,
            expires_at,
        };
        let token = self.sign(&claims)?;
        Ok((token, claims))
    }

    pub fn sign(&self, claims: &TokenClaims) -> Result<String, ChatError> {
        let payload =
            serde_json::to_vec(claims).map_err(|e| ChatError::Internal(e.to_string()))?;
        let signature = self.signing_key.sign(&payload);
        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&payload),
            URL_SAFE_NO_PAD.encode(signature.to_bytes())
        ))
    }

    pub fn verify(&self, token: &str) -> Result<TokenClaims, ChatError> {
        verify_token_with_key(token, &self.verifying_key())
    }
}

/// Check signature and expiry; any failure is `InvalidToken`.
pub fn verify_token_with_key(token: &str, key: &VerifyingKey) -> Result<TokenClaims, ChatError> {
    let (payload_b64, signature_b64) = token
        .trim()
        .split_once('.')
        .ok_or(ChatError::InvalidToken)?;

    let payload = URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|_| ChatError::InvalidToken)?;
    let signature_bytes = URL_SAFE_NO_PAD
        .decode(signature_b64)
        .map_err(|_| ChatError::InvalidToken)?;
    let signature = Signature::from_slice(&signature_bytes).map_err(|_| ChatError::InvalidToken)?;

    key.verify(&payload, &signature)
        .map_err(|_| ChatError::InvalidToken)?;

    let claims: TokenClaims =
        serde_json::from_slice(&payload).map_err(|_| ChatError::InvalidToken)?;

    if Utc::now() > claims.expires_at {
        return Err(ChatError::InvalidToken);
    }

    Ok(claims)
}
