//! Reading claims out of access credentials.
//!
//! Credentials are decoded, never verified: the backend is the only party that
//! checks signatures. The client only needs the expiry and the identity hints.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Deserialize;

use crate::auth::UserRef;
use crate::error::SyncError;

/// Claims carried in the payload segment of an access credential.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Claims {
    /// Expiry, seconds since the Unix epoch.
    pub exp: i64,
    #[serde(default)]
    pub user_id: Option<i64>,
    #[serde(default)]
    pub username: Option<String>,
}

impl Claims {
    pub fn is_expired_at(&self, now_epoch_seconds: i64) -> bool {
        self.exp < now_epoch_seconds
    }

    /// Identity hint from the claims, if the issuer put one there.
    pub fn user(&self) -> Option<UserRef> {
        if self.user_id.is_none() && self.username.is_none() {
            return None;
        }
        Some(UserRef {
            id: self.user_id,
            username: self.username.clone().unwrap_or_default(),
        })
    }
}

/// Decodes the payload of a `header.payload.signature` credential.
///
/// # Errors
///
/// Returns [`SyncError::Malformed`] when the credential does not have three
/// segments, the payload is not base64url, or it lacks an `exp` claim.
pub fn decode_claims(token: &str) -> Result<Claims, SyncError> {
    let mut parts = token.split('.');
    let payload = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(header), Some(payload), Some(_), None) if !header.is_empty() => payload,
        _ => return Err(SyncError::Malformed("expected three segments".into())),
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|err| SyncError::Malformed(format!("payload encoding: {err}")))?;
    serde_json::from_slice(&bytes).map_err(|err| SyncError::Malformed(format!("claims: {err}")))
}

#[cfg(test)]
pub(crate) fn mint_unsigned(exp: i64, username: &str) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(
        serde_json::json!({ "exp": exp, "user_id": 7, "username": username }).to_string(),
    );
    format!("{header}.{payload}.sig")
}
