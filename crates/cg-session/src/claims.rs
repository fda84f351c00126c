//! Access token claim decoding
//!
//! Tokens are three `.`-separated segments; the middle one is a base64 JSON
//! object. Only the `exp` claim is read, and only to estimate when a refresh
//! is due. The signature is never checked, so nothing here may be used to
//! make an authorization decision.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use std::time::Duration;
use thiserror::Error;

/// Why a token's expiry could not be decoded
#[derive(Error, Debug)]
pub enum ClaimsError {
    #[error("token does not have three segments")]
    Malformed,

    #[error("claims segment is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("claims segment is not a JSON object: {0}")]
    Json(#[from] serde_json::Error),

    #[error("claims have no numeric exp")]
    MissingExp,
}

/// Decode the `exp` claim of a token as epoch milliseconds
pub fn decode_expiry_millis(token: &str) -> Result<i64, ClaimsError> {
    let mut segments = token.split('.');
    let payload = match (segments.next(), segments.next(), segments.next(), segments.next()) {
        (Some(_), Some(payload), Some(_), None) if !payload.is_empty() => payload,
        _ => return Err(ClaimsError::Malformed),
    };

    // Accept both alphabets, padded or not.
    let normalized: String = payload
        .trim_end_matches('=')
        .chars()
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            other => other,
        })
        .collect();

    let bytes = URL_SAFE_NO_PAD.decode(normalized)?;
    let claims: serde_json::Map<String, serde_json::Value> = serde_json::from_slice(&bytes)?;

    let exp = claims.get("exp").ok_or(ClaimsError::MissingExp)?;
    let seconds = exp
        .as_i64()
        .or_else(|| exp.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
        .ok_or(ClaimsError::MissingExp)?;

    Ok(seconds.saturating_mul(1000))
}

/// Current wall-clock time in epoch milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Whether a token with the given expiry needs refreshing.
///
/// Unknown expiry counts as imminent.
pub fn is_expiring_soon(expiry_epoch_millis: Option<i64>, now_millis: i64, margin: Duration) -> bool {
    match expiry_epoch_millis {
        None => true,
        Some(expiry) => {
            let margin_ms = i64::try_from(margin.as_millis()).unwrap_or(i64::MAX);
            expiry.saturating_sub(now_millis) < margin_ms
        }
    }
}
