//! Signed webhook ingest.
//!
//! Every request is authenticated by an HMAC-SHA256 of the raw body
//! against the shared secret before any parsing happens; mismatches are
//! rejected with 400 and nothing is enqueued.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::errors::AppError;
use crate::models::event::WebhookEvent;
use crate::AppState;

/// Header carrying the HMAC-SHA256 of the body.
const SIGNATURE_HEADER: &str = "x-hub-signature-256";

/// Header naming the event kind.
const EVENT_HEADER: &str = "x-github-event";

type HmacSha256 = Hmac<Sha256>;

/// POST /gh/webhook — validate, translate, enqueue. Returns 200 before any
/// analysis begins.
pub async fn receive(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(AppError::BadSignature)?;
    if !verify_signature(&state.config.github_webhook_secret, &body, signature) {
        return Err(AppError::BadSignature);
    }

    let event_name = headers
        .get(EVENT_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::MalformedPayload("missing event header".to_string()))?;

    let Some(event) = parse_event(event_name, &body)? else {
        tracing::debug!(event = %event_name, "ignoring unhandled event kind");
        return Ok(StatusCode::OK);
    };

    let outcome = state.dispatcher.dispatch(event).await?;
    tracing::debug!(event = %event_name, outcome = ?outcome, "webhook dispatched");
    Ok(StatusCode::OK)
}

/// Parse a verified body into an event; `None` for kinds we acknowledge
/// but do not handle.
fn parse_event(event_name: &str, body: &[u8]) -> Result<Option<WebhookEvent>, AppError> {
    let event = match event_name {
        "push" => WebhookEvent::Push(
            serde_json::from_slice(body)
                .map_err(|e| AppError::MalformedPayload(format!("push payload: {e}")))?,
        ),
        "pull_request" => WebhookEvent::PullRequest(
            serde_json::from_slice(body)
                .map_err(|e| AppError::MalformedPayload(format!("pull_request payload: {e}")))?,
        ),
        "installation" => WebhookEvent::Installation(
            serde_json::from_slice(body)
                .map_err(|e| AppError::MalformedPayload(format!("installation payload: {e}")))?,
        ),
        _ => return Ok(None),
    };
    Ok(Some(event))
}

/// Constant-time comparison of the body HMAC against a `sha256=<hex>`
/// signature header.
fn verify_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    let Some(hex_digest) = signature.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-webhook-secret";

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn valid_signature_is_accepted() {
        let body = br#"{"action":"opened"}"#;
        let signature = sign(SECRET, body);
        assert!(verify_signature(SECRET, body, &signature));
    }

    #[test]
    fn any_body_mutation_is_rejected() {
        let body = br#"{"action":"opened"}"#.to_vec();
        let signature = sign(SECRET, &body);
        for i in 0..body.len() {
            let mut mutated = body.clone();
            mutated[i] ^= 0x01;
            assert!(
                !verify_signature(SECRET, &mutated, &signature),
                "byte {i} mutation must invalidate the signature"
            );
        }
    }

    #[test]
    fn any_signature_mutation_is_rejected() {
        let body = br#"{"action":"opened"}"#;
        let signature = sign(SECRET, body);
        let digest = signature.strip_prefix("sha256=").unwrap();
        for i in 0..digest.len() {
            let mut mutated: Vec<char> = digest.chars().collect();
            mutated[i] = if mutated[i] == '0' { '1' } else { '0' };
            let mutated = format!("sha256={}", mutated.iter().collect::<String>());
            assert!(
                !verify_signature(SECRET, body, &mutated),
                "hex digit {i} mutation must invalidate the signature"
            );
        }
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let body = br#"{"action":"opened"}"#;
        let signature = sign("other-secret", body);
        assert!(!verify_signature(SECRET, body, &signature));
    }

    #[test]
    fn malformed_signature_headers_are_rejected() {
        let body = b"{}";
        assert!(!verify_signature(SECRET, body, ""));
        assert!(!verify_signature(SECRET, body, "sha1=abcdef"));
        assert!(!verify_signature(SECRET, body, "sha256=zz-not-hex"));
    }

    #[test]
    fn unhandled_event_kinds_are_acknowledged_without_parsing() {
        let parsed = parse_event("issue_comment", b"totally unparsed").unwrap();
        assert!(parsed.is_none());
    }

    #[test]
    fn malformed_payload_is_a_422() {
        let err = parse_event("push", b"not json").unwrap_err();
        assert!(matches!(err, AppError::MalformedPayload(_)));
    }

    #[test]
    fn known_kinds_parse_into_events() {
        let body = serde_json::json!({
            "ref": "refs/heads/main",
            "before": "1111",
            "after": "2222",
            "repository": {
                "id": 99,
                "full_name": "owner/demo",
                "clone_url": "https://github.com/owner/demo.git"
            },
            "installation": { "id": 7 }
        });
        let parsed = parse_event("push", body.to_string().as_bytes()).unwrap();
        assert!(matches!(parsed, Some(WebhookEvent::Push(_))));
    }
}
