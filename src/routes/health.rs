//! Liveness probe.

/// GET /health-check — always OK while the process runs.
pub async fn check() -> &'static str {
    "OK"
}
