//! Forge-app installation callback.

use axum::extract::Query;
use axum::response::Redirect;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    pub installation_id: Option<i64>,
    pub setup_action: Option<String>,
}

/// GET /gh/callback — where the forge sends the browser after an app
/// install. Installation bookkeeping itself arrives via the webhook; this
/// just lands the user somewhere sensible.
pub async fn callback(Query(params): Query<CallbackParams>) -> Redirect {
    tracing::info!(
        installation_id = ?params.installation_id,
        setup_action = ?params.setup_action,
        "installation callback"
    );
    Redirect::to("/")
}
