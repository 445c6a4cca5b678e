//! HTTP routes receiving violation reports.

use std::sync::Arc;

use anyhow::Context as _;
use axum::{
    Router,
    body::Bytes,
    extract::{RawQuery, State},
    http::StatusCode,
    routing::{get, post},
};
use metrics::counter;
use tracing::{debug, info};

use crate::{
    AppState, Error, Result,
    config::AppConfig,
    metrics::{
        REPORTS_FAILED, REPORTS_MALFORMED, REPORTS_RECEIVED, REPORTS_REJECTED, REPORTS_STORED,
    },
    report::ViolationReport,
    storage::ViolationStore,
    validate::Validator,
};

async fn health_check() -> StatusCode {
    StatusCode::OK
}

/// Return the first `metadata` query parameter, if any.
fn first_metadata(query: Option<&str>) -> Option<String> {
    url::form_urlencoded::parse(query?.as_bytes())
        .find(|(key, _)| key == "metadata")
        .map(|(_, value)| value.into_owned())
}

/// Browsers send `application/csp-report` rather than JSON, so the body is decoded
/// without looking at the content type.
async fn handle_report(
    State(validator): State<Arc<Validator>>,
    State(store): State<ViolationStore>,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Result<StatusCode> {
    counter!(REPORTS_RECEIVED).increment(1);

    let report: ViolationReport = serde_json::from_slice(&body).map_err(|e| {
        counter!(REPORTS_MALFORMED).increment(1);
        Error::with_status(
            StatusCode::UNPROCESSABLE_ENTITY,
            anyhow::Error::new(e).context("unable to decode invalid JSON payload"),
        )
    })?;
    let body = report.body;

    validator.validate(&body).map_err(|e| {
        counter!(REPORTS_REJECTED).increment(1);
        Error::bad_request(e)
    })?;

    debug!(
        document_uri = %body.document_uri,
        referrer = %body.referrer,
        blocked_uri = %body.blocked_uri,
        violated_directive = %body.violated_directive,
        effective_directive = %body.effective_directive,
        original_policy = %body.original_policy,
        disposition = %body.disposition,
        script_sample = %body.script_sample,
        status_code = %body.status_code,
        metadata = %first_metadata(query.as_deref()).unwrap_or_default(),
        "received CSP violation"
    );

    if let Err(e) = store
        .store(&body)
        .await
        .context("could not store CSP violation")
    {
        counter!(REPORTS_FAILED).increment(1);
        return Err(e.into());
    }

    counter!(REPORTS_STORED).increment(1);
    info!(blocked_uri = %body.blocked_uri, "stored CSP violation");

    Ok(StatusCode::OK)
}

/// Join a path ending in `/` with a wildcard matching everything beneath it.
fn subtree(path: &str) -> Option<String> {
    path.ends_with('/').then(|| format!("{path}{{*rest}}"))
}

pub fn routes(config: &AppConfig) -> Router<AppState> {
    let listen = &config.listen_path;
    let health = &config.health_check_path;

    let mut router = if listen == health {
        Router::new().route(listen, get(health_check).post(handle_report))
    } else {
        Router::new()
            .route(health, get(health_check))
            .route(listen, post(handle_report))
    };

    // A path ending in a slash accepts reports for every path beneath it.
    if let Some(wildcard) = subtree(listen) {
        router = router.route(&wildcard, post(handle_report));
    }

    router
}
