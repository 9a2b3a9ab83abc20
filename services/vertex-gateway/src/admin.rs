//! Admin API for live reconfiguration
//!
//! Served on the main listener next to the proxy. Every data endpoint checks
//! the caller's password against the `API_KEY` currently in the hot config, so
//! changing the key through the admin page takes effect on the next call.
//!
//! Endpoints:
//! - GET  /              redirect to /admin
//! - GET  /admin         HTML editor page
//! - GET  /admin/data    config document as on disk plus the region list
//! - GET  /admin/status  pool sizes, active region, failover counter
//! - POST /admin/config  replace the config document

use std::path::Path;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Redirect};
use axum::routing::{get, post};
use axum::{Json, Router};
use common::Secret;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};
use vertex_config::settings::DEFAULT_LOCATION;

use crate::context::AppContext;
use crate::error::AdminError;

const ADMIN_PAGE: &str = include_str!("../static/admin.html");

pub fn build_admin_router(ctx: AppContext) -> Router {
    Router::new()
        .route("/", get(|| async { Redirect::temporary("/admin") }))
        .route("/admin", get(admin_page))
        .route("/admin/data", get(admin_data))
        .route("/admin/status", get(admin_status))
        .route("/admin/config", post(update_config))
        .with_state(ctx)
}

#[derive(Deserialize)]
struct PasswordQuery {
    #[serde(default)]
    password: String,
}

#[derive(Deserialize)]
struct ConfigUpdate {
    password: String,
    config_json: String,
}

fn authorize(ctx: &AppContext, password: &str) -> Result<(), AdminError> {
    if Secret::new(ctx.settings.api_key()).matches(password) {
        Ok(())
    } else {
        warn!("admin request rejected: wrong password");
        Err(AdminError::Unauthorized)
    }
}

async fn admin_page() -> Html<&'static str> {
    Html(ADMIN_PAGE)
}

/// GET /admin/data: the document exactly as it is on disk, and the region list.
async fn admin_data(
    State(ctx): State<AppContext>,
    Query(query): Query<PasswordQuery>,
) -> Result<impl IntoResponse, AdminError> {
    authorize(&ctx, &query.password)?;

    let config = ctx.settings.store().read_document();
    let locations = read_location_file(&ctx.locations_path)
        .unwrap_or_else(|| ctx.locations.locations().to_vec());

    Ok(Json(json!({
        "config": config,
        "locations": locations,
    })))
}

/// GET /admin/status: runtime view of pools and failover state.
async fn admin_status(
    State(ctx): State<AppContext>,
    Query(query): Query<PasswordQuery>,
) -> Result<impl IntoResponse, AdminError> {
    authorize(&ctx, &query.password)?;

    let snapshot = ctx.settings.store().snapshot();
    Ok(Json(json!({
        "pools": {
            "express": ctx.express.total_count(),
            "service_account": ctx.service_accounts.total_count(),
        },
        "round_robin": ctx.settings.round_robin(),
        "location": ctx.locations.status(),
        "config_reload_error": snapshot.last_error(),
    })))
}

/// POST /admin/config: replace the whole document.
///
/// The submitted text is the complete new document; nothing is merged with
/// what was there before. A `DEFAULT_LOCATION` that names a listed region
/// moves the active region at once, whether or not auto-switch is enabled.
async fn update_config(
    State(ctx): State<AppContext>,
    Json(update): Json<ConfigUpdate>,
) -> Result<impl IntoResponse, AdminError> {
    authorize(&ctx, &update.password)?;

    let document = match serde_json::from_str::<Value>(&update.config_json) {
        Ok(Value::Object(document)) => document,
        Ok(_) => return Err(AdminError::NotAnObject),
        Err(_) => return Err(AdminError::InvalidJson),
    };
    let default_location = document
        .get(DEFAULT_LOCATION)
        .and_then(Value::as_str)
        .map(str::to_owned);

    ctx.settings.store().write_document(document).await?;

    if let Some(region) = default_location {
        if ctx.locations.locations().contains(&region) {
            ctx.locations.force_location(&region);
            info!(region = %region, "admin update applied default location");
        }
    }

    Ok((
        StatusCode::OK,
        Json(json!({
            "status": "success",
            "message": "Config updated. Settings applied immediately.",
        })),
    ))
}

fn read_location_file(path: &Path) -> Option<Vec<String>> {
    let contents = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&contents).ok()
}
