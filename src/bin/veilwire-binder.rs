//! Binder daemon: the bridge directory and its HTTP surface.
//!
//! Two routes, mirroring the fleet's JSON contract:
//!
//! * `/get-bridges` hands a client a diverse sampled subset, optionally
//!   translated to ephemeral per-exit endpoints;
//! * `/add-bridge` is the authenticated (re-)announce from a bridge,
//!   probed for liveness before it is stored.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::{Form, Query, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use clap::Parser;
use rand::Rng;
use serde::Deserialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use veilwire::directory::{AddBridgeError, BridgeDirectory};

#[derive(Debug, Parser)]
#[command(name = "veilwire-binder", about = "bridge directory daemon")]
struct Opts {
    /// HTTP listen address.
    #[arg(long = "listenAddr", default_value = "127.0.0.1:9080")]
    listen_addr: String,

    /// Shared admin credential bridges authenticate with.
    #[arg(long = "bridgeKey", required = true)]
    bridge_key: String,
}

#[derive(Debug, Deserialize)]
struct GetBridgesParams {
    /// `persistent` (default) or `ephemeral`.
    #[serde(rename = "type")]
    kind: Option<String>,
    /// Exit hostname for ephemeral translation.
    exit: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AddBridgeForm {
    cookie: String,
    host: String,
    #[serde(rename = "allocGroup")]
    alloc_group: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let opts = Opts::parse();
    let directory = Arc::new(BridgeDirectory::new(opts.bridge_key));

    // Background eviction: the registry sweeps hourly (entries expire
    // after ten minutes anyway), the mapping cache once a minute.
    let sweeper = directory.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(60 * 60)).await;
            sweeper.sweep_bridges();
        }
    });
    let sweeper = directory.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(60)).await;
            sweeper.ephemeral_cache().sweep().await;
        }
    });

    let app = Router::new()
        .route(
            "/get-bridges",
            get(get_bridges_query).post(get_bridges_form),
        )
        .route("/add-bridge", post(add_bridge))
        .with_state(directory);

    let listener = tokio::net::TcpListener::bind(&opts.listen_addr)
        .await
        .context("cannot bind listen address")?;
    info!(addr = %listener.local_addr()?, "directory listening");
    axum::serve(listener, app).await.context("http server failed")?;
    Ok(())
}

async fn get_bridges_query(
    State(directory): State<Arc<BridgeDirectory>>,
    Query(params): Query<GetBridgesParams>,
) -> impl IntoResponse {
    get_bridges(directory, params).await
}

async fn get_bridges_form(
    State(directory): State<Arc<BridgeDirectory>>,
    Form(params): Form<GetBridgesParams>,
) -> impl IntoResponse {
    get_bridges(directory, params).await
}

async fn get_bridges(
    directory: Arc<BridgeDirectory>,
    params: GetBridgesParams,
) -> impl IntoResponse {
    // Client-ticket validation is handled by an external collaborator in
    // front of this surface.
    let ephemeral = params.kind.as_deref() == Some("ephemeral");
    let exit = params.exit.unwrap_or_default();
    let request_id = rand::rng().random::<u64>().to_string();
    let bridges = directory
        .select_bridges(&request_id, ephemeral, &exit)
        .await;
    Json(bridges)
}

async fn add_bridge(
    State(directory): State<Arc<BridgeDirectory>>,
    headers: HeaderMap,
    Form(form): Form<AddBridgeForm>,
) -> StatusCode {
    let Some(password) = basic_auth_password(&headers) else {
        return StatusCode::FORBIDDEN;
    };
    match directory
        .add_bridge(&form.cookie, &form.host, &form.alloc_group, &password)
        .await
    {
        Ok(()) => StatusCode::OK,
        Err(AddBridgeError::Unauthorized) | Err(AddBridgeError::ProbeFailed) => {
            StatusCode::FORBIDDEN
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Extracts the password of an HTTP basic-auth header, if any.
fn basic_auth_password(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = BASE64.decode(encoded).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (_user, password) = decoded.split_once(':')?;
    Some(password.to_string())
}
