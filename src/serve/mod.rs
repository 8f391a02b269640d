mod etag_middleware;

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{
    extract::{Path, Query},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Extension, Json, Router,
};
use chrono::{NaiveDate, Utc};
use enum_iterator::all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::compression::CompressionLayer;
use tracing::{debug, info};

use crate::{
    dashboard::{Dashboard, Tab, ViewError},
    env::EnvConfig,
    health::HealthCheckable,
    metawin::WeeklyEventActivity,
    time_windows::TimeWindow,
};

/// Views only change when the day rolls over.
const TAB_CACHE_CONTROL: &str = "public, max-age=60, stale-while-revalidate=600";

pub type StateExtension = Extension<Arc<State>>;

type Clock = Box<dyn Fn() -> NaiveDate + Send + Sync>;

pub struct State {
    pub dashboard: Dashboard,
    today: Clock,
}

impl State {
    pub fn new(dashboard: Dashboard) -> Self {
        Self::new_with_clock(dashboard, || Utc::now().date_naive())
    }

    pub fn new_with_clock(
        dashboard: Dashboard,
        today: impl Fn() -> NaiveDate + Send + Sync + 'static,
    ) -> Self {
        Self {
            dashboard,
            today: Box::new(today),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TabParams {
    time_window: Option<String>,
}

#[derive(Serialize)]
struct TimeWindowOption {
    key: &'static str,
    label: &'static str,
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "message": message }))).into_response()
}

async fn get_time_windows() -> impl IntoResponse {
    let options = all::<TimeWindow>()
        .map(|window| TimeWindowOption {
            key: window.key(),
            label: window.label(),
        })
        .collect::<Vec<_>>();

    Json(options)
}

async fn get_tab(
    Extension(state): StateExtension,
    Path(tab): Path<String>,
    Query(params): Query<TabParams>,
) -> Response {
    let tab = match tab.parse::<Tab>() {
        Ok(tab) => tab,
        Err(err) => return error_response(StatusCode::NOT_FOUND, err.to_string()),
    };

    let time_window = match params.time_window.as_deref().unwrap_or("all").parse::<TimeWindow>() {
        Ok(time_window) => time_window,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, err.to_string()),
    };

    let today = (state.today)();
    debug!(%tab, time_window = time_window.key(), %today, "tab view requested");

    match state.dashboard.view(tab, time_window, today) {
        Err(err @ ViewError::NotImplemented(_)) => {
            error_response(StatusCode::NOT_IMPLEMENTED, err.to_string())
        }
        Ok(view) => {
            let mut headers = HeaderMap::new();
            headers.insert(
                header::CACHE_CONTROL,
                HeaderValue::from_static(TAB_CACHE_CONTROL),
            );
            (headers, Json(&*view)).into_response()
        }
    }
}

pub fn router(state: Arc<State>) -> Router {
    Router::new()
        .route("/api/v1/time-windows", get(get_time_windows))
        .route("/api/v1/tabs/:tab", get(get_tab))
        .route(
            "/healthz",
            get(|Extension(state): StateExtension| async move {
                state.dashboard.health_status().into_response()
            }),
        )
        .layer(
            ServiceBuilder::new()
                .layer(middleware::from_fn(etag_middleware::middleware_fn))
                .layer(CompressionLayer::new())
                .layer(Extension(state)),
        )
}

pub async fn start_server(
    config: &EnvConfig,
    dataset: Vec<WeeklyEventActivity>,
) -> anyhow::Result<()> {
    let row_count = dataset.len();
    let state = Arc::new(State::new(Dashboard::new(dataset)));
    let app = router(state);

    let host = if config.bind_public_interface {
        [0, 0, 0, 0]
    } else {
        [127, 0, 0, 1]
    };
    let socket_addr = SocketAddr::from((host, config.port));

    info!(%socket_addr, rows = row_count, "server listening");

    axum::Server::try_bind(&socket_addr)
        .with_context(|| format!("failed to bind {socket_addr}"))?
        .serve(app.into_make_service())
        .await
        .context("server stopped unexpectedly")
}
