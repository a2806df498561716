// tado_exporter - Prometheus metrics exporter for tado° thermostats
//
// Copyright 2022 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use crate::auth::TokenManager;
use crate::client::{ClientError, HomeId, TadoClient};
use crate::metrics::{self, ExporterMetrics};
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus_client::registry::Registry;
use reqwest::Url;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;
use tracing::{Instrument, Level};

pub const TEXT_FORMAT: &str = "text/plain; version=0.0.4; charset=utf-8";

const EXPORTER_PREFIX: &str = "tado_exporter";

/// Token and home IDs shared by all scrapes.
#[derive(Debug)]
struct Session {
    tokens: TokenManager,
    homes: Vec<HomeId>,
}

impl Session {
    fn add_homes<I: IntoIterator<Item = HomeId>>(&mut self, homes: I) {
        for home in homes {
            if self.homes.contains(&home) {
                tracing::debug!(message = "skipping duplicate home", home = home);
                continue;
            }

            self.homes.push(home);
        }
    }
}

/// State for handling scrapes: the tado API client and the session it authenticates with.
///
/// The session is locked for the duration of each scrape so that concurrent scrapes
/// never refresh the token or resolve homes more than once.
#[derive(Debug)]
pub struct RequestContext {
    client: TadoClient,
    session: Mutex<Session>,
    registry: Registry,
    metrics: ExporterMetrics,
    exporter_metrics: bool,
}

impl RequestContext {
    pub fn new(client: TadoClient, tokens: TokenManager) -> Self {
        let mut registry = Registry::with_prefix(EXPORTER_PREFIX);
        let metrics = ExporterMetrics::new(&mut registry);

        RequestContext {
            client,
            session: Mutex::new(Session {
                tokens,
                homes: Vec::new(),
            }),
            registry,
            metrics,
            exporter_metrics: false,
        }
    }

    /// Include counters about the exporter itself at the start of each scrape.
    pub fn with_exporter_metrics(mut self, enabled: bool) -> Self {
        self.exporter_metrics = enabled;
        self
    }

    /// Fetch rooms for every home of the account and render them as text metrics.
    ///
    /// An unexpected status from the tado API ends the scrape early: whatever was written
    /// before the failure is returned and no further homes are requested. Transport and
    /// decoding errors are returned as errors.
    pub async fn scrape(&self) -> Result<String, ClientError> {
        let mut session = self.session.lock().await;
        let mut out = String::new();

        self.metrics.scrape();
        if self.exporter_metrics {
            self.encode_exporter_metrics(&mut out);
        }

        if session.tokens.is_expired(Instant::now()) {
            tracing::info!(message = "access token expired, refreshing");
            match session.tokens.refresh().await {
                Ok(()) => {
                    self.metrics.token_refresh(true);
                    tracing::info!(message = "refreshed access token");
                }
                Err(e) => {
                    self.metrics.token_refresh(false);
                    tracing::warn!(message = "failed to refresh access token, using expired token", error = %e);
                }
            }
        }

        if session.homes.is_empty() {
            let me = self.client.me(session.tokens.access_token()).await;
            match me {
                Ok(me) => {
                    session.add_homes(me.homes.iter().map(|h| h.id));
                    tracing::info!(message = "resolved homes", homes = ?session.homes);
                }
                Err(ClientError::Unexpected(status, url, body)) => {
                    self.upstream_failure(status, &url, &body);
                    return Ok(out);
                }
                Err(e) => return Err(e),
            }
        }

        for &home in session.homes.iter() {
            let res = self.client.rooms(session.tokens.access_token(), home).await?;
            metrics::write_service_health(&mut out, home, res.status(), res.rate_limit());

            match res.rooms().await {
                Ok(rooms) => {
                    tracing::debug!(message = "fetched rooms", home = home, num_rooms = rooms.len());
                    metrics::write_rooms(&mut out, home, &rooms);
                }
                Err(ClientError::Unexpected(status, url, body)) => {
                    self.upstream_failure(status, &url, &body);
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(out)
    }

    fn upstream_failure(&self, status: StatusCode, url: &Url, body: &str) {
        self.metrics.upstream_failure();
        tracing::warn!(
            message = "unexpected response from tado API",
            status = %status,
            url = %url,
            body = %body,
        );
        tracing::error!(message = "stopping scrape after tado API failure", status = %status);
    }

    fn encode_exporter_metrics(&self, out: &mut String) {
        match metrics::encode_text(&self.registry) {
            Ok(buf) => out.push_str(&buf),
            Err(e) => {
                tracing::error!(message = "error encoding exporter metrics", error = %e);
            }
        }
    }
}

/// Build the router serving `GET /metrics`.
pub fn text_metrics(context: Arc<RequestContext>) -> Router {
    Router::new()
        .route("/metrics", get(http_route))
        .layer(TraceLayer::new_for_http())
        .with_state(context)
}

async fn http_route(State(context): State<Arc<RequestContext>>) -> Response {
    match context
        .scrape()
        .instrument(tracing::span!(Level::DEBUG, "tado_scrape"))
        .await
    {
        Ok(body) => {
            tracing::debug!(message = "encoded tado metrics to text format", num_bytes = body.len());
            (StatusCode::OK, [(CONTENT_TYPE, TEXT_FORMAT)], body).into_response()
        }
        Err(e) => {
            tracing::error!(message = "error collecting tado metrics", error = %e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}
