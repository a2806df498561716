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

use clap::Parser;
use reqwest::{Client, Url};
use std::error::Error;
use std::io;
use std::net::SocketAddr;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tado_exporter::auth::{DeviceFlow, OAuthClient, TokenManager};
use tado_exporter::client::{parse_base_url, TadoClient};
use tado_exporter::http::RequestContext;
use tokio::signal::unix::{self, SignalKind};
use tracing::Level;

const DEFAULT_LOG_LEVEL: Level = Level::INFO;
const DEFAULT_BIND_ADDR: ([u8; 4], u16) = ([127, 0, 0, 1], 8005);
const DEFAULT_TIMEOUT_MILLIS: u64 = 5000;
const DEFAULT_DEVICE_FLOW: DeviceFlow = DeviceFlow::Poll;
const DEFAULT_AUTH_URL: &str = "https://login.tado.com/oauth2/";
const DEFAULT_API_URL: &str = "https://my.tado.com/api/v2/";
const DEFAULT_HOPS_URL: &str = "https://hops.tado.com/";

#[derive(Debug, Parser)]
#[clap(name = "tado_exporter", version = clap::crate_version!())]
struct TadoExporterApplication {
    /// Base URL for the tado OAuth device authorization and token endpoints
    #[clap(long, default_value = DEFAULT_AUTH_URL, value_parser = parse_base_url)]
    auth_url: Url,

    /// Base URL for the tado API used to look up the homes of the account
    #[clap(long, default_value = DEFAULT_API_URL, value_parser = parse_base_url)]
    api_url: Url,

    /// Base URL for the tado API used to fetch rooms of each home
    #[clap(long, default_value = DEFAULT_HOPS_URL, value_parser = parse_base_url)]
    hops_url: Url,

    /// How to wait for the device to be authorized at startup. 'poll' checks with tado
    /// until access has been granted, 'prompt' waits for enter to be pressed.
    #[clap(long, default_value_t = DEFAULT_DEVICE_FLOW)]
    device_flow: DeviceFlow,

    /// Logging verbosity. Allowed values are 'trace', 'debug', 'info', 'warn', and 'error'
    /// (case insensitive)
    #[clap(long, default_value_t = DEFAULT_LOG_LEVEL)]
    log_level: Level,

    /// Timeout for requests to the tado API, in milliseconds.
    #[clap(long, default_value_t = DEFAULT_TIMEOUT_MILLIS)]
    timeout_millis: u64,

    /// Include counters about the exporter itself (scrapes, token refreshes, API failures)
    /// in the metrics output.
    #[clap(long)]
    exporter_metrics: bool,

    /// Address to bind to. By default, tado_exporter will only bind to a local address
    /// since it exposes data about the rooms of your home.
    #[clap(long, default_value_t = DEFAULT_BIND_ADDR.into())]
    bind: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let opts = TadoExporterApplication::parse();
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(opts.log_level)
            .finish(),
    )
    .expect("failed to set tracing subscriber");

    let timeout = Duration::from_millis(opts.timeout_millis);
    let http_client = Client::builder().timeout(timeout).build().unwrap_or_else(|e| {
        tracing::error!(message = "unable to initialize HTTP client", error = %e);
        process::exit(1)
    });

    // Authorize before binding so that the exporter never serves requests it has no
    // way of answering. There is no retry, the operator has to start over on failure.
    let oauth = OAuthClient::new(http_client.clone(), opts.auth_url.clone());
    let tokens = TokenManager::authenticate(oauth, opts.device_flow)
        .await
        .unwrap_or_else(|e| {
            tracing::error!(message = "device authorization failed", auth_url = %opts.auth_url, error = %e);
            process::exit(1)
        });

    let client = TadoClient::new(http_client, opts.api_url.clone(), opts.hops_url.clone());
    let context = Arc::new(RequestContext::new(client, tokens).with_exporter_metrics(opts.exporter_metrics));
    let handler = tado_exporter::http::text_metrics(context);

    let server = axum::Server::try_bind(&opts.bind).unwrap_or_else(|e| {
        tracing::error!(message = "error binding to address", address = %opts.bind, error = %e);
        process::exit(1)
    });

    tracing::info!(
        message = "server started",
        address = %opts.bind,
        api_url = %opts.api_url,
        hops_url = %opts.hops_url,
    );

    server
        .serve(handler.into_make_service())
        .with_graceful_shutdown(async {
            // Wait for either SIGTERM or SIGINT to shutdown
            tokio::select! {
                _ = sigterm() => {}
                _ = sigint() => {}
            }
        })
        .await?;

    tracing::info!("server shutdown");
    Ok(())
}

/// Return after the first SIGTERM signal received by this process
async fn sigterm() -> io::Result<()> {
    unix::signal(SignalKind::terminate())?.recv().await;
    Ok(())
}

/// Return after the first SIGINT signal received by this process
async fn sigint() -> io::Result<()> {
    unix::signal(SignalKind::interrupt())?.recv().await;
    Ok(())
}
