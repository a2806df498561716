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

//! Prometheus metrics exporter for tado° thermostats
//!
//! ## Features
//!
//! `tado_exporter` fetches per-room climate readings for every home of a [tado°] account and
//! emits them as Prometheus metrics. Rooms are fetched from the tado API each time the exporter
//! is scraped, nothing is cached between scrapes. The following metrics are emitted for each
//! room.
//!
//! * `tado_temperature{room=$ROOM, home=$HOME}` - Temperature inside the room, in degrees celsius.
//! * `tado_humidity{room=$ROOM, home=$HOME}` - Relative humidity (0-100).
//! * `tado_set_temperature{room=$ROOM, home=$HOME}` - Target temperature, in degrees celsius.
//! * `tado_heating_power{room=$ROOM, home=$HOME}` - Heating power (0-100).
//!
//! Each home is also preceded by metrics about the request made to fetch its rooms.
//!
//! * `tado_api_status_code{home=$HOME}` - HTTP status code returned by the tado API.
//! * `tado_ratelimit_remaining{home=$HOME, type=$POLICY, refill=$REFILL}` - Requests remaining
//!   in the current rate limit window. `refill` is the `t` value of the `ratelimit` header and
//!   is a label, not a value: each new refill count starts a new series. Use
//!   `metric_relabel_configs` to drop the label if series churn matters.
//!
//! If the tado API returns an error for a home, the scrape stops after the status code and
//! rate limit metrics of that home.
//!
//! [tado°]: https://www.tado.com/
//!
//! ## Build
//!
//! `tado_exporter` is a Rust program and must be built from source using a
//! [Rust toolchain](https://rustup.rs/).
//!
//! ```text
//! cargo build --release
//! ```
//!
//! ## Usage
//!
//! ### Authorizing
//!
//! On startup `tado_exporter` uses the OAuth device authorization flow to get access to your
//! account. It prints a URL to open in a browser and waits until you have logged in and granted
//! access. By default it polls tado until access is granted, run with `--device-flow prompt`
//! to instead press enter once you are done.
//!
//! ```text
//! ./tado_exporter
//! Open https://login.tado.com/oauth2/device?user_code=ABC123 to authorize this exporter (code ABC123)
//! ```
//!
//! Tokens are kept in memory only and refreshed as needed. Restarting the exporter requires
//! authorizing again.
//!
//! ### Prometheus
//!
//! Prometheus metrics are exposed on `127.0.0.1:8005` at `/metrics`. Use `--bind` to listen
//! on a different address. Keep in mind that each scrape makes a request to the tado API
//! per home and tado enforces a daily request limit, so pick a scrape interval accordingly.
//!
//! ```yaml
//! scrape_configs:
//! - job_name: tado_exporter
//!   scrape_interval: 5m
//!   static_configs:
//!   - targets: ['localhost:8005']
//! ```
//!

pub mod auth;
pub mod client;
pub mod http;
pub mod metrics;
pub mod ratelimit;
