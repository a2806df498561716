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

use crate::client::{HomeId, Room};
use crate::ratelimit::RateLimit;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;
use reqwest::StatusCode;
use std::fmt;

const METRIC_TEMPERATURE: &str = "tado_temperature";
const METRIC_HUMIDITY: &str = "tado_humidity";
const METRIC_SET_TEMPERATURE: &str = "tado_set_temperature";
const METRIC_HEATING_POWER: &str = "tado_heating_power";
const METRIC_STATUS_CODE: &str = "tado_api_status_code";
const METRIC_RATELIMIT_REMAINING: &str = "tado_ratelimit_remaining";

const RESULT_SUCCESS: &str = "success";
const RESULT_FAILURE: &str = "failure";

const HELP_PREFIX: &str = "# HELP ";
const TYPE_PREFIX: &str = "# TYPE ";
const COUNTER_SUFFIX: &str = " counter";
const EOF_LINE: &str = "# EOF";

/// Write one line per metric for each room of a home.
///
/// Lines for a room are always in the order temperature, humidity, set temperature
/// and heating power. Rooms are written in the order given. Each line is labeled
/// with the room name and home ID, e.g. `tado_humidity{room="Kitchen",home="123"} 52`.
pub fn write_rooms(out: &mut String, home: HomeId, rooms: &[Room]) {
    for room in rooms {
        let labels = format!("room=\"{}\",home=\"{}\"", escape_label_value(&room.name), home);
        out.push_str(&format!("{}{{{}}} {}\n", METRIC_TEMPERATURE, labels, room.temperature()));
        out.push_str(&format!("{}{{{}}} {}\n", METRIC_HUMIDITY, labels, room.humidity()));
        out.push_str(&format!("{}{{{}}} {}\n", METRIC_SET_TEMPERATURE, labels, room.set_temperature()));
        out.push_str(&format!("{}{{{}}} {}\n", METRIC_HEATING_POWER, labels, room.heating_power()));
    }
}

/// Write the status code and rate limit of the rooms request for a home.
pub fn write_service_health(out: &mut String, home: HomeId, status: StatusCode, rate_limit: &RateLimit) {
    out.push_str(&format!(
        "{}{{home=\"{}\"}} {}\n",
        METRIC_STATUS_CODE,
        home,
        status.as_u16()
    ));
    out.push_str(&format!(
        "{}{{home=\"{}\",type=\"{}\",refill=\"{}\"}} {}\n",
        METRIC_RATELIMIT_REMAINING,
        home,
        escape_label_value(&rate_limit.label),
        rate_limit.refill,
        rate_limit.remaining
    ));
}

fn escape_label_value(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

/// Encode the registry in the Prometheus text format, version 0.0.4.
///
/// prometheus-client writes OpenMetrics, where the samples of a counter family `foo` are
/// named `foo_total` and the output ends with `# EOF`. In version 0.0.4 the `HELP` and
/// `TYPE` lines must use the sample name, so counter metadata is renamed and the trailer
/// is dropped.
pub fn encode_text(reg: &Registry) -> Result<String, fmt::Error> {
    let mut buf = String::new();
    encode(&mut buf, reg)?;

    let counters: Vec<&str> = buf
        .lines()
        .filter_map(|l| l.strip_prefix(TYPE_PREFIX))
        .filter_map(|l| l.strip_suffix(COUNTER_SUFFIX))
        .collect();

    let mut out = String::with_capacity(buf.len());
    for line in buf.lines() {
        if line == EOF_LINE {
            continue;
        }

        match counter_metadata(line, &counters) {
            Some((prefix, name, rest)) => out.push_str(&format!("{}{}_total{}\n", prefix, name, rest)),
            None => {
                out.push_str(line);
                out.push('\n');
            }
        }
    }

    Ok(out)
}

fn counter_metadata<'a>(line: &'a str, counters: &[&str]) -> Option<(&'static str, &'a str, &'a str)> {
    for prefix in [HELP_PREFIX, TYPE_PREFIX] {
        if let Some(rest) = line.strip_prefix(prefix) {
            let (name, tail) = rest.split_at(rest.find(' ').unwrap_or(rest.len()));
            if counters.contains(&name) {
                return Some((prefix, name, tail));
            }
        }
    }

    None
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ResultLabels {
    result: String,
}

/// Counters describing the exporter itself rather than the rooms it reports on.
///
/// All metrics are created and registered upon call to `ExporterMetrics::new()` and
/// share the prefix of the registry they are registered with.
#[derive(Debug, Clone)]
pub struct ExporterMetrics {
    scrapes: Counter,
    token_refreshes: Family<ResultLabels, Counter>,
    upstream_failures: Counter,
}

impl ExporterMetrics {
    pub fn new(reg: &mut Registry) -> Self {
        let scrapes = Counter::default();
        let token_refreshes = Family::<ResultLabels, Counter>::default();
        let upstream_failures = Counter::default();

        reg.register("scrapes", "Number of scrapes handled", scrapes.clone());
        reg.register(
            "token_refreshes",
            "Number of access token refreshes by result",
            token_refreshes.clone(),
        );
        reg.register(
            "upstream_failures",
            "Number of tado API requests that returned an unexpected status",
            upstream_failures.clone(),
        );

        Self {
            scrapes,
            token_refreshes,
            upstream_failures,
        }
    }

    pub fn scrape(&self) {
        self.scrapes.inc();
    }

    pub fn token_refresh(&self, success: bool) {
        let result = if success { RESULT_SUCCESS } else { RESULT_FAILURE };
        self.token_refreshes
            .get_or_create(&ResultLabels {
                result: result.to_owned(),
            })
            .inc();
    }

    pub fn upstream_failure(&self) {
        self.upstream_failures.inc();
    }
}
