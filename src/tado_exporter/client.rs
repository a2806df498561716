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

use crate::ratelimit::{RateLimit, RATELIMIT_HEADER};
use reqwest::header::{ACCEPT, USER_AGENT};
use reqwest::{Client, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::error;
use std::fmt;

pub type HomeId = u64;

#[derive(Debug)]
pub enum ClientError {
    Internal(reqwest::Error),
    Decode(reqwest::Error),
    Unexpected(StatusCode, Url, String),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Internal(e) => write!(f, "{}", e),
            Self::Decode(e) => write!(f, "unable to decode response: {}", e),
            Self::Unexpected(status, url, _) => write!(f, "unexpected status {} for {}", status, url),
        }
    }
}

impl error::Error for ClientError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Internal(e) => Some(e),
            Self::Decode(e) => Some(e),
            _ => None,
        }
    }
}

/// Parse a URL that further path segments can be appended to.
pub fn parse_base_url(s: &str) -> Result<Url, String> {
    let url = Url::parse(s).map_err(|e| format!("invalid URL {}: {}", s, e))?;
    if url.cannot_be_a_base() {
        return Err(format!("URL {} cannot be used as a base", s));
    }

    Ok(url)
}

/// Append `segments` to the path of `base`.
///
/// # Panics
///
/// If `base` cannot be a base URL. Base URLs are validated by `parse_base_url`.
pub(crate) fn endpoint_url(base: &Url, segments: &[&str]) -> Url {
    let mut url = base.clone();
    {
        url.path_segments_mut()
            .map(|mut p| {
                p.pop_if_empty().extend(segments);
            })
            .expect("unable to modify URL path segments");
    }

    url
}

#[derive(Debug, Clone)]
pub struct TadoClient {
    client: Client,
    api_url: Url,
    hops_url: Url,
}

impl TadoClient {
    const USER_AGENT: &'static str = "tado_exporter Prometheus Exporter";
    const JSON_RESPONSE: &'static str = "application/json";

    pub fn new(client: Client, api_url: Url, hops_url: Url) -> Self {
        TadoClient {
            client,
            api_url,
            hops_url,
        }
    }

    /// Fetch the profile of the authenticated user, including the homes they belong to.
    pub async fn me(&self, token: &str) -> Result<Me, ClientError> {
        let url = endpoint_url(&self.api_url, &["me"]);
        tracing::debug!(message = "making account identity request", url = %url);

        let res = self.make_request(token, url.clone()).await?;
        let status = res.status();
        if !is_success(status) {
            return Err(unexpected(status, url, res).await);
        }

        res.json::<Me>().await.map_err(ClientError::Decode)
    }

    /// Request the rooms of a home.
    ///
    /// The returned response exposes the status code and rate limit of the request
    /// before the body is examined, both are available even when the request failed.
    pub async fn rooms(&self, token: &str, home: HomeId) -> Result<RoomsResponse, ClientError> {
        let home = home.to_string();
        let mut url = endpoint_url(&self.hops_url, &["homes", home.as_str(), "rooms"]);
        url.query_pairs_mut().append_pair("ngsw-bypass", "true");
        tracing::debug!(message = "making rooms request", url = %url);

        let res = self.make_request(token, url.clone()).await?;
        let rate_limit = res
            .headers()
            .get(RATELIMIT_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(RateLimit::from_header)
            .unwrap_or_default();

        Ok(RoomsResponse { url, rate_limit, res })
    }

    async fn make_request(&self, token: &str, url: Url) -> Result<Response, ClientError> {
        self.client
            .get(url)
            .bearer_auth(token)
            .header(USER_AGENT, Self::USER_AGENT)
            .header(ACCEPT, Self::JSON_RESPONSE)
            .send()
            .await
            .map_err(ClientError::Internal)
    }
}

/// Response to a rooms request whose body has not been read yet.
#[derive(Debug)]
pub struct RoomsResponse {
    url: Url,
    rate_limit: RateLimit,
    res: Response,
}

impl RoomsResponse {
    pub fn status(&self) -> StatusCode {
        self.res.status()
    }

    pub fn rate_limit(&self) -> &RateLimit {
        &self.rate_limit
    }

    /// Decode the rooms in the body, or return `ClientError::Unexpected` with the body
    /// when the status is not a success or redirect.
    pub async fn rooms(self) -> Result<Vec<Room>, ClientError> {
        let status = self.res.status();
        if !is_success(status) {
            return Err(unexpected(status, self.url, self.res).await);
        }

        self.res.json::<Vec<Room>>().await.map_err(ClientError::Decode)
    }
}

fn is_success(status: StatusCode) -> bool {
    (200..400).contains(&status.as_u16())
}

async fn unexpected(status: StatusCode, url: Url, res: Response) -> ClientError {
    match res.text().await {
        Ok(body) => ClientError::Unexpected(status, url, body),
        Err(e) => ClientError::Internal(e),
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct Me {
    #[serde(alias = "id")]
    pub id: Option<String>,
    #[serde(alias = "name")]
    pub name: Option<String>,
    #[serde(alias = "homes", default)]
    pub homes: Vec<Home>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct Home {
    #[serde(alias = "id")]
    pub id: HomeId,
    #[serde(alias = "name")]
    pub name: String,
}

// Sensor readings and settings are null for rooms without a sensor or switched off,
// those are read as zero.
#[derive(Serialize, Deserialize, Debug)]
pub struct Room {
    #[serde(alias = "id")]
    pub id: u64,
    #[serde(alias = "name")]
    pub name: String,
    #[serde(alias = "sensorDataPoints", default)]
    pub sensor_data_points: Option<SensorDataPoints>,
    #[serde(alias = "setting", default)]
    pub setting: Option<Setting>,
    #[serde(alias = "heatingPower", default)]
    pub heating_power: Option<Percentage>,
}

impl Room {
    pub fn temperature(&self) -> f64 {
        self.sensor_data_points
            .as_ref()
            .and_then(|s| s.inside_temperature.as_ref())
            .map(|t| t.value)
            .unwrap_or_default()
    }

    pub fn humidity(&self) -> i64 {
        self.sensor_data_points
            .as_ref()
            .and_then(|s| s.humidity.as_ref())
            .map(|h| h.percentage)
            .unwrap_or_default()
    }

    pub fn set_temperature(&self) -> f64 {
        self.setting
            .as_ref()
            .and_then(|s| s.temperature.as_ref())
            .map(|t| t.value)
            .unwrap_or_default()
    }

    pub fn heating_power(&self) -> i64 {
        self.heating_power.as_ref().map(|p| p.percentage).unwrap_or_default()
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct SensorDataPoints {
    #[serde(alias = "insideTemperature", default)]
    pub inside_temperature: Option<Temperature>,
    #[serde(alias = "humidity", default)]
    pub humidity: Option<Percentage>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct Setting {
    #[serde(alias = "power", default)]
    pub power: Option<String>,
    #[serde(alias = "temperature", default)]
    pub temperature: Option<Temperature>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct Temperature {
    #[serde(alias = "value")]
    pub value: f64,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct Percentage {
    #[serde(alias = "percentage")]
    pub percentage: i64,
}
