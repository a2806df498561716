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

use crate::client::endpoint_url;
use reqwest::header::{ACCEPT, USER_AGENT};
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use std::error;
use std::fmt;
use std::io;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};

/// OAuth client ID used by the tado web app, accepted for device authorization.
pub const CLIENT_ID: &str = "1bb50063-6b0c-4d11-bd99-387f4a91cc46";

/// Tokens are considered expired this long before the lifetime declared by the server.
pub const EXPIRY_MARGIN: Duration = Duration::from_secs(30);

/// Upper bound on the token lifetime accepted from the server.
pub const MAX_LIFETIME: Duration = Duration::from_secs(365 * 24 * 60 * 60);

const SCOPE: &str = "offline_access";
const GRANT_DEVICE_CODE: &str = "urn:ietf:params:oauth:grant-type:device_code";
const GRANT_REFRESH_TOKEN: &str = "refresh_token";
const ERROR_AUTHORIZATION_PENDING: &str = "authorization_pending";
const ERROR_SLOW_DOWN: &str = "slow_down";
const ERROR_UNKNOWN: &str = "unknown_error";
const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
const SLOW_DOWN_INCREMENT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum AuthError {
    Internal(reqwest::Error),
    Rejected {
        status: StatusCode,
        error: String,
        description: Option<String>,
    },
    Expired,
    Io(io::Error),
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Internal(e) => write!(f, "{}", e),
            Self::Rejected {
                status,
                error,
                description: Some(d),
            } => write!(f, "authorization server returned {} ({}): {}", error, status, d),
            Self::Rejected { status, error, .. } => write!(f, "authorization server returned {} ({})", error, status),
            Self::Expired => write!(f, "device code expired before authorization completed"),
            Self::Io(e) => write!(f, "{}", e),
        }
    }
}

impl error::Error for AuthError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Internal(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

/// How the exporter waits for the operator to approve the device at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFlow {
    /// Poll the token endpoint at the interval requested by the server.
    Poll,
    /// Wait for the operator to press enter, then exchange the device code once.
    Prompt,
}

impl fmt::Display for DeviceFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Poll => write!(f, "poll"),
            Self::Prompt => write!(f, "prompt"),
        }
    }
}

impl FromStr for DeviceFlow {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "poll" => Ok(Self::Poll),
            "prompt" => Ok(Self::Prompt),
            _ => Err(format!("unknown device flow '{}', expected 'poll' or 'prompt'", s)),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub verification_uri_complete: Option<String>,
    pub expires_in: u64,
    pub interval: Option<u64>,
}

impl DeviceAuthorization {
    /// URL the operator should open, including the user code when the server provides one.
    pub fn url(&self) -> &str {
        self.verification_uri_complete
            .as_deref()
            .unwrap_or(&self.verification_uri)
    }
}

#[derive(Deserialize, Debug)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: u64,
}

#[derive(Deserialize, Debug)]
struct TokenErrorResponse {
    error: String,
    error_description: Option<String>,
}

/// Access and refresh token pair along with the instant the pair stops being usable.
#[derive(Clone)]
pub struct Token {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: Instant,
}

impl Token {
    pub fn new(access_token: String, refresh_token: String, expires_at: Instant) -> Self {
        Token {
            access_token,
            refresh_token,
            expires_at,
        }
    }

    /// Build a token from a token endpoint response received at `issued_at`.
    ///
    /// Expiry is the declared lifetime, capped at `MAX_LIFETIME`, minus `EXPIRY_MARGIN`.
    pub fn issued(res: TokenResponse, issued_at: Instant) -> Self {
        let lifetime = Duration::from_secs(res.expires_in).min(MAX_LIFETIME);
        let expires_at = issued_at
            .checked_add(lifetime)
            .and_then(|t| t.checked_sub(EXPIRY_MARGIN))
            .unwrap_or(issued_at);

        Token {
            access_token: res.access_token,
            refresh_token: res.refresh_token.unwrap_or_default(),
            expires_at,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

// Never print token secrets.
impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Client for the device authorization and token endpoints of the tado login service.
#[derive(Debug, Clone)]
pub struct OAuthClient {
    client: Client,
    base_url: Url,
    client_id: String,
}

impl OAuthClient {
    const USER_AGENT: &'static str = "tado_exporter Prometheus Exporter";
    const JSON_RESPONSE: &'static str = "application/json";

    pub fn new(client: Client, base_url: Url) -> Self {
        OAuthClient {
            client,
            base_url,
            client_id: CLIENT_ID.to_owned(),
        }
    }

    pub async fn device_authorization(&self) -> Result<DeviceAuthorization, AuthError> {
        let url = endpoint_url(&self.base_url, &["device_authorize"]);
        tracing::debug!(message = "requesting device authorization", url = %url);

        let res = self
            .client
            .post(url)
            .header(USER_AGENT, Self::USER_AGENT)
            .header(ACCEPT, Self::JSON_RESPONSE)
            .form(&[("client_id", self.client_id.as_str()), ("scope", SCOPE)])
            .send()
            .await
            .map_err(AuthError::Internal)?;

        let status = res.status();
        if status.is_success() {
            res.json::<DeviceAuthorization>().await.map_err(AuthError::Internal)
        } else {
            Err(Self::rejection(status, res).await)
        }
    }

    /// Exchange an approved device code for a token pair.
    pub async fn device_token(&self, auth: &DeviceAuthorization) -> Result<Token, AuthError> {
        self.token_request(&[
            ("client_id", self.client_id.as_str()),
            ("device_code", auth.device_code.as_str()),
            ("grant_type", GRANT_DEVICE_CODE),
        ])
        .await
    }

    /// Exchange a device code for a token pair, polling until the operator approves it.
    pub async fn poll_device_token(&self, auth: &DeviceAuthorization) -> Result<Token, AuthError> {
        let deadline = Instant::now() + Duration::from_secs(auth.expires_in);
        let mut interval = Duration::from_secs(auth.interval.unwrap_or(DEFAULT_POLL_INTERVAL_SECS));

        loop {
            tokio::time::sleep(interval).await;
            if Instant::now() >= deadline {
                return Err(AuthError::Expired);
            }

            match self.device_token(auth).await {
                Ok(token) => return Ok(token),
                Err(AuthError::Rejected { error, .. }) if error == ERROR_AUTHORIZATION_PENDING => {
                    tracing::debug!(message = "device authorization pending");
                }
                Err(AuthError::Rejected { error, .. }) if error == ERROR_SLOW_DOWN => {
                    interval += SLOW_DOWN_INCREMENT;
                    tracing::debug!(message = "slowing down device authorization polling", interval_secs = interval.as_secs());
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn refresh_token(&self, refresh_token: &str) -> Result<Token, AuthError> {
        self.token_request(&[
            ("client_id", self.client_id.as_str()),
            ("grant_type", GRANT_REFRESH_TOKEN),
            ("refresh_token", refresh_token),
        ])
        .await
    }

    /// Make a request to the token endpoint. The returned token expires relative to the
    /// instant the request was sent.
    async fn token_request(&self, form: &[(&str, &str)]) -> Result<Token, AuthError> {
        let url = endpoint_url(&self.base_url, &["token"]);
        tracing::debug!(message = "making token request", url = %url);

        let issued_at = Instant::now();

        let res = self
            .client
            .post(url)
            .header(USER_AGENT, Self::USER_AGENT)
            .header(ACCEPT, Self::JSON_RESPONSE)
            .form(form)
            .send()
            .await
            .map_err(AuthError::Internal)?;

        let status = res.status();
        if status.is_success() {
            let body = res.json::<TokenResponse>().await.map_err(AuthError::Internal)?;
            Ok(Token::issued(body, issued_at))
        } else {
            Err(Self::rejection(status, res).await)
        }
    }

    async fn rejection(status: StatusCode, res: reqwest::Response) -> AuthError {
        match res.json::<TokenErrorResponse>().await {
            Ok(body) => AuthError::Rejected {
                status,
                error: body.error,
                description: body.error_description,
            },
            Err(_) => AuthError::Rejected {
                status,
                error: ERROR_UNKNOWN.to_owned(),
                description: None,
            },
        }
    }
}

/// Owner of the single live token, refreshing it on request.
#[derive(Debug)]
pub struct TokenManager {
    client: OAuthClient,
    token: Token,
}

impl TokenManager {
    pub fn new(client: OAuthClient, token: Token) -> Self {
        TokenManager { client, token }
    }

    /// Run the device authorization flow, blocking until the operator approves access.
    pub async fn authenticate(client: OAuthClient, flow: DeviceFlow) -> Result<Self, AuthError> {
        let auth = client.device_authorization().await?;
        tracing::info!(
            message = "waiting for device authorization",
            url = %auth.url(),
            user_code = %auth.user_code,
            flow = %flow,
        );

        println!("Open {} to authorize this exporter (code {})", auth.url(), auth.user_code);

        let token = match flow {
            DeviceFlow::Poll => client.poll_device_token(&auth).await?,
            DeviceFlow::Prompt => {
                println!("Press enter once access has been granted");
                let mut line = String::new();
                BufReader::new(tokio::io::stdin())
                    .read_line(&mut line)
                    .await
                    .map_err(AuthError::Io)?;

                client.device_token(&auth).await?
            }
        };

        tracing::info!(message = "device authorized", expires_in_secs = token.expires_at.saturating_duration_since(Instant::now()).as_secs());
        Ok(TokenManager { client, token })
    }

    pub fn token(&self) -> &Token {
        &self.token
    }

    pub fn access_token(&self) -> &str {
        &self.token.access_token
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.token.is_expired(now)
    }

    /// Replace the current token with a refreshed one.
    ///
    /// The current token is left in place if the refresh fails. If the server does not
    /// rotate the refresh token, the existing one is kept.
    pub async fn refresh(&mut self) -> Result<(), AuthError> {
        let mut token = self.client.refresh_token(&self.token.refresh_token).await?;
        if token.refresh_token.is_empty() {
            token.refresh_token = self.token.refresh_token.clone();
        }

        self.token = token;
        Ok(())
    }
}
