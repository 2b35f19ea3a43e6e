// Copyright 2025 Sense Dispatch Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! Gateway configuration.

use reqwest::Url;
use sense_dispatch_core::pipeline::ConfigError;
use std::time::Duration;

/// Default request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default `User-Agent` header.
pub const DEFAULT_USER_AGENT: &str = concat!("sense-dispatch/", env!("CARGO_PKG_VERSION"));

/// Configuration for [`GatewaySender`](crate::GatewaySender).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    /// Endpoint receiving one POST per message
    pub url: Url,

    /// Per-request timeout
    pub timeout: Duration,

    /// Value of the `User-Agent` header
    pub user_agent: String,
}

impl GatewayConfig {
    /// Creates a new builder.
    #[must_use]
    pub fn builder() -> GatewayConfigBuilder {
        GatewayConfigBuilder::default()
    }
}

/// Builder for [`GatewayConfig`].
#[derive(Debug, Default)]
pub struct GatewayConfigBuilder {
    url: Option<String>,
    timeout: Option<Duration>,
    user_agent: Option<String>,
}

impl GatewayConfigBuilder {
    /// Sets the gateway URL (required).
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Sets the request timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the `User-Agent` header.
    #[must_use]
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is missing, does not parse, or is not
    /// `http`/`https`, or if the timeout is zero.
    pub fn build(self) -> Result<GatewayConfig, ConfigError> {
        let url = self.url.ok_or(ConfigError::MissingRequired { field: "url" })?;
        let url = parse_http_url("url", &url)?;

        let timeout = self.timeout.unwrap_or(DEFAULT_TIMEOUT);
        if timeout.is_zero() {
            return Err(ConfigError::invalid("timeout", "must be greater than zero"));
        }

        Ok(GatewayConfig {
            url,
            timeout,
            user_agent: self
                .user_agent
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
        })
    }
}

/// Parses `value` and accepts only `http` and `https` URLs.
pub(crate) fn parse_http_url(field: &'static str, value: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(value).map_err(|e| ConfigError::invalid(field, e.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ConfigError::invalid(
            field,
            format!("unsupported scheme '{other}', expected http or https"),
        )),
    }
}
