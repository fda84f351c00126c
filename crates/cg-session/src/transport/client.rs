//! reqwest-backed transport

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use cg_core::{Config, Error, Result};

use super::{CONTENT_TYPE, HttpRequest, HttpResponse, Transport};

/// Transport over a shared reqwest `Client`
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Create a transport with the given per-request timeout
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(Error::Http)?;

        Ok(Self { client })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(config.request_timeout())
    }

    /// Wrap an existing client
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse> {
        debug!("{} {}", request.method, request.url);

        let mut builder = self.client.request(request.method.clone(), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            if request.header(CONTENT_TYPE).is_none() {
                builder = builder.header(CONTENT_TYPE, "application/json");
            }
            builder = builder.body(serde_json::to_vec(body)?);
        }

        let response = builder.send().await.map_err(Error::Http)?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();
        let body = response.bytes().await.map_err(Error::Http)?;

        debug!("{} {} -> {}", request.method, request.url, status);

        Ok(HttpResponse { status, headers, body })
    }
}
