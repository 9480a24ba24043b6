// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright 2025 The Carpocratian Church of Commonality and Equality, Inc.

//! URL loading seam between the protocol and the network.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl UrlRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            headers: vec![("accept".to_string(), "application/json".to_string())],
            body: None,
        }
    }

    pub fn json(method: Method, url: impl Into<String>, body: String) -> Self {
        Self {
            method,
            url: url.into(),
            headers: vec![
                ("accept".to_string(), "application/json".to_string()),
                ("content-type".to_string(), "application/json".to_string()),
            ],
            body: Some(body),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UrlResponse {
    pub url: String,
    pub status: StatusCode,
    pub body: String,
}

/// Executes one request. `Err` means no HTTP response arrived.
#[async_trait]
pub trait UrlLoader: Send + Sync {
    async fn load(&self, request: UrlRequest) -> Result<UrlResponse>;
}

pub struct ReqwestLoader {
    client: Client,
}

impl ReqwestLoader {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl UrlLoader for ReqwestLoader {
    async fn load(&self, request: UrlRequest) -> Result<UrlResponse> {
        debug!(method = %request.method, url = %request.url, "url request");

        let mut builder = self.client.request(request.method.clone(), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let resp = builder
            .send()
            .await
            .with_context(|| format!("{} {} failed", request.method, request.url))?;
        let status = resp.status();
        let body = resp.text().await.context("Failed to read response body")?;

        debug!(url = %request.url, status = status.as_u16(), "url response");
        Ok(UrlResponse {
            url: request.url,
            status,
            body,
        })
    }
}
