//! Reqwest-based implementation of the [`Transport`] trait.
//!
//! Redirect policy is a client-level setting in reqwest, so the transport keeps
//! two clients: one that never follows redirects and one limited to the
//! configured redirect count.

use std::time::Instant;

use async_trait::async_trait;
use http::Method;
use http::header::AUTHORIZATION;
use reqwest::{Client, redirect::Policy};

use super::transport::{Transport, TransportError, TransportResponse};
use super::types::Request;
use crate::config::EngineConfig;

/// Reqwest-backed transport used by default.
pub struct ReqwestTransport {
    direct: Client,
    following: Client,
    credentials: Option<(String, Option<String>)>,
}

impl ReqwestTransport {
    /// Builds both clients from the engine configuration. TLS peer
    /// verification is disabled.
    pub fn new(config: &EngineConfig) -> Result<Self, TransportError> {
        let direct = build_client(config, Policy::none())?;
        let following = build_client(config, Policy::limited(config.redirect_limit))?;

        let credentials = config
            .seed_url()
            .ok()
            .flatten()
            .filter(|url| !url.username().is_empty())
            .map(|url| {
                (
                    url.username().to_string(),
                    url.password().map(str::to_string),
                )
            });

        Ok(Self {
            direct,
            following,
            credentials,
        })
    }

}

fn build_client(config: &EngineConfig, redirect: Policy) -> Result<Client, TransportError> {
    let mut builder = Client::builder()
        .redirect(redirect)
        .danger_accept_invalid_certs(true)
        .pool_max_idle_per_host(config.max_concurrency.max(1));

    // Only the configured proxy is used, never one from the environment.
    builder = match &config.proxy {
        Some(proxy) => builder.proxy(
            proxy
                .to_reqwest()
                .map_err(|err| TransportError::Other(err.to_string()))?,
        ),
        None => builder.no_proxy(),
    };

    builder
        .build()
        .map_err(|err| TransportError::Other(err.to_string()))
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn perform(&self, request: &Request) -> Result<TransportResponse, TransportError> {
        let client = if request.follow_redirects {
            &self.following
        } else {
            &self.direct
        };

        let mut builder = client
            .request(request.method.clone(), request.url.as_str())
            .headers(request.headers.clone())
            .timeout(request.timeout);

        if let Some(ref body) = request.body {
            if !request.params.is_empty() {
                builder = builder.query(&request.params);
            }
            builder = builder.body(body.clone());
        } else if request.method == Method::POST {
            builder = builder.form(&request.params);
        } else if !request.params.is_empty() {
            builder = builder.query(&request.params);
        }

        // URLs carrying their own userinfo are authenticated by reqwest itself.
        if let Some((ref user, ref password)) = self.credentials
            && request.url.username().is_empty()
            && !request.headers.contains_key(AUTHORIZATION)
        {
            builder = builder.basic_auth(user, password.as_ref());
        }

        let started = Instant::now();
        let response = builder.send().await?;
        let start_transfer_time = started.elapsed();

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let body = response.bytes().await?;

        Ok(TransportResponse {
            status,
            headers,
            body,
            url,
            start_transfer_time,
            total_time: started.elapsed(),
        })
    }
}
