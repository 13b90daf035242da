use http_body_util::{BodyExt, Full};
use hyper::Request;
use hyper::body::{Body, Bytes, Incoming};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use std::borrow::Cow;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::UpstreamConfig;
use crate::error::{Error, Result};

/// HTTP client for an OpenAI-compatible `chat/completions` endpoint.
///
/// One attempt per request: failures surface to the caller unchanged.
#[derive(Clone)]
pub struct UpstreamClient {
    client: Client<hyper_rustls::HttpsConnector<HttpConnector>, Full<Bytes>>,
    url: String,
}

impl UpstreamClient {
    pub fn new(config: &UpstreamConfig) -> Self {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_connect_timeout(Some(Duration::from_secs(config.connect_timeout_secs)));

        // Plain http is allowed so the relay can sit in front of a local gateway
        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http);

        let client = Client::builder(TokioExecutor::new()).build(connector);

        Self {
            client,
            url: config.completions_url(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Send a streaming completion request and return the response once headers arrive.
    ///
    /// Non-success statuses are read in full and returned as [`Error::Upstream`].
    pub async fn send_streaming_request(
        &self,
        body: Bytes,
        api_key: &str,
    ) -> Result<hyper::Response<Incoming>> {
        let headers = super::request::build_headers(api_key);

        debug!(url = %self.url, bytes = body.len(), "Sending streaming request upstream");

        let response = self.post_raw(&self.url, &headers, body).await?;
        let status = response.status();

        if !status.is_success() {
            let body_bytes = response
                .into_body()
                .collect()
                .await
                .map(|b| b.to_bytes())
                .unwrap_or_default();
            let message = String::from_utf8_lossy(&body_bytes).to_string();
            let preview: String = message.chars().take(500).collect();

            warn!(status = status.as_u16(), error_body = %preview, "Upstream returned non-success status");
            return Err(Error::Upstream {
                status: status.as_u16(),
                body: message,
            });
        }

        if response.body().is_end_stream() {
            warn!("Upstream accepted the request but sent no stream body");
            return Err(Error::upstream_unreachable("upstream returned no stream body"));
        }

        Ok(response)
    }

    async fn post_raw(
        &self,
        url: &str,
        headers: &[(Cow<'static, str>, Cow<'static, str>)],
        body: Bytes,
    ) -> Result<hyper::Response<Incoming>> {
        let mut req = Request::builder().method("POST").uri(url);

        for (name, value) in headers {
            req = req.header(name.as_ref(), value.as_ref());
        }

        let req = req
            .body(Full::new(body))
            .map_err(|e| Error::Http(e.to_string()))?;

        self.client.request(req).await.map_err(|e| {
            let detail = std::error::Error::source(&e)
                .map(|source| format!("{e}: {source}"))
                .unwrap_or_else(|| e.to_string());
            warn!(error = %detail, "Upstream request failed");
            Error::upstream_unreachable(["upstream unreachable: ", &detail].concat())
        })
    }
}

impl Default for UpstreamClient {
    fn default() -> Self {
        Self::new(&UpstreamConfig::default())
    }
}
