use std::time::Duration;

use crux_core::Request;
use crux_http::protocol::{HttpRequest, HttpResponse, HttpResult};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::{Inbound, ShellError};

/// Runs HTTP effects on a shared reqwest client. Each request is its own
/// task; the request comes back to the loop together with its result.
#[derive(Clone)]
pub struct HttpExecutor {
    client: reqwest::Client,
    inbound: UnboundedSender<Inbound>,
}

impl HttpExecutor {
    pub fn new(timeout_ms: u64, inbound: UnboundedSender<Inbound>) -> Result<Self, ShellError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("ride-core/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|e| ShellError::Http(e.to_string()))?;
        Ok(Self { client, inbound })
    }

    pub fn spawn(&self, request: Request<HttpRequest>) {
        let this = self.clone();
        tokio::spawn(async move {
            let result = this.send(&request.operation).await;
            if this.inbound.send(Inbound::Http { request, result }).is_err() {
                debug!("core gone, dropping response");
            }
        });
    }

    #[instrument(skip_all, fields(method = %request.method, url = %request.url))]
    async fn send(&self, request: &HttpRequest) -> HttpResult {
        let method = match reqwest::Method::from_bytes(request.method.as_bytes()) {
            Ok(method) => method,
            Err(e) => return HttpResult::Err(crux_http::Error::Url(e.to_string())),
        };

        let mut builder = self
            .client
            .request(method, &request.url)
            .header("X-Request-Id", Uuid::new_v4().to_string());
        for header in &request.headers {
            builder = builder.header(&header.name, &header.value);
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                warn!("request timed out");
                return HttpResult::Err(crux_http::Error::Timeout);
            }
            Err(e) => {
                warn!(error = %e, "request failed");
                return HttpResult::Err(crux_http::Error::Io(e.to_string()));
            }
        };

        let mut reply = HttpResponse::status(response.status().as_u16());
        for (name, value) in response.headers() {
            match value.to_str() {
                Ok(value) => {
                    reply.header(name.as_str(), value);
                }
                Err(_) => debug!(header = name.as_str(), "response header skipped"),
            }
        }
        match response.bytes().await {
            Ok(body) => {
                debug!(bytes = body.len(), "response received");
                reply.body(body.to_vec());
                HttpResult::Ok(reply.build())
            }
            Err(e) if e.is_timeout() => HttpResult::Err(crux_http::Error::Timeout),
            Err(e) => HttpResult::Err(crux_http::Error::Io(e.to_string())),
        }
    }
}
