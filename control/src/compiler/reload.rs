//! Reload signal to the BFE engine
//!
//! BFE exposes `GET <monitor>/reload/<family>`; 200 means the new files were
//! loaded, anything else carries the reason in the body.

use crate::error::{CompilerError, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper::{Request, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Bytes of an error body kept in the error message
const ERROR_BODY_LIMIT: usize = 1024;

/// Tells the engine to reload one artifact family
pub trait ReloadSignal: Send + Sync + 'static {
    fn reload(&self, family: &str) -> impl Future<Output = Result<()>> + Send;
}

/// Reload signal over plain HTTP
#[derive(Clone)]
pub struct HttpReloader {
    client: Client<HttpConnector, Empty<Bytes>>,
    base_url: String,
    timeout: Duration,
}

impl HttpReloader {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self {
            client,
            base_url: base_url.into(),
            timeout,
        }
    }

    fn uri(&self, family: &str) -> Result<Uri> {
        format!("{}{}", self.base_url, family)
            .parse()
            .map_err(|e| CompilerError::reload_signal(family, format!("invalid reload url: {}", e)))
    }
}

impl ReloadSignal for HttpReloader {
    async fn reload(&self, family: &str) -> Result<()> {
        let uri = self.uri(family)?;
        debug!("Reloading {} via {}", family, uri);

        let request = Request::get(uri)
            .body(Empty::<Bytes>::new())
            .map_err(|e| CompilerError::reload_signal(family, e.to_string()))?;

        let response = tokio::time::timeout(self.timeout, self.client.request(request))
            .await
            .map_err(|_| {
                CompilerError::reload_signal(family, format!("timed out after {:?}", self.timeout))
            })?
            .map_err(|e| CompilerError::reload_signal(family, e.to_string()))?;

        let status = response.status();
        if status == StatusCode::OK {
            return Ok(());
        }

        let body = tokio::time::timeout(self.timeout, read_prefix(response.into_body()))
            .await
            .unwrap_or_default();
        Err(CompilerError::reload_signal(
            family,
            format!("status {}, {}", status.as_u16(), body),
        ))
    }
}

async fn read_prefix(mut body: Incoming) -> String {
    let mut buf = Vec::new();
    while buf.len() < ERROR_BODY_LIMIT {
        match body.frame().await {
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    buf.extend_from_slice(data);
                }
            }
            _ => break,
        }
    }
    buf.truncate(ERROR_BODY_LIMIT);
    String::from_utf8_lossy(&buf).trim().to_string()
}
