//! Controller metrics
//!
//! Exported in the Prometheus text format on `GET /metrics`.

use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::convert::Infallible;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

lazy_static! {
    /// Controller metrics registry
    pub static ref CONTROLLER_METRICS_REGISTRY: Registry = Registry::new();

    /// Ingress reconciliation duration
    static ref INGRESS_RECONCILIATION_DURATION: HistogramVec = {
        let opts = HistogramOpts::new(
            "ingress_reconciliation_duration_seconds",
            "Ingress reconciliation duration in seconds",
        );
        let histogram = HistogramVec::new(opts, &["ingress", "namespace"])
            .expect("Failed to create histogram");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(histogram.clone()))
            .expect("Failed to register histogram");
        histogram
    };

    /// Ingress reconciliations total
    static ref INGRESS_RECONCILIATIONS_TOTAL: IntCounterVec = {
        let opts = Opts::new(
            "ingress_reconciliations_total",
            "Total number of ingress reconciliations",
        );
        let counter = IntCounterVec::new(opts, &["ingress", "namespace", "result"])
            .expect("Failed to create counter");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };

    /// BFE reload requests by family
    static ref BFE_RELOADS_TOTAL: IntCounterVec = {
        let opts = Opts::new(
            "bfe_reloads_total",
            "Total number of reload requests sent to BFE",
        );
        let counter = IntCounterVec::new(opts, &["family", "result"])
            .expect("Failed to create counter");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };

    /// Config dumps
    static ref CONFIG_DUMPS_TOTAL: IntCounterVec = {
        let opts = Opts::new(
            "bfe_config_dumps_total",
            "Total number of config dumps to disk",
        );
        let counter = IntCounterVec::new(opts, &["result"])
            .expect("Failed to create counter");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };
}

/// Record Ingress reconciliation
pub fn record_ingress_reconciliation(
    ingress: &str,
    namespace: &str,
    duration_secs: f64,
    result: &str,
) {
    INGRESS_RECONCILIATION_DURATION
        .with_label_values(&[ingress, namespace])
        .observe(duration_secs);

    INGRESS_RECONCILIATIONS_TOTAL
        .with_label_values(&[ingress, namespace, result])
        .inc();
}

/// Record one reload request for an artifact family
pub fn record_reload(family: &str, result: &str) {
    BFE_RELOADS_TOTAL.with_label_values(&[family, result]).inc();
}

pub fn record_dump(result: &str) {
    CONFIG_DUMPS_TOTAL.with_label_values(&[result]).inc();
}

/// Gather controller metrics
pub fn gather_controller_metrics() -> Result<String, String> {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = CONTROLLER_METRICS_REGISTRY.gather();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    String::from_utf8(buffer).map_err(|e| format!("Failed to convert to UTF-8: {}", e))
}

fn metrics_response(req: &Request<hyper::body::Incoming>) -> Response<Full<Bytes>> {
    if req.uri().path() != "/metrics" || *req.method() != Method::GET {
        return plain(StatusCode::NOT_FOUND, "not found");
    }

    match gather_controller_metrics() {
        Ok(body) => plain(StatusCode::OK, body),
        Err(e) => {
            error!("{}", e);
            plain(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    }
}

fn plain(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    response
}

/// Serve `/metrics` on `bind_addr` until `token` is cancelled
pub async fn serve_metrics(bind_addr: &str, token: CancellationToken) -> Result<(), String> {
    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| format!("Failed to bind metrics endpoint to {}: {}", bind_addr, e))?;

    info!("Metrics endpoint listening on {}", bind_addr);

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                info!("Metrics endpoint on {} stopped", bind_addr);
                return Ok(());
            }
            result = listener.accept() => {
                let (stream, peer_addr) = match result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Accept error on {}: {}", bind_addr, e);
                        continue;
                    }
                };
                debug!("Metrics scrape from {}", peer_addr);

                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(|req: Request<hyper::body::Incoming>| async move {
                        Ok::<_, Infallible>(metrics_response(&req))
                    });
                    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                        debug!("Metrics connection error: {}", e);
                    }
                });
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_ingress_reconciliation_is_exported() {
        record_ingress_reconciliation("web", "default", 0.01, "success");

        let output = gather_controller_metrics().unwrap();
        assert!(output.contains("ingress_reconciliation_duration_seconds"));
        assert!(output.contains("ingress_reconciliations_total"));
        assert!(output.contains(r#"result="success""#));
    }

    #[test]
    fn test_reload_and_dump_counters() {
        record_reload("server_data_conf", "error");
        record_dump("success");

        let output = gather_controller_metrics().unwrap();
        assert!(output.contains(r#"bfe_reloads_total{family="server_data_conf",result="error"}"#));
        assert!(output.contains("bfe_config_dumps_total"));
    }

    #[tokio::test]
    async fn test_metrics_endpoint_serves_registry() {
        use http_body_util::{BodyExt, Empty};
        use hyper_util::client::legacy::Client;
        use hyper_util::rt::TokioExecutor;

        record_dump("success");

        // Reserve a free port, then hand it to the server
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = probe.local_addr().unwrap().to_string();
        drop(probe);

        let token = CancellationToken::new();
        let server = tokio::spawn({
            let addr = addr.clone();
            let token = token.clone();
            async move { serve_metrics(&addr, token).await }
        });

        let client = Client::builder(TokioExecutor::new()).build_http::<Empty<Bytes>>();
        let mut body = String::new();
        for _ in 0..50 {
            let uri: hyper::Uri = format!("http://{}/metrics", addr).parse().unwrap();
            if let Ok(response) = client.get(uri).await {
                assert_eq!(response.status(), StatusCode::OK);
                let bytes = response.into_body().collect().await.unwrap().to_bytes();
                body = String::from_utf8(bytes.to_vec()).unwrap();
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(body.contains("bfe_config_dumps_total"));

        let uri: hyper::Uri = format!("http://{}/other", addr).parse().unwrap();
        let response = client.get(uri).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        token.cancel();
        assert!(server.await.unwrap().is_ok());
    }
}
