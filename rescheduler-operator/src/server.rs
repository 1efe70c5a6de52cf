//! HTTPS front end for the admission webhook and the scheduler extender.

use std::convert::Infallible;
use std::path::Path;
use std::sync::Arc;

use http_body_util::{BodyExt, Full};
use bytes::Bytes;
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::admission::{AdmissionReview, HintInjector};
use crate::config::ServerConfig;
use crate::error::{OperatorError, OperatorResult};
use crate::filter::{self, ExtenderArgs};
use crate::store::ObjectStore;

/// Shared request handling state.
pub struct WebhookState<S> {
    injector: HintInjector<S>,
}

impl<S: ObjectStore> WebhookState<S> {
    /// Wrap an injector.
    pub fn new(injector: HintInjector<S>) -> Self {
        Self { injector }
    }
}

/// Dispatch a request by method and path.
pub async fn route<S: ObjectStore>(
    state: &WebhookState<S>,
    method: &Method,
    path: &str,
    body: Bytes,
) -> Response<Full<Bytes>> {
    match (method, path) {
        (&Method::POST, "/mutate") => mutate(state, &body).await,
        (&Method::POST, "/filter") => extender_filter(&body),
        (&Method::GET, "/healthz") => health_check(),
        (&Method::GET, "/readyz") => ready_check(),
        _ => not_found(),
    }
}

async fn mutate<S: ObjectStore>(state: &WebhookState<S>, body: &[u8]) -> Response<Full<Bytes>> {
    let review: AdmissionReview = match serde_json::from_slice(body) {
        Ok(review) => review,
        Err(e) => {
            error!(error = %e, "Failed to parse AdmissionReview");
            return error_response("Invalid AdmissionReview format");
        }
    };
    let response = match review.request {
        Some(request) => state.injector.review(&request).await,
        None => {
            error!("AdmissionReview missing request");
            return error_response("Missing request in AdmissionReview");
        }
    };
    json_response(&AdmissionReview::reply(response))
}

fn extender_filter(body: &[u8]) -> Response<Full<Bytes>> {
    match serde_json::from_slice::<ExtenderArgs>(body) {
        Ok(args) => json_response(&filter::filter(&args)),
        Err(e) => {
            error!(error = %e, "Failed to parse ExtenderArgs");
            json_response(&filter::ExtenderFilterResult {
                error: format!("invalid extender args: {e}"),
                ..Default::default()
            })
        }
    }
}

fn json_response<T: serde::Serialize>(value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(json) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(json)))
            .unwrap_or_else(|e| {
                error!(error = %e, "Failed to build JSON response");
                error_response("Failed to build response")
            }),
        Err(e) => {
            error!(error = %e, "Failed to serialize response");
            error_response("Failed to serialize response")
        }
    }
}

fn build_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .unwrap_or_else(|e| {
            error!(error = %e, "Failed to build response");
            Response::new(Full::new(Bytes::from("Internal Error")))
        })
}

fn health_check() -> Response<Full<Bytes>> {
    build_response(StatusCode::OK, "OK")
}

fn ready_check() -> Response<Full<Bytes>> {
    build_response(StatusCode::OK, "Ready")
}

fn not_found() -> Response<Full<Bytes>> {
    build_response(StatusCode::NOT_FOUND, "Not Found")
}

fn error_response(message: &str) -> Response<Full<Bytes>> {
    build_response(StatusCode::BAD_REQUEST, message.to_string())
}

/// Build a TLS acceptor from PEM files.
pub async fn load_tls_acceptor(cert: &Path, key: &Path) -> OperatorResult<TlsAcceptor> {
    let cert_pem = tokio::fs::read(cert).await?;
    let key_pem = tokio::fs::read(key).await?;

    let certs = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| OperatorError::TlsError(format!("certificate chain: {e}")))?;
    if certs.is_empty() {
        return Err(OperatorError::TlsError(format!(
            "no certificates in {}",
            cert.display()
        )));
    }
    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .map_err(|e| OperatorError::TlsError(format!("private key: {e}")))?
        .ok_or_else(|| OperatorError::TlsError(format!("no private key in {}", key.display())))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut tls_config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| OperatorError::TlsError(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| OperatorError::TlsError(e.to_string()))?;
    tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

/// Accept connections until `token` is cancelled.
pub async fn serve<S: ObjectStore>(
    config: &ServerConfig,
    state: Arc<WebhookState<S>>,
    token: CancellationToken,
) -> OperatorResult<()> {
    let acceptor = load_tls_acceptor(&config.tls_cert, &config.tls_key).await?;
    info!("TLS certificates loaded successfully");

    let listener = TcpListener::bind(config.addr).await?;
    info!(addr = %config.addr, "Webhook server listening");

    loop {
        let (stream, peer) = tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    continue;
                }
            },
        };
        let acceptor = acceptor.clone();
        let state = state.clone();

        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, peer = %peer, "TLS handshake failed");
                    return;
                }
            };
            let io = hyper_util::rt::TokioIo::new(tls_stream);
            let service = hyper::service::service_fn(move |req: Request<Incoming>| {
                let state = state.clone();
                async move { Ok::<_, Infallible>(handle(&state, req).await) }
            });
            if let Err(e) = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service)
                .await
            {
                error!(error = %e, "Connection error");
            }
        });
    }

    info!("Webhook server stopped");
    Ok(())
}

async fn handle<S: ObjectStore>(
    state: &WebhookState<S>,
    req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            error!(error = %e, "Failed to read request body");
            return error_response("Failed to read request body");
        }
    };
    route(state, &method, &path, body).await
}
