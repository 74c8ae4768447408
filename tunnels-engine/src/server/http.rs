//! HTTPS handshake endpoint
//!
//! `POST /v3/connect` and `POST /v3/firewall` with JSON bodies, HTTP/1.1
//! over TLS 1.3. Routing is a plain function of method, path and body so it
//! can be tested without sockets.

use std::convert::Infallible;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use serde::de::DeserializeOwned;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use super::acceptor::Acceptor;
use crate::error::{Error, ErrorKind, Result};
use crate::handshake::{ConnectRequest, FirewallRequest};

/// Largest request body accepted
const MAX_BODY: usize = 64 * 1024;

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub fn status_for(err: &Error) -> StatusCode {
    match err.kind() {
        ErrorKind::Auth => StatusCode::UNAUTHORIZED,
        ErrorKind::Congestion => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::BadInput => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Permission => StatusCode::FORBIDDEN,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Transport => StatusCode::BAD_GATEWAY,
    }
}

fn error_body(message: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({ "error": message })).unwrap_or_default()
}

fn parse<T: DeserializeOwned>(body: &[u8]) -> std::result::Result<T, (StatusCode, Vec<u8>)> {
    serde_json::from_slice(body)
        .map_err(|e| (StatusCode::BAD_REQUEST, error_body(&format!("malformed body: {}", e))))
}

fn reply<T: serde::Serialize>(result: Result<T>) -> (StatusCode, Vec<u8>) {
    match result.and_then(|value| Ok(serde_json::to_vec(&value)?)) {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => (status_for(&e), error_body(&e.to_string())),
    }
}

/// Dispatch one request
pub async fn route(
    acceptor: &Acceptor,
    method: &Method,
    path: &str,
    body: &[u8],
) -> (StatusCode, Vec<u8>) {
    match (method, path) {
        (&Method::POST, "/v3/connect") => match parse::<ConnectRequest>(body) {
            Ok(request) => reply(acceptor.handle_connect(&request).await),
            Err(rejected) => rejected,
        },
        (&Method::POST, "/v3/firewall") => match parse::<FirewallRequest>(body) {
            Ok(request) => reply(
                acceptor
                    .handle_firewall(&request)
                    .await
                    .map(|()| serde_json::json!({})),
            ),
            Err(rejected) => rejected,
        },
        _ => (StatusCode::NOT_FOUND, error_body("not found")),
    }
}

async fn handle(
    acceptor: Arc<Acceptor>,
    request: Request<Incoming>,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let (status, body) = match Limited::new(request.into_body(), MAX_BODY).collect().await {
        Ok(collected) => route(&acceptor, &method, &path, &collected.to_bytes()).await,
        Err(e) => (
            StatusCode::PAYLOAD_TOO_LARGE,
            error_body(&format!("body: {}", e)),
        ),
    };
    log::debug!("{} {} -> {}", method, path, status.as_u16());

    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(response)
}

/// TLS 1.3 acceptor from PEM certificate chain and private key
pub fn load_tls_acceptor(cert: &Path, key: &Path) -> Result<TlsAcceptor> {
    let open = |path: &Path| {
        File::open(path)
            .map(BufReader::new)
            .map_err(|e| Error::BadInput(format!("{}: {}", path.display(), e)))
    };

    let certs = rustls_pemfile::certs(&mut open(cert)?)
        .collect::<std::result::Result<Vec<CertificateDer<'static>>, _>>()
        .map_err(|e| Error::BadInput(format!("{}: {}", cert.display(), e)))?;
    if certs.is_empty() {
        return Err(Error::BadInput(format!("{}: no certificates", cert.display())));
    }
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut open(key)?)
        .map_err(|e| Error::BadInput(format!("{}: {}", key.display(), e)))?
        .ok_or_else(|| Error::BadInput(format!("{}: no private key", key.display())))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| Error::BadInput(format!("tls: {}", e)))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::BadInput(format!("tls: {}", e)))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Accept handshake connections until the listener fails
pub async fn serve(
    acceptor: Arc<Acceptor>,
    listener: Arc<TcpListener>,
    tls: TlsAcceptor,
) -> Result<()> {
    log::info!("Handshake endpoint listening on https://{}", listener.local_addr()?);
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                log::error!("Accept error: {}", e);
                continue;
            }
        };

        let tls = tls.clone();
        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            let stream = match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, tls.accept(stream)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    log::debug!("TLS handshake with {} failed: {}", remote, e);
                    return;
                }
                Err(_) => {
                    log::debug!("TLS handshake with {} timed out", remote);
                    return;
                }
            };

            let service = service_fn(move |req| handle(acceptor.clone(), req));
            let conn = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service);
            if let Err(e) = conn.await {
                log::debug!("Connection from {} failed: {}", remote, e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::{ConnectResponse, SignedBlob};
    use crate::mock::{self, ServerHarness};
    use tnl_protocol::kex;

    fn connect_body(device: &str) -> Vec<u8> {
        let grant = crate::handshake::SessionGrant {
            user_id: "user-1".into(),
            device_token: device.into(),
            server_id: mock::SERVER_ID.into(),
            enc_type: tnl_protocol::EncType::Chacha20Poly1305,
            requesting_ports: true,
            expires_at: chrono::Utc::now() + chrono::Duration::minutes(5),
        };
        let blob = SignedBlob::sign(&mock::controller_key(), &grant).unwrap();
        let request = ConnectRequest::new(blob, &kex::ClientHandshake::new().offer(), "host");
        serde_json::to_vec(&request).unwrap()
    }

    #[tokio::test]
    async fn test_connect_returns_response_json() {
        let harness = ServerHarness::new(mock::server_config());
        let (status, body) =
            route(&harness.acceptor, &Method::POST, "/v3/connect", &connect_body("d1")).await;
        assert_eq!(status, StatusCode::OK);
        let response: ConnectResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(response.index, 1);
    }

    #[tokio::test]
    async fn test_unknown_path_and_method() {
        let harness = ServerHarness::new(mock::server_config());
        let (status, _) = route(&harness.acceptor, &Method::POST, "/v2/connect", b"{}").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = route(&harness.acceptor, &Method::GET, "/v3/connect", b"").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_malformed_json_is_400() {
        let harness = ServerHarness::new(mock::server_config());
        let (status, body) =
            route(&harness.acceptor, &Method::POST, "/v3/connect", b"{not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(String::from_utf8_lossy(&body).contains("malformed"));
    }

    #[tokio::test]
    async fn test_firewall_for_unknown_lease_is_404() {
        let harness = ServerHarness::new(mock::server_config());
        let body = serde_json::to_vec(&FirewallRequest {
            dhcp_token: "t".into(),
            ip: "10.0.0.77".parse().unwrap(),
            hosts: Vec::new(),
            disable_firewall: false,
        })
        .unwrap();
        let (status, _) = route(&harness.acceptor, &Method::POST, "/v3/firewall", &body).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(&Error::Auth("x".into())), StatusCode::UNAUTHORIZED);
        assert_eq!(status_for(&Error::Congestion("x".into())), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status_for(&Error::Conflict("x".into())), StatusCode::CONFLICT);
    }

    #[test]
    fn test_missing_certificate_is_bad_input() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_tls_acceptor(&dir.path().join("cert.pem"), &dir.path().join("key.pem"))
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::BadInput);
    }
}
