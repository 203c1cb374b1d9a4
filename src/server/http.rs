//! HTTP server implementation
//!
//! Uses hyper http1 with TokioIo for async handling.
//!
//! # Surfaces
//!
//! The `/__internal` cluster endpoints can be served on their own listener
//! (`INTERNAL_LISTEN`) so they can be kept off the public network. A listener
//! only answers the routes of its [`Surface`]; everything else is a 404.
//! Health probes are answered on every surface.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::cluster::sync::{
    GET_UNLOCK_PASSWORDS_PATH, POST_ENCRYPTED_PASSWORDS_PATH, TRIGGER_KEY_UNLOCK_PATH,
};
use crate::config::Args;
use crate::custodial_keys::{KeyCustodian, SecretEscrow};
use crate::routes;
use crate::types::Result;

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

const INTERNAL_PREFIX: &str = "/__internal/";

/// Shared application state
pub struct AppState {
    pub args: Args,
    pub custodian: Arc<KeyCustodian>,
    pub escrow: Arc<SecretEscrow>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(args: Args, custodian: Arc<KeyCustodian>, escrow: Arc<SecretEscrow>) -> Self {
        Self {
            args,
            custodian,
            escrow,
            started_at: Instant::now(),
        }
    }
}

/// Which group of routes a listener answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Surface {
    /// Key management API only
    Public,
    /// `/__internal` cluster endpoints only
    Internal,
    /// Both, on a single listener
    Combined,
}

impl Surface {
    fn serves_internal(self) -> bool {
        matches!(self, Self::Internal | Self::Combined)
    }

    fn serves_public(self) -> bool {
        matches!(self, Self::Public | Self::Combined)
    }
}

/// Bind the configured listeners and serve until the process exits.
pub async fn run(state: Arc<AppState>) -> Result<()> {
    let public = TcpListener::bind(state.args.listen).await?;
    info!(
        "keywarden listening on {} as node {}",
        state.args.listen, state.args.node_id
    );

    match state.args.internal_listen {
        Some(addr) => {
            let internal = TcpListener::bind(addr).await?;
            info!("Cluster endpoints listening on {}", addr);
            tokio::join!(
                serve(public, Arc::clone(&state), Surface::Public),
                serve(internal, state, Surface::Internal),
            );
        }
        None => {
            warn!("INTERNAL_LISTEN not set - cluster endpoints share the public listener");
            serve(public, state, Surface::Combined).await;
        }
    }

    Ok(())
}

/// Accept loop for one listener.
pub async fn serve(listener: TcpListener, state: Arc<AppState>, surface: Surface) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);

                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { handle_request(state, surface, addr, req).await }
                    });

                    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                        debug!("Error serving connection from {}: {:?}", addr, err);
                    }
                });
            }
            Err(e) => {
                error!("Error accepting connection: {:?}", e);
            }
        }
    }
}

async fn handle_request(
    state: Arc<AppState>,
    surface: Surface,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> std::result::Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);
    let internal = path.starts_with(INTERNAL_PREFIX);

    let result = match (&method, path.as_str()) {
        // Liveness probe
        (&Method::GET, "/health") | (&Method::GET, "/healthz") => {
            routes::health_check(&state).await
        }

        _ if internal && !surface.serves_internal() => Ok(routes::not_found_response(&path)),
        _ if !internal && !surface.serves_public() => Ok(routes::not_found_response(&path)),

        // ====================================================================
        // Cluster endpoints
        // ====================================================================
        (&Method::GET, GET_UNLOCK_PASSWORDS_PATH) => routes::get_unlock_passwords(&state).await,
        (&Method::POST, POST_ENCRYPTED_PASSWORDS_PATH) => {
            routes::post_encrypted_passwords(&state, req).await
        }
        (&Method::GET, TRIGGER_KEY_UNLOCK_PATH) | (&Method::POST, TRIGGER_KEY_UNLOCK_PATH) => {
            routes::trigger_key_unlock(&state).await
        }

        // ====================================================================
        // Key ring
        // ====================================================================
        (&Method::GET, "/keyRing/getKey") => routes::handle_get_key(&state, query.as_deref()).await,
        (&Method::GET, "/keyRing/cachedKeys") => routes::handle_cached_keys(&state).await,
        (&Method::GET, "/keyRing/privateKeys") => routes::handle_private_keys(&state).await,
        (&Method::POST, "/keyRing/addPrivateKey") => {
            routes::handle_add_private_key(&state, req).await
        }
        (&Method::POST, "/keyRing/deletePrivateKey") => {
            routes::handle_delete_private_key(&state, req).await
        }

        // ====================================================================
        // OpenPGP operations
        // ====================================================================
        (&Method::POST, "/gpg/generateKey") => routes::handle_generate_key(&state, req).await,
        (&Method::POST, "/gpg/unlockKey") => routes::handle_unlock_key(&state, req).await,
        (&Method::POST, "/gpg/sign") => routes::handle_sign(&state, req).await,
        (&Method::POST, "/gpg/verifySignature") => {
            routes::handle_verify_signature(&state, req).await
        }
        (&Method::POST, "/gpg/signQuanto") => routes::handle_sign_compact(&state, req).await,
        (&Method::POST, "/gpg/verifySignatureQuanto") => {
            routes::handle_verify_signature_compact(&state, req).await
        }
        (&Method::POST, "/gpg/encrypt") => routes::handle_encrypt(&state, req).await,
        (&Method::POST, "/gpg/decrypt") => routes::handle_decrypt(&state, req).await,

        _ => Ok(routes::not_found_response(&path)),
    };

    let response = result.unwrap_or_else(routes::error_response);
    info!(
        "[{}] {} {} -> {}",
        addr,
        method,
        path,
        response.status().as_u16()
    );
    Ok(to_boxed(response))
}

/// Convert a Full<Bytes> body to BoxBody
fn to_boxed(response: Response<Full<Bytes>>) -> Response<BoxBody> {
    response.map(|body| body.map_err(|never| match never {}).boxed())
}
