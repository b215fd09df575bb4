//! HTTP transport for protocol messages
//!
//! Outbound messages are POSTed as JSON documents to the target's
//! `/agreement` endpoint; inbound documents are decoded and handed to the
//! coordinator. Document signing and compression belong to the identity
//! collaborator outside this crate.

use crate::agreement::coordinator::AgreementCoordinator;
use crate::agreement::message::AgreementMessage;
use crate::directory::Target;
use crate::error::TransportError;
use actix_web::{web, App, HttpResponse, HttpServer, Responder};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Delivers one protocol message to one target. Implementations must not
/// let a slow or unreachable peer affect other sends; the coordinator
/// issues each send as its own task.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn send(&self, target: &Target, message: &AgreementMessage) -> Result<(), TransportError>;
}

/// Production transport: JSON over HTTP POST.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .user_agent("dirnode-agreement/0.1.0")
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        HttpTransport { client }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        HttpTransport::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl MessageTransport for HttpTransport {
    async fn send(&self, target: &Target, message: &AgreementMessage) -> Result<(), TransportError> {
        let url = format!("http://{}/agreement", target.address);
        let response = self
            .client
            .post(&url)
            .json(message)
            .send()
            .await
            .map_err(|source| TransportError::Request {
                address: target.address.clone(),
                source,
            })?;
        if !response.status().is_success() {
            return Err(TransportError::Status {
                address: target.address.clone(),
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}

/// Receives one protocol message and hands it to the coordinator. Always
/// answers OK; protocol-level problems are handled inside the coordinator.
async fn receive_message(
    msg: web::Json<AgreementMessage>,
    coordinator: web::Data<Arc<AgreementCoordinator>>,
) -> impl Responder {
    coordinator.handle_incoming_message(msg.into_inner());
    HttpResponse::Ok().json(json!({ "status": "accepted" }))
}

async fn health() -> impl Responder {
    HttpResponse::Ok().json(json!({ "status": "healthy" }))
}

/// Runs the agreement endpoint until the server is stopped.
pub async fn start_server(port: u16, coordinator: Arc<AgreementCoordinator>) -> std::io::Result<()> {
    let data = web::Data::new(coordinator);
    info!(port, "starting agreement HTTP server");
    HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .route("/agreement", web::post().to(receive_message))
            .route("/health", web::get().to(health))
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await
}
