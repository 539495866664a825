// server.rs - Agency HTTP Surface
//
//! axum routes in front of an [`Agency`].
//!
//! | Route | Purpose |
//! |-------|---------|
//! | `POST /agency/msg` | inbound envelope, sealed reply |
//! | `GET /agency` | Forward Agent DID and verkey |
//! | `GET /experimental/agent/{agent_did}/notifications` | long-poll for new messages |
//! | `POST /experimental/agent/{agent_did}/notifications/ack` | acknowledge notifications |
//! | `GET /health` | liveness |

use axum::{
    Router,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::agency::Agency;
use crate::error::AgencyError;
use crate::notifications::NotificationError;

/// Content type of envelopes exchanged on `/agency/msg`
pub const WIRE_CONTENT_TYPE: &str = "application/ssi-agent-wire";

type SharedAgency = Arc<Agency>;

/// Build the agency router
pub fn router(agency: SharedAgency) -> Router {
    Router::new()
        .route("/agency", get(agency_info))
        .route("/agency/msg", post(agency_msg))
        .route(
            "/experimental/agent/{agent_did}/notifications",
            get(long_poll_notifications),
        )
        .route(
            "/experimental/agent/{agent_did}/notifications/ack",
            post(ack_notifications),
        )
        .route("/health", get(health))
        .with_state(agency)
}

/// Serve on `listener` until `shutdown` resolves
pub async fn serve<F>(agency: SharedAgency, listener: TcpListener, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Agency listening");
    }
    axum::serve(listener, router(agency))
        .with_graceful_shutdown(shutdown)
        .await
}

// =============================================================================
// Handlers
// =============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    error_trace_id: String,
}

async fn agency_msg(State(agency): State<SharedAgency>, body: Bytes) -> Response {
    match agency.handle_message(&body).await {
        Ok(reply) => ([(header::CONTENT_TYPE, WIRE_CONTENT_TYPE)], reply).into_response(),
        Err(envelope) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorBody {
                error_trace_id: envelope.error_trace_id,
            }),
        )
            .into_response(),
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct AgencyInfo {
    #[serde(rename = "DID")]
    did: String,
    #[serde(rename = "verKey")]
    verkey: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    endpoint: Option<String>,
}

async fn agency_info(State(agency): State<SharedAgency>) -> Json<AgencyInfo> {
    let info = agency.forward_agent_info();
    Json(AgencyInfo {
        did: info.did.clone(),
        verkey: info.verkey.clone(),
        endpoint: agency.config().forward_agent.endpoint.clone(),
    })
}

#[derive(Deserialize)]
struct LongPollQuery {
    timeout: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotificationsResponse {
    has_notifications: bool,
}

async fn long_poll_notifications(
    State(agency): State<SharedAgency>,
    Path(agent_did): Path<String>,
    Query(query): Query<LongPollQuery>,
) -> Result<Json<NotificationsResponse>, StatusCode> {
    debug!(agent_did = %agent_did, timeout = ?query.timeout, "Long-poll");
    let has_notifications = agency
        .wait_for_notifications(&agent_did, query.timeout)
        .await
        .map_err(notification_status)?;
    Ok(Json(NotificationsResponse { has_notifications }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AckQuery {
    ack_utime: Option<i64>,
}

async fn ack_notifications(
    State(agency): State<SharedAgency>,
    Path(agent_did): Path<String>,
    Query(query): Query<AckQuery>,
) -> StatusCode {
    match agency.ack_notifications(&agent_did, query.ack_utime).await {
        Ok(()) => StatusCode::OK,
        Err(e) => notification_status(e),
    }
}

fn notification_status(error: AgencyError) -> StatusCode {
    match error {
        AgencyError::Notification(NotificationError::Unavailable) => StatusCode::CONFLICT,
        AgencyError::Notification(NotificationError::InvalidTimestamp(reason)) => {
            debug!(reason = %reason, "Rejected notification timestamp");
            StatusCode::BAD_REQUEST
        }
        other => {
            warn!(error = %other, "Notification request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::AgencyClient;
    use crate::config::AgencyConfig;
    use crate::identity::{DidInfo, IdentityProvider, LocalIdentityProvider, WalletRef};
    use crate::messages::{AgencyMessage, CreateKey};
    use crate::notifications::{Notifier, now_millis};
    use crate::storage::MemoryStorage;
    use crate::webhook::WebhookDispatcher;
    use serde_json::json;
    use std::net::SocketAddr;
    use tokio::sync::oneshot;

    struct TestServer {
        addr: SocketAddr,
        agency: SharedAgency,
        http: reqwest::Client,
        _shutdown: oneshot::Sender<()>,
    }

    impl TestServer {
        async fn start(agency: Agency) -> Self {
            let agency = Arc::new(agency);
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let (tx, rx) = oneshot::channel();
            tokio::spawn(serve(agency.clone(), listener, async move {
                let _ = rx.await;
            }));
            Self {
                addr,
                agency,
                http: reqwest::Client::new(),
                _shutdown: tx,
            }
        }

        fn url(&self, path: &str) -> String {
            format!("http://{}{}", self.addr, path)
        }

        async fn post_msg(&self, bytes: Vec<u8>) -> reqwest::Response {
            self.http
                .post(self.url("/agency/msg"))
                .header(header::CONTENT_TYPE, WIRE_CONTENT_TYPE)
                .body(bytes)
                .send()
                .await
                .unwrap()
        }

        async fn poll(&self, agent_did: &str, timeout_ms: u64) -> reqwest::Response {
            self.http
                .get(self.url(&format!(
                    "/experimental/agent/{agent_did}/notifications?timeout={timeout_ms}"
                )))
                .send()
                .await
                .unwrap()
        }
    }

    async fn client(identity: &Arc<dyn IdentityProvider>, name: &str, agency: &DidInfo) -> AgencyClient {
        let wallet = WalletRef {
            name: name.to_string(),
            key: format!("{name}-key"),
        };
        AgencyClient::new(identity.clone(), &wallet, agency.clone())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_and_agency_info() {
        let server = TestServer::start(Agency::in_memory(AgencyConfig::in_memory()).await.unwrap()).await;

        let health: HealthResponse = server
            .http
            .get(server.url("/health"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health.status, "ok");
        assert_eq!(health.version, env!("CARGO_PKG_VERSION"));

        let body: serde_json::Value = server
            .http
            .get(server.url("/agency"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let fa = server.agency.forward_agent_info();
        assert_eq!(body["DID"], fa.did.as_str());
        assert_eq!(body["verKey"], fa.verkey.as_str());
    }

    #[tokio::test]
    async fn test_garbage_envelope_returns_trace_id() {
        let server = TestServer::start(Agency::in_memory(AgencyConfig::in_memory()).await.unwrap()).await;

        let response = server.post_msg(b"not an envelope".to_vec()).await;
        assert_eq!(response.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);

        let body: serde_json::Value = response.json().await.unwrap();
        let trace_id = body["errorTraceId"].as_str().unwrap();
        assert!(uuid::Uuid::parse_str(trace_id).is_ok());
    }

    #[tokio::test]
    async fn test_delivery_over_http_wakes_long_poll() {
        let server = TestServer::start(Agency::in_memory(AgencyConfig::in_memory()).await.unwrap()).await;
        let identity: Arc<dyn IdentityProvider> = Arc::new(LocalIdentityProvider::in_memory().unwrap());
        let fa = server.agency.forward_agent_info().clone();

        let owner = client(&identity, "owner", &fa).await;
        let pairwise = client(&identity, "pairwise", &fa).await;
        let sender = client(&identity, "sender", &fa).await;

        let response = server.post_msg(owner.pack_connect().await.unwrap()).await;
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE.as_str()],
            WIRE_CONTENT_TYPE
        );
        let (reply, _) = owner.unpack(&response.bytes().await.unwrap()).await.unwrap();
        let AgencyMessage::Connected(agent) = reply else {
            panic!("expected CONNECTED, got {reply:?}");
        };
        let agent = DidInfo {
            did: agent.did,
            verkey: agent.verkey,
        };

        let create_key = AgencyMessage::CreateKey(CreateKey {
            for_did: pairwise.did().to_string(),
            for_did_verkey: pairwise.verkey().to_string(),
        });
        let response = server
            .post_msg(owner.pack_for(&agent, &create_key).await.unwrap())
            .await;
        let (reply, _) = owner.unpack(&response.bytes().await.unwrap()).await.unwrap();
        let AgencyMessage::KeyCreated(connection) = reply else {
            panic!("expected KEY_CREATED, got {reply:?}");
        };

        let poll: NotificationsResponse = server.poll(&agent.did, 50).await.json().await.unwrap();
        assert!(!poll.has_notifications);

        let waiting = {
            let http = server.http.clone();
            let url = server.url(&format!(
                "/experimental/agent/{}/notifications?timeout=5000",
                agent.did
            ));
            tokio::spawn(async move {
                let response = http.get(url).send().await.unwrap();
                response.json::<NotificationsResponse>().await.unwrap()
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let forward = sender
            .pack_aries_forward(&connection.did, json!({"hello": "world"}))
            .await
            .unwrap();
        let response = server.post_msg(forward).await;
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert!(response.bytes().await.unwrap().is_empty());

        assert!(waiting.await.unwrap().has_notifications);

        let ack = server
            .http
            .post(server.url(&format!(
                "/experimental/agent/{}/notifications/ack?ackUtime={}",
                agent.did,
                now_millis()
            )))
            .send()
            .await
            .unwrap();
        assert_eq!(ack.status(), reqwest::StatusCode::OK);

        let poll: NotificationsResponse = server.poll(&agent.did, 50).await.json().await.unwrap();
        assert!(!poll.has_notifications);
    }

    #[tokio::test]
    async fn test_future_ack_is_bad_request() {
        let server = TestServer::start(Agency::in_memory(AgencyConfig::in_memory()).await.unwrap()).await;
        let notifier = server.agency.notifier();
        notifier.flag_new_message("did-x").await.unwrap();

        let response = server
            .http
            .post(server.url(&format!(
                "/experimental/agent/did-x/notifications/ack?ackUtime={}",
                now_millis() + 60_000
            )))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

        // a rejected ack clears nothing
        assert!(notifier.v1.has_unacked_message("did-x").await.unwrap());
        assert!(notifier.v2.has_unacked_message("did-x").await.unwrap());
    }

    #[tokio::test]
    async fn test_notifications_unavailable_is_conflict() {
        let agency = Agency::wire(
            AgencyConfig::in_memory(),
            Arc::new(MemoryStorage::new()),
            Arc::new(LocalIdentityProvider::in_memory().unwrap()),
            Notifier::disabled(),
            WebhookDispatcher::disabled(),
        )
        .await
        .unwrap();
        let server = TestServer::start(agency).await;

        let response = server.poll("did-x", 10).await;
        assert_eq!(response.status(), reqwest::StatusCode::CONFLICT);

        let response = server
            .http
            .post(server.url("/experimental/agent/did-x/notifications/ack"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::CONFLICT);
    }
}
