/// Router tests for the ledger node and middleware HTTP surfaces

mod common;

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

use sharing_node::api::{ledger, middleware, LedgerState, MiddlewareState};
use sharing_node::ledger::CredentialRegistry;
use sharing_node::middleware::{LocalLedgerGateway, RequestService};
use sharing_node::LifecycleOrchestrator;

use common::{ledger_address, memory_store, owner, tenant, MockAgent};

const OWNER_TOKEN: &str = "owner-token";
const TENANT_TOKEN: &str = "tenant-token";

fn credentials() -> CredentialRegistry {
    let mut credentials = CredentialRegistry::default();
    credentials.insert(OWNER_TOKEN, owner());
    credentials.insert(TENANT_TOKEN, tenant());
    credentials
}

fn contract() -> String {
    format!("{:?}", ledger_address())
}

async fn send(
    app: &Router,
    method: Method,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn ledger_app() -> Router {
    let (ledger, _) = common::ledger();
    ledger::create_router(LedgerState {
        ledger,
        credentials: Arc::new(credentials()),
    })
}

fn create_body(num_users: u32) -> Value {
    json!({
        "contractAddress": contract(),
        "numUsers": num_users,
        "durationMins": 60,
    })
}

#[tokio::test]
async fn test_ledger_create_requires_credential() {
    let app = ledger_app();
    let (status, body) = send(&app, Method::POST, "/api/create", None, Some(create_body(2))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "AuthorizationError");

    let (status, _) = send(&app, Method::POST, "/api/create", Some("nope"), Some(create_body(2))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_ledger_create_confirm_and_list() {
    let app = ledger_app();
    let (status, created) =
        send(&app, Method::POST, "/api/create", Some(TENANT_TOKEN), Some(create_body(2))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(created["requestId"], 1);
    assert_eq!(created["amountEscrowed"], "0.014400000000000000");
    assert!(created["settlementRef"].as_str().unwrap().starts_with("0x"));

    let (status, denied) =
        send(&app, Method::POST, "/api/requests/1/confirm", Some(TENANT_TOKEN), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(denied["error"], "AuthorizationError");

    let (_, record) = send(&app, Method::GET, "/api/requests/1", None, None).await;
    assert_eq!(record["status"], "Created");

    let (status, confirmed) =
        send(&app, Method::POST, "/api/requests/1/confirm", Some(OWNER_TOKEN), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(confirmed["status"], "Confirmed");
    assert_eq!(confirmed["settlementRef"], created["settlementRef"]);

    let (status, conflict) = send(
        &app,
        Method::POST,
        "/api/requests/1/cancel",
        Some(OWNER_TOKEN),
        Some(json!({ "reason": "too late" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(conflict["details"]["status"], "Confirmed");

    let (_, listed) = send(&app, Method::GET, "/api/requests?status=confirmed", None, None).await;
    assert_eq!(listed.as_array().unwrap().len(), 1);
    let (_, listed) = send(&app, Method::GET, "/api/requests?status=Created", None, None).await;
    assert!(listed.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_ledger_rejects_bad_input() {
    let app = ledger_app();

    let mut wrong = create_body(1);
    wrong["contractAddress"] = json!("0x0000000000000000000000000000000000000001");
    let (status, body) = send(&app, Method::POST, "/api/create", Some(TENANT_TOKEN), Some(wrong)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "ValidationError");

    let mut short = create_body(1);
    short["payment"] = json!("0.0001");
    let (status, body) = send(&app, Method::POST, "/api/create", Some(TENANT_TOKEN), Some(short)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["details"]["required"], "0.007200000000000000");

    let (status, _) = send(&app, Method::GET, "/api/requests?status=bogus", None, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(&app, Method::GET, "/api/requests/42", None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], 404);
}

#[tokio::test]
async fn test_ledger_quote() {
    let app = ledger_app();
    let (status, quote) =
        send(&app, Method::GET, "/api/quote?numUsers=2&durationMins=60", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(quote["requiredPayment"], "0.014400000000000000");
    assert_eq!(quote["requiredPaymentWei"], "14400000000000000");
}

struct MiddlewareFixture {
    app: Router,
    agent: Arc<MockAgent>,
}

fn middleware_app() -> MiddlewareFixture {
    let (ledger, _) = common::ledger();
    let store = memory_store();
    let agent = MockAgent::with_endpoints();
    let orchestrator = Arc::new(LifecycleOrchestrator::new(store.clone(), agent.clone(), "00101"));
    let gateway = Arc::new(LocalLedgerGateway::new(ledger, credentials()));
    let service = Arc::new(RequestService::new(store, gateway, orchestrator));
    MiddlewareFixture {
        app: middleware::create_router(MiddlewareState { service }),
        agent,
    }
}

fn order_body() -> Value {
    json!({
        "credential": TENANT_TOKEN,
        "contractAddress": contract(),
        "sharedTAC": 7,
        "ueImsis": [common::TENANT_IMSI],
        "durationMins": 60,
        "tenantPLMN": "00102",
        "tenantAMFIP": "10.0.0.1",
        "tenantAMFPort": 38412
    })
}

async fn create_order(app: &Router) -> String {
    let (status, created) = send(app, Method::POST, "/api/request", None, Some(order_body())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(created["state"], "Pending");
    created["settlementRef"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_middleware_create_validates_fields() {
    let fixture = middleware_app();
    let (status, body) = send(
        &fixture.app,
        Method::POST,
        "/api/request",
        None,
        Some(json!({ "credential": TENANT_TOKEN, "sharedTAC": 7 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Missing required fields: contractAddress, ueImsis");

    let mut unknown = order_body();
    unknown["credential"] = json!("stranger");
    let (status, _) = send(&fixture.app, Method::POST, "/api/request", None, Some(unknown)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (_, listed) = send(&fixture.app, Method::GET, "/api/requests", None, None).await;
    let listed = listed.as_array().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["state"], "Created");
}

#[tokio::test]
async fn test_middleware_state_endpoint_checks_input() {
    let fixture = middleware_app();
    let settlement_ref = create_order(&fixture.app).await;

    let (status, body) = send(
        &fixture.app,
        Method::PATCH,
        &format!("/api/request/{}/expired", settlement_ref),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Invalid state. Must be one of: accepted, rejected, completed");

    let (status, _) = send(&fixture.app, Method::PATCH, "/api/request/0xmissing/accepted", None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_middleware_accept_completes_request() {
    let fixture = middleware_app();
    let settlement_ref = create_order(&fixture.app).await;

    let (status, update) = send(
        &fixture.app,
        Method::PATCH,
        &format!("/api/request/{}/ACCEPTED", settlement_ref),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(update["success"], true);
    assert_eq!(update["requested"], "Accepted");
    assert_eq!(update["state"], "Completed");
    assert_eq!(update["outcome"], "applied");
    assert!(update.get("finalizationError").is_none());

    // A late duplicate is stale, a contradicting one conflicts
    let uri = format!("/api/request/{}/accepted", settlement_ref);
    let (status, update) = send(&fixture.app, Method::PATCH, &uri, None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(update["outcome"], "stale");

    let uri = format!("/api/request/{}/rejected", settlement_ref);
    let (status, body) = send(&fixture.app, Method::PATCH, &uri, None, None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "StateConflictError");

    assert_eq!(fixture.agent.restarts().len(), 1);
}

#[tokio::test]
async fn test_middleware_reconcile_after_agent_failure() {
    let fixture = middleware_app();
    let settlement_ref = create_order(&fixture.app).await;

    fixture.agent.fail_next("restart", 1);
    let (status, update) = send(
        &fixture.app,
        Method::PATCH,
        &format!("/api/request/{}/accepted", settlement_ref),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(update["state"], "Accepted");
    assert!(update["finalizationError"].as_str().unwrap().contains("restart"));

    let (status, record) = send(
        &fixture.app,
        Method::POST,
        &format!("/api/request/{}/reconcile", settlement_ref),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(record["state"], "Completed");
    assert_eq!(record["ref"], settlement_ref.as_str());

    let (_, record) = send(
        &fixture.app,
        Method::GET,
        &format!("/api/request/{}", settlement_ref),
        None,
        None,
    )
    .await;
    assert_eq!(record["state"], "Completed");
    assert_eq!(record["originalEndpoints"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_middleware_completed_runs_pending_finalisation() {
    let fixture = middleware_app();
    let settlement_ref = create_order(&fixture.app).await;

    fixture.agent.fail_next("get_all_ues", 1);
    send(
        &fixture.app,
        Method::PATCH,
        &format!("/api/request/{}/accepted", settlement_ref),
        None,
        None,
    )
    .await;

    let (status, update) = send(
        &fixture.app,
        Method::PATCH,
        &format!("/api/request/{}/completed", settlement_ref),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(update["state"], "Completed");
}
