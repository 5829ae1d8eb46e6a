/// Network control agent simulator
/// Answers the activation_feature actions the sharing middleware sends and keeps
/// the UE table in memory

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, patch},
    Json, Router,
};
use clap::Parser;
use log::{info, warn};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Parser)]
#[clap(name = "agent-sim")]
#[clap(about = "In-memory network control agent")]
struct Args {
    #[clap(long, default_value = "0.0.0.0:28080")]
    listen_addr: String,

    /// gNB resource id served
    #[clap(long, default_value = "1")]
    gnb_id: String,

    /// IMSIs of the UEs registered at start-up
    #[clap(long, value_delimiter = ',', default_value = "001010000000001,001010000000002")]
    ues: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Restart {
    pub parameters: Option<Value>,
}

pub struct AgentState {
    gnb_id: String,
    ues: RwLock<BTreeMap<String, Value>>,
    restarts: RwLock<Vec<Restart>>,
}

impl AgentState {
    pub fn new(gnb_id: &str, imsis: &[String]) -> Self {
        let ues = imsis
            .iter()
            .map(|imsi| (imsi.clone(), json!({ "imsi": imsi })))
            .collect();
        Self {
            gnb_id: gnb_id.to_string(),
            ues: RwLock::new(ues),
            restarts: RwLock::new(Vec::new()),
        }
    }
}

type SharedState = Arc<AgentState>;

/// Pull `(action, parameters)` out of an activation_feature document
fn parse_activation(body: &Value) -> Option<(String, Option<Value>)> {
    let characteristics = body
        .get("activation_feature")?
        .get(0)?
        .get("feature_characteristic")?
        .as_array()?;

    let mut action = None;
    let mut parameters = None;
    for characteristic in characteristics {
        let value = characteristic.get("value").and_then(|v| v.get("value")).cloned();
        match characteristic.get("name").and_then(Value::as_str) {
            Some("action") => action = value.and_then(|v| v.as_str().map(str::to_string)),
            Some("action_parameters") => parameters = value,
            _ => {}
        }
    }
    action.map(|action| (action, parameters))
}

async fn handle_activation(
    State(state): State<SharedState>,
    Path(gnb_id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if gnb_id != state.gnb_id {
        return Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("unknown resource {}", gnb_id) })),
        ));
    }
    let Some((action, parameters)) = parse_activation(&body) else {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "missing activation_feature action" })),
        ));
    };

    match action.as_str() {
        "restart" => {
            info!("Restart of gNB {} with parameters {:?}", gnb_id, parameters);
            state.restarts.write().push(Restart { parameters });
            Ok(Json(json!({ "status": "restarted" })))
        }
        "get_all_ues" => {
            let ues: Vec<Value> = state.ues.read().values().cloned().collect();
            info!("Listing {} UEs", ues.len());
            Ok(Json(json!({ "ues": ues })))
        }
        "update_ues" => {
            let Some(Value::Array(updates)) = parameters else {
                return Err((
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": "update_ues needs a list of UEs" })),
                ));
            };
            let mut ues = state.ues.write();
            let mut updated = 0;
            for ue in updates {
                match ue.get("imsi").and_then(Value::as_str) {
                    Some(imsi) => {
                        ues.insert(imsi.to_string(), ue.clone());
                        updated += 1;
                    }
                    None => warn!("Skipping UE without imsi: {}", ue),
                }
            }
            info!("Updated {} UEs", updated);
            Ok(Json(json!({ "status": "updated", "count": updated })))
        }
        other => Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": format!("unsupported action {}", other) })),
        )),
    }
}

async fn inspect(State(state): State<SharedState>) -> Json<Value> {
    let ues: Vec<Value> = state.ues.read().values().cloned().collect();
    let restarts = state.restarts.read().clone();
    Json(json!({ "gnbId": state.gnb_id, "ues": ues, "restarts": restarts }))
}

fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/resource/:gnb_id", patch(handle_activation))
        .route("/state", get(inspect))
        .route("/health", get(|| async { "OK" }))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let state = Arc::new(AgentState::new(&args.gnb_id, &args.ues));
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&args.listen_addr).await?;
    info!(
        "Agent simulator for gNB {} with {} UEs on {}",
        args.gnb_id,
        args.ues.len(),
        listener.local_addr()?
    );
    axum::serve(listener, app).await?;
    Ok(())
}
