use std::sync::Arc;

use poem::handler;
use poem::web::Data;
use poem::web::Json;

use super::types::StateResponse;
use crate::arbiter::Arbiter;
use crate::arbiter::GpuInspection;

/// Current arbiter state
#[handler]
pub async fn get_state(arbiter: Data<&Arc<Arbiter>>) -> Json<StateResponse> {
    let config = arbiter.config();
    Json(StateResponse {
        unit_id: config.unit_id.clone(),
        blackout: config.blackout.to_string(),
        in_blackout: arbiter.in_blackout(),
        state: arbiter.snapshot().await,
    })
}

/// Fresh telemetry poll, classified. Does not touch the arbiter state.
#[handler]
pub async fn get_processes(arbiter: Data<&Arc<Arbiter>>) -> Json<GpuInspection> {
    Json(arbiter.inspect_gpu().await)
}
