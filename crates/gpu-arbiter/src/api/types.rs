use serde::Serialize;

use crate::arbiter::ResourceState;

/// Response of `GET /api/v1/state`
#[derive(Debug, Clone, Serialize)]
pub struct StateResponse {
    pub unit_id: String,
    /// `HH:MM-HH:MM`, local time
    pub blackout: String,
    pub in_blackout: bool,
    pub state: ResourceState,
}
