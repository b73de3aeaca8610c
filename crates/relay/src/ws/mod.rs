pub mod handler;
pub mod protocol;

use crate::auth::jwt::JwtAccessTokenService;
use crate::hub::PresenceHub;
use crate::membership::OrganisationMembershipStore;
use axum::{routing::get, Router};
use std::sync::Arc;

pub const HEARTBEAT_INTERVAL_MS: u64 = 15_000;
pub const HEARTBEAT_TIMEOUT_MS: u64 = 10_000;

#[derive(Clone)]
pub struct PresenceRouterState {
    pub hub: Arc<PresenceHub>,
    pub jwt_service: Arc<JwtAccessTokenService>,
    pub membership: OrganisationMembershipStore,
}

pub fn router(state: PresenceRouterState) -> Router {
    Router::new().route("/v1/presence", get(handler::ws_upgrade)).with_state(state)
}
