pub mod issue_events;

use std::sync::Arc;

use axum::{middleware, routing::post, Router};

use crate::{
    auth::{jwt::JwtAccessTokenService, middleware::require_bearer_auth},
    hub::PresenceHub,
    membership::OrganisationMembershipStore,
};

#[derive(Clone)]
pub struct ApiState {
    pub hub: Arc<PresenceHub>,
    pub membership: OrganisationMembershipStore,
}

pub fn router(state: ApiState, jwt_service: Arc<JwtAccessTokenService>) -> Router {
    Router::new()
        .route(
            "/v1/organisations/{organisation_id}/issue-events",
            post(issue_events::publish_issue_event),
        )
        .with_state(state)
        .route_layer(middleware::from_fn_with_state(jwt_service, require_bearer_auth))
}
