// Issue-change fan-out. The issue service posts a fact after a successful
// create or update; the relay pushes `issue-changed` to every connection of
// the organisation. Nothing is stored.

use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    Json,
};
use callboard_common::types::{IssueAction, OrganisationId};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use super::ApiState;
use crate::{
    auth::jwt::AuthenticatedUser,
    error::{ErrorCode, RelayError},
    hub::IssueChange,
    validation::ValidatedJson,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct IssueEventRequest {
    pub project_id: i64,
    pub issue_id: i64,
    pub action: IssueAction,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct IssueEventAccepted {
    pub delivered: usize,
}

pub(super) async fn publish_issue_event(
    State(state): State<ApiState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(raw_organisation_id): Path<String>,
    ValidatedJson(payload): ValidatedJson<IssueEventRequest>,
) -> Result<(StatusCode, Json<IssueEventAccepted>), RelayError> {
    let organisation_id = raw_organisation_id.parse::<OrganisationId>().map_err(|_| {
        RelayError::new(ErrorCode::ValidationFailed, "organisation_id must be an integer")
            .with_details(serde_json::json!({ "field": "organisation_id" }))
    })?;

    if user.organisation_id != organisation_id {
        return Err(RelayError::new(
            ErrorCode::AuthForbidden,
            "token is scoped to a different organisation",
        ));
    }

    let is_member = state
        .membership
        .is_active_member(organisation_id, user.user_id)
        .await
        .map_err(|error| {
            error!(error = ?error, organisation_id, user_id = user.user_id, "membership lookup failed");
            RelayError::from_code(ErrorCode::InternalError)
        })?;
    if !is_member {
        return Err(RelayError::new(
            ErrorCode::AuthForbidden,
            "caller is not an active member of this organisation",
        ));
    }

    let delivered = state
        .hub
        .publish_issue_changed(
            organisation_id,
            IssueChange {
                project_id: payload.project_id,
                issue_id: payload.issue_id,
                action: payload.action,
                actor_user_id: user.user_id,
            },
        )
        .await;
    info!(
        organisation_id,
        project_id = payload.project_id,
        issue_id = payload.issue_id,
        actor_user_id = user.user_id,
        delivered,
        "issue change published"
    );

    Ok((StatusCode::ACCEPTED, Json(IssueEventAccepted { delivered })))
}
