//! Mapping of dispatch errors onto HTTP responses

use axum::{http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use tracing::error;
use wacast_core::DispatchError;

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);

pub fn api_error(status: StatusCode, error: &str, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            message: message.into(),
        }),
    )
}

/// Convert a dispatch error, logging the ones the caller cannot fix
pub fn from_dispatch(context: &str, e: DispatchError) -> ApiError {
    let status = match &e {
        DispatchError::NotFound => StatusCode::NOT_FOUND,
        DispatchError::Validation(_) => StatusCode::BAD_REQUEST,
        DispatchError::EmptyAudience => StatusCode::UNPROCESSABLE_ENTITY,
        DispatchError::InvalidTransition { .. }
        | DispatchError::NotDraft { .. }
        | DispatchError::NotDue { .. }
        | DispatchError::OrphanedTask { .. } => StatusCode::CONFLICT,
        DispatchError::Persistence(_) => {
            error!("{}: {}", context, e);
            return api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                context.to_string(),
            );
        }
    };

    api_error(status, &e.code().to_lowercase(), e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wacast_core::CampaignAction;
    use wacast_storage::models::CampaignStatus;

    #[test]
    fn test_status_codes() {
        let (status, body) = from_dispatch("ctx", DispatchError::NotFound);
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body.error, "not_found");

        let (status, body) = from_dispatch(
            "ctx",
            DispatchError::InvalidTransition {
                from: CampaignStatus::Completed,
                action: CampaignAction::Pause,
            },
        );
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body.message, "Cannot pause a campaign that is completed");

        let (status, _) = from_dispatch("ctx", DispatchError::EmptyAudience);
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, body) = from_dispatch(
            "Failed to load campaign",
            DispatchError::Persistence(wacast_common::Error::Database("down".to_string())),
        );
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.message, "Failed to load campaign");
    }
}
