use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap, StatusCode},
    Json,
};
use shared::{domain::Identity, error::ApiError};
use tracing::info;

use crate::app_state::AppState;

/// Resolves request or handshake metadata to an identity. Implementations
/// return `None` for missing, malformed, or expired credentials.
#[async_trait]
pub trait SessionValidator: Send + Sync {
    async fn validate(&self, headers: &HeaderMap) -> Option<Identity>;
}

/// Runs the validator for one connection attempt. Rejection is terminal; the
/// caller has to start a fresh handshake.
pub async fn admit(
    validator: &dyn SessionValidator,
    headers: &HeaderMap,
) -> Result<Identity, ApiError> {
    match validator.validate(headers).await {
        Some(identity) => Ok(identity),
        None => {
            info!("rejected unauthenticated connection");
            Err(ApiError::unauthorized())
        }
    }
}

/// Extractor for REST handlers that require a session.
pub struct AuthenticatedUser(pub Identity);

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for AuthenticatedUser {
    type Rejection = (StatusCode, Json<ApiError>);

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        admit(state.validator.as_ref(), &parts.headers)
            .await
            .map(AuthenticatedUser)
            .map_err(|error| (StatusCode::UNAUTHORIZED, Json(error)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{domain::UserId, error::ErrorCode};

    struct FixedValidator(Option<Identity>);

    #[async_trait]
    impl SessionValidator for FixedValidator {
        async fn validate(&self, _headers: &HeaderMap) -> Option<Identity> {
            self.0.clone()
        }
    }

    #[tokio::test]
    async fn admits_validated_identity() {
        let identity = Identity {
            user_id: UserId(3),
            name: "carol".into(),
        };
        let validator = FixedValidator(Some(identity.clone()));
        let admitted = admit(&validator, &HeaderMap::new()).await.expect("admit");
        assert_eq!(admitted, identity);
    }

    #[tokio::test]
    async fn rejects_when_validator_returns_nothing() {
        let err = admit(&FixedValidator(None), &HeaderMap::new())
            .await
            .expect_err("reject");
        assert!(matches!(err.code, ErrorCode::Unauthorized));
    }
}
