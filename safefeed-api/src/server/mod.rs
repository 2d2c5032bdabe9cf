use axum::{
    Router,
    extract::{
        FromRef, Request,
        multipart::{MultipartError, MultipartRejection},
        rejection::{JsonRejection, PathRejection, QueryRejection},
    },
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
};
use axum_extra::typed_header::TypedHeaderRejection;
use json::Json;
use safefeed_classifier::ImageClassifier;
use safefeed_common::{
    model::{
        Id,
        auth::{AuthTokenDecodeError, AuthTokenHashError, PasswordHashingError},
        comment::CommentMarker,
        post::{InvalidPostContentError, PostMarker},
        user::UserHandle,
    },
    util::PositiveDuration,
};
use safefeed_db::client::{DbClient, DbError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use submission::{RejectionReason, SubmissionError};
use thiserror::Error;
use tokio::task::JoinError;
use tracing::{error, warn};

mod auth;
mod json;
mod routes;
pub mod submission;

#[cfg(test)]
mod testing;

pub type ServerRouter = Router<ServerState>;

#[derive(Clone, FromRef)]
pub struct ServerState {
    pub db_client: Arc<DbClient>,
    pub classifier: Arc<ImageClassifier>,
    pub auth_config: AuthConfig,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Default, Hash)]
pub struct AuthConfig {
    /// Lifetime of newly issued tokens. `None` means tokens never expire.
    pub token_lifetime: Option<PositiveDuration>,
}

pub fn routes() -> ServerRouter {
    routes::routes().fallback(fallback)
}

pub async fn fallback(request: Request) -> ServerError {
    ServerError::UnknownRoute(request.into_parts().0.uri)
}

pub type Result<T, E = ServerError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Unknown route requested: {0}")]
    UnknownRoute(Uri),
    #[error("Path rejected: {0}")]
    PathRejection(#[from] PathRejection),
    #[error("Query rejected: {0}")]
    QueryRejection(#[from] QueryRejection),
    #[error("Incoming JSON rejected: {0}")]
    JsonRejection(#[from] JsonRejection),
    #[error("Multipart request rejected: {0}")]
    MultipartRejection(#[from] MultipartRejection),
    #[error("Multipart request could not be read: {0}")]
    Multipart(#[from] MultipartError),
    #[error("JSON response could not be serialized: {0}")]
    JsonResponse(#[from] serde_json::Error),
    #[error("Authorization header was missing or invalid: {0}")]
    InvalidAuthorizationHeader(TypedHeaderRejection),
    #[error("The provided auth token could not be decoded: {0}")]
    InvalidAuthToken(#[from] AuthTokenDecodeError),
    #[error("The auth token could not be hashed: {0}")]
    AuthTokenHash(#[from] AuthTokenHashError),
    #[error("Provided token was invalid")]
    InvalidToken,
    #[error("Invalid handle or password")]
    InvalidCredentials,
    #[error(transparent)]
    PasswordHashing(#[from] PasswordHashingError),
    #[error("A blocking task failed: {0}")]
    Join(#[from] JoinError),
    #[error(transparent)]
    Database(#[from] DbError),
    #[error(transparent)]
    InvalidPostContent(#[from] InvalidPostContentError),
    #[error(transparent)]
    Submission(#[from] SubmissionError),
    #[error("{0}")]
    PostRejected(RejectionReason),
    #[error("Post with id {0} was not found.")]
    PostByIdNotFound(Id<PostMarker>),
    #[error("Post with id {0} has no image.")]
    PostImageNotFound(Id<PostMarker>),
    #[error("Comment with id {0} was not found.")]
    CommentByIdNotFound(Id<CommentMarker>),
    #[error("User {0} was not found.")]
    UserByHandleNotFound(UserHandle),
    #[error("The authenticated user no longer exists.")]
    AuthenticatedUserMissing,
}

impl ServerError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServerError::UnknownRoute(_)
            | ServerError::PathRejection(_)
            | ServerError::PostByIdNotFound(_)
            | ServerError::PostImageNotFound(_)
            | ServerError::CommentByIdNotFound(_)
            | ServerError::UserByHandleNotFound(_) => StatusCode::NOT_FOUND,
            ServerError::InvalidAuthorizationHeader(rejection) if rejection.is_missing() => {
                StatusCode::UNAUTHORIZED
            }
            ServerError::InvalidToken
            | ServerError::InvalidCredentials
            | ServerError::AuthenticatedUserMissing => StatusCode::UNAUTHORIZED,
            ServerError::QueryRejection(_)
            | ServerError::InvalidPostContent(_)
            | ServerError::InvalidAuthorizationHeader(_)
            | ServerError::InvalidAuthToken(_) => StatusCode::BAD_REQUEST,
            ServerError::JsonRejection(rejection) => rejection.status(),
            ServerError::MultipartRejection(rejection) => rejection.status(),
            ServerError::Multipart(err) => err.status(),
            ServerError::PostRejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ServerError::Database(DbError::HandleTaken(_)) => StatusCode::CONFLICT,
            ServerError::Submission(err) => err.status(),
            ServerError::JsonResponse(_)
            | ServerError::Database(_)
            | ServerError::AuthTokenHash(_)
            | ServerError::PasswordHashing(_)
            | ServerError::Join(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message shown to the client. Server-side failures stay in the logs.
    fn message(&self) -> String {
        if self.status().is_server_error() {
            "Internal server error".to_owned()
        } else {
            self.to_string()
        }
    }
}

#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Hash, Serialize, Deserialize)]
struct ErrorResponse {
    status: u16,
    message: String,
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();

        if status.is_server_error() {
            error!(error = %self, %status, "Replying with error");
        } else {
            warn!(error = %self, %status, "Replying with error");
        }

        let error_response = ErrorResponse {
            status: status.as_u16(),
            message: self.message(),
        };
        (status, Json(error_response)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use crate::server::{
        ServerError,
        submission::{RejectionReason, SubmissionError},
    };
    use axum::http::StatusCode;
    use safefeed_common::model::user::UserHandle;
    use safefeed_db::client::DbError;

    #[test]
    fn statuses() {
        assert_eq!(
            ServerError::PostRejected(RejectionReason::Nsfw).status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ServerError::Database(DbError::HandleTaken(
                UserHandle::new("taken".to_owned()).unwrap()
            ))
            .status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ServerError::Submission(SubmissionError::Empty).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServerError::InvalidCredentials.status(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn messages() {
        assert_eq!(
            ServerError::PostRejected(RejectionReason::Nsfw).message(),
            "The image is NSFW and cannot be posted."
        );
        assert_eq!(
            ServerError::InvalidCredentials.message(),
            "Invalid handle or password"
        );
    }
}
