use std::io;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, FleetError>;

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("device {0} is registered to another organization")]
    OwnershipConflict(String),
    #[error("device not found")]
    DeviceNotFound,
    #[error("command not found")]
    CommandNotFound,
    #[error("organization not found")]
    OrgNotFound,
    #[error("user not found")]
    UserNotFound,
    #[error("command backlog full for device")]
    QueueFull,
    #[error("malformed input: {0}")]
    Malformed(String),
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<toml::de::Error> for FleetError {
    fn from(err: toml::de::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::ser::Error> for FleetError {
    fn from(err: toml::ser::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for FleetError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    message: &'a str,
}

impl IntoResponse for FleetError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::Config(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::OwnershipConflict(_) => StatusCode::CONFLICT,
            Self::DeviceNotFound
            | Self::CommandNotFound
            | Self::OrgNotFound
            | Self::UserNotFound => StatusCode::NOT_FOUND,
            Self::QueueFull => StatusCode::TOO_MANY_REQUESTS,
            Self::Malformed(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Storage(_) | Self::Io(_) | Self::Serialization(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let message = self.to_string();
        (status, Json(ErrorBody { message: &message })).into_response()
    }
}
