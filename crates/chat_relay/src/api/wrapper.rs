use anyhow::Error;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;

use crate::api::error::InnerApiError;

#[derive(ToSchema, Serialize)]
pub struct ApiResponse<T: Serialize> {
    status_code: u16,
    data: T,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self { status_code: 200, data }
    }
}

impl<T> IntoResponse for ApiResponse<T>
where
    T: Serialize,
{
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

pub struct ApiError(Error);

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(value: E) -> Self {
        Self(value.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Some(inner_error) = self.0.downcast_ref::<InnerApiError>() {
            let status = match inner_error {
                InnerApiError::Unauthorized => StatusCode::UNAUTHORIZED,
                InnerApiError::Forbidden => StatusCode::FORBIDDEN,
                InnerApiError::NotFound(_) => StatusCode::NOT_FOUND,
                InnerApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            };
            return (
                status,
                Json(ApiResponse {
                    status_code: status.as_u16(),
                    data: inner_error.to_string(),
                }),
            )
                .into_response();
        }
        tracing::error!("请求处理失败: {:#}", self.0);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse {
                status_code: 500,
                data: format!("{:#}", self.0),
            }),
        )
            .into_response()
    }
}
