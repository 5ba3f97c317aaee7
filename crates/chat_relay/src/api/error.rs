use thiserror::Error;

#[derive(Error, Debug)]
pub enum InnerApiError {
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Forbidden")]
    Forbidden,
    #[error("Primary key not found: {0}")]
    NotFound(i32),
    #[error("Bad request: {0}")]
    BadRequest(String),
}
