use shared::error::{ApiError, ErrorCode};
use thiserror::Error;

pub type ClientResult<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// Transport unreachable or handshake failed. Reported through the
    /// connection status stream, never returned from a send.
    #[error("connection failed: {0}")]
    Connection(String),
    /// Missing or rejected credential; the session has to be re-established.
    #[error("authentication required: {0}")]
    Authentication(String),
    #[error("request failed ({code:?}): {message}")]
    Request {
        code: ErrorCode,
        status: Option<u16>,
        message: String,
    },
    /// An event referenced an entity the local model does not know yet.
    #[error("event references unknown {entity} {id}")]
    Desync { entity: &'static str, id: i64 },
    #[error("session ended before the operation completed")]
    SessionEnded,
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl ClientError {
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = serde_json::from_str::<ApiError>(body)
            .map(|err| err.detail)
            .unwrap_or_else(|_| truncate_body(body));
        Self::Request {
            code: ErrorCode::from_status(status),
            status: Some(status),
            message,
        }
    }

    /// True when the UI should route the user back to the login entry point.
    pub fn requires_login(&self) -> bool {
        matches!(
            self,
            Self::Authentication(_)
                | Self::Request {
                    code: ErrorCode::Unauthorized,
                    ..
                }
        )
    }

    pub fn is_forbidden(&self) -> bool {
        matches!(
            self,
            Self::Request {
                code: ErrorCode::Forbidden,
                ..
            }
        )
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        let status = err.status().map(|status| status.as_u16());
        Self::Request {
            code: status.map_or(ErrorCode::Internal, ErrorCode::from_status),
            status,
            message: err.to_string(),
        }
    }
}

fn truncate_body(body: &str) -> String {
    const LIMIT: usize = 200;
    let body = body.trim();
    if body.is_empty() {
        return "empty response body".to_string();
    }
    match body.char_indices().nth(LIMIT) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}
