use axum::http::HeaderMap;


/// Header carrying the authenticated user id, set by the upstream auth layer
pub const USER_ID_HEADER: &str = "x-user-id";

/// Extract the authenticated user id from request headers
///
/// Expected format: "X-User-Id: <positive integer>"
pub fn extract_user_id(headers: &HeaderMap) -> Result<i64, UserIdError> {
    let value = headers
        .get(USER_ID_HEADER)
        .ok_or(UserIdError::Missing)?
        .to_str()
        .map_err(|_| UserIdError::InvalidFormat)?;

    parse_user_id(value)
}

/// Parse a user id header value
///
/// Internal helper for extract_user_id
fn parse_user_id(value: &str) -> Result<i64, UserIdError> {
    let value = value.trim();

    if value.is_empty() {
        return Err(UserIdError::Empty);
    }

    match value.parse::<i64>() {
        Ok(id) if id > 0 => Ok(id),
        _ => Err(UserIdError::InvalidFormat),
    }
}

/// User id extraction errors
#[derive(Debug, PartialEq, Clone)]
pub enum UserIdError {
    /// Header not present
    Missing,
    /// Not a positive integer or not valid ASCII
    InvalidFormat,
    /// Header present but blank
    Empty,
}

impl std::fmt::Display for UserIdError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UserIdError::Missing => write!(f, "User id not provided"),
            UserIdError::InvalidFormat => write!(f, "Invalid user id format"),
            UserIdError::Empty => write!(f, "User id is empty"),
        }
    }
}

impl std::error::Error for UserIdError {}
