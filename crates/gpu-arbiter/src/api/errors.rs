use core::error::Error;

/// API errors
#[derive(Debug, derive_more::Display)]
pub enum ApiError {
    #[display("Server error: {message}")]
    ServerError { message: String },
}

impl Error for ApiError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_display_formatting() {
        let server_error = ApiError::ServerError {
            message: "address already in use".to_string(),
        };
        assert_eq!(
            server_error.to_string(),
            "Server error: address already in use"
        );
    }
}
