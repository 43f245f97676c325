//! # Failure Classification
//!
//! Maps `kube::Error` into [`ApiError`] with a transient/terminal verdict.
//!
//! | Failure | Class |
//! |---|---|
//! | 429, 5xx, 409 `Conflict`, 408/504 timeouts | Transient |
//! | transport (hyper, service, HTTP) | Transient |
//! | 400, 401, 403, 404, 422, 409 `AlreadyExists` | Terminal |
//! | serialization, kubeconfig, auth | Terminal |

use super::{ApiError, FailureClass};

/// Classify an HTTP status plus reason reported by the API server
#[must_use]
pub fn classify_status(status: u16, reason: &str) -> FailureClass {
    match status {
        409 if reason == "AlreadyExists" => FailureClass::Terminal,
        409 | 408 | 429 => FailureClass::Transient,
        s if s >= 500 => FailureClass::Transient,
        _ => FailureClass::Terminal,
    }
}

impl From<kube::Error> for ApiError {
    fn from(error: kube::Error) -> Self {
        match error {
            kube::Error::Api(response) => {
                let class = classify_status(response.code, &response.reason);
                ApiError {
                    class,
                    status: Some(response.code),
                    reason: Some(response.reason),
                    message: response.message,
                }
            }
            kube::Error::HyperError(e) => ApiError::transient(format!("transport error: {e}")),
            kube::Error::Service(e) => ApiError::transient(format!("service error: {e}")),
            kube::Error::HttpError(e) => ApiError::transient(format!("HTTP error: {e}")),
            kube::Error::SerdeError(e) => ApiError::terminal(format!("serialization error: {e}")),
            other => ApiError::terminal(other.to_string()),
        }
    }
}

impl From<kube_runtime::watcher::Error> for ApiError {
    fn from(error: kube_runtime::watcher::Error) -> Self {
        // Watch failures never abort a wait; the readiness watcher falls back to polling
        ApiError::transient(format!("watch failed: {error}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_statuses() {
        assert_eq!(classify_status(429, "TooManyRequests"), FailureClass::Transient);
        assert_eq!(classify_status(500, "InternalError"), FailureClass::Transient);
        assert_eq!(classify_status(503, "ServiceUnavailable"), FailureClass::Transient);
        assert_eq!(classify_status(504, "Timeout"), FailureClass::Transient);
        assert_eq!(classify_status(409, "Conflict"), FailureClass::Transient);
    }

    #[test]
    fn test_terminal_statuses() {
        assert_eq!(classify_status(400, "BadRequest"), FailureClass::Terminal);
        assert_eq!(classify_status(401, "Unauthorized"), FailureClass::Terminal);
        assert_eq!(classify_status(403, "Forbidden"), FailureClass::Terminal);
        assert_eq!(classify_status(404, "NotFound"), FailureClass::Terminal);
        assert_eq!(classify_status(422, "Invalid"), FailureClass::Terminal);
        assert_eq!(classify_status(409, "AlreadyExists"), FailureClass::Terminal);
    }

    #[test]
    fn test_api_error_response_keeps_status_and_reason() {
        let error = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "pods \"db\" already exists".to_string(),
            reason: "AlreadyExists".to_string(),
            code: 409,
        });
        let api_error = ApiError::from(error);
        assert_eq!(
            api_error,
            ApiError::terminal("pods \"db\" already exists").with_status(409, "AlreadyExists")
        );
        assert!(api_error.is_already_exists());
    }
}
