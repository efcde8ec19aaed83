//! Standardized mapping of HTTP and transport failures onto [`RegistryError`]

use crate::error::RegistryError;
use reqwest::StatusCode;

/// Standard error handler for HTTP responses
pub struct HttpErrorHandler;

impl HttpErrorHandler {
    /// Map a non-success registry response to an error for `operation` on `subject`
    pub fn handle_registry_error(
        status: StatusCode,
        error_text: &str,
        operation: &str,
        subject: &str,
    ) -> RegistryError {
        match status.as_u16() {
            401 => RegistryError::AuthRequired(format!(
                "Unauthorized to perform {} on {}: {}",
                operation,
                subject,
                summarize(error_text)
            )),
            403 => RegistryError::AuthRequired(format!(
                "Forbidden: insufficient permissions for {} on {}: {}",
                operation,
                subject,
                summarize(error_text)
            )),
            404 => RegistryError::NotFound(format!("{} ({})", subject, operation)),
            code => {
                let message = match code {
                    400 if error_text.contains("DIGEST_INVALID") => format!(
                        "Registry reports uploaded content does not match digest during {}: {}",
                        operation,
                        summarize(error_text)
                    ),
                    400 => format!("Bad request during {}: {}", operation, summarize(error_text)),
                    413 => format!("Content too large for {}", operation),
                    429 => format!("Rate limited during {}", operation),
                    500 => format!(
                        "Registry server error during {}: {}",
                        operation,
                        summarize(error_text)
                    ),
                    502 | 503 => format!("Registry unavailable during {}", operation),
                    507 => format!("Registry out of storage during {}", operation),
                    _ => format!("{} failed: {}", operation, summarize(error_text)),
                };
                RegistryError::Registry {
                    status: code,
                    message,
                }
            }
        }
    }

    /// Handle token endpoint failures
    pub fn handle_auth_error(status: StatusCode, error_text: &str) -> RegistryError {
        let error_msg = match status.as_u16() {
            400 => "Invalid token request parameters".to_string(),
            401 => "Invalid credentials provided".to_string(),
            403 => "Access denied - insufficient permissions".to_string(),
            404 => "Authentication endpoint not found".to_string(),
            _ => format!(
                "Token request failed (status {}): {}",
                status,
                summarize(error_text)
            ),
        };

        RegistryError::AuthRequired(error_msg)
    }
}

/// Network error categorization and handling
pub struct NetworkErrorHandler;

impl NetworkErrorHandler {
    /// Categorize and format network errors with helpful context
    pub fn handle_network_error(error: &reqwest::Error, context: &str) -> RegistryError {
        if error.is_timeout() {
            RegistryError::Network(format!("{} timed out: {}", context, error))
        } else if error.is_connect() {
            RegistryError::Network(format!("Connection error during {}: {}", context, error))
        } else if error.is_body() || error.is_decode() {
            RegistryError::Network(format!("Response body error during {}: {}", context, error))
        } else if error.to_string().contains("certificate") {
            RegistryError::Network(format!(
                "TLS certificate error during {}: {}",
                context, error
            ))
        } else {
            RegistryError::Network(format!("{} network error: {}", context, error))
        }
    }
}

// Registry error bodies can be whole HTML pages.
fn summarize(error_text: &str) -> String {
    let trimmed = error_text.trim();
    if trimmed.chars().count() > 200 {
        let head: String = trimmed.chars().take(200).collect();
        format!("{}...", head)
    } else {
        trimmed.to_string()
    }
}
