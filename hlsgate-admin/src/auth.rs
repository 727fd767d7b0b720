//! API key validation for the admin surface.
//!
//! Two accepted forms: `Bearer {api_key}` and the bare key.
//! Comparison is exact and case-sensitive; stray whitespace fails.

/// Validate an Authorization header value against the configured key.
pub fn validate_api_key(authorization: Option<&str>, expected: &str) -> bool {
    let Some(auth) = authorization else {
        return false;
    };
    if auth.is_empty() || expected.is_empty() {
        return false;
    }

    if let Some(token) = auth.strip_prefix("Bearer ") {
        return token == expected;
    }

    auth == expected
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "F2UkWEJZRBxC7";

    #[test]
    fn bearer_form_accepted() {
        assert!(validate_api_key(Some("Bearer F2UkWEJZRBxC7"), KEY));
    }

    #[test]
    fn bare_form_accepted() {
        assert!(validate_api_key(Some("F2UkWEJZRBxC7"), KEY));
    }

    #[test]
    fn missing_or_empty_rejected() {
        assert!(!validate_api_key(None, KEY));
        assert!(!validate_api_key(Some(""), KEY));
    }

    #[test]
    fn wrong_key_rejected() {
        assert!(!validate_api_key(Some("Bearer nope"), KEY));
        assert!(!validate_api_key(Some("nope"), KEY));
    }

    #[test]
    fn whitespace_and_case_matter() {
        assert!(!validate_api_key(Some("Bearer F2UkWEJZRBxC7 "), KEY));
        assert!(!validate_api_key(Some(" F2UkWEJZRBxC7"), KEY));
        assert!(!validate_api_key(Some("bearer F2UkWEJZRBxC7"), KEY));
        assert!(!validate_api_key(Some("Bearer f2ukwejzrbxc7"), KEY));
    }

    #[test]
    fn unconfigured_key_locks_the_surface() {
        assert!(!validate_api_key(Some("anything"), ""));
        assert!(!validate_api_key(Some(""), ""));
    }
}
