//! URL utilities for consistent URL handling
//!
//! Runtime base URLs arrive from config and the command line with and
//! without trailing slashes; these helpers keep endpoint construction from
//! producing doubled slashes either way.

/// Normalize a base URL by removing trailing slashes.
///
/// # Examples
///
/// ```
/// use brazier::utils::url::normalize_base_url;
///
/// assert_eq!(normalize_base_url("http://localhost:11434"), "http://localhost:11434");
/// assert_eq!(normalize_base_url("http://localhost:11434/"), "http://localhost:11434");
/// ```
pub fn normalize_base_url(base_url: &str) -> String {
    base_url.trim_end_matches('/').to_string()
}

/// Construct a complete endpoint URL from a base URL and endpoint path.
///
/// # Examples
///
/// ```
/// use brazier::utils::url::construct_api_url;
///
/// assert_eq!(
///     construct_api_url("http://localhost:11434", "api/chat"),
///     "http://localhost:11434/api/chat"
/// );
/// assert_eq!(
///     construct_api_url("http://localhost:11434/", "/api/tags"),
///     "http://localhost:11434/api/tags"
/// );
/// ```
pub fn construct_api_url(base_url: &str, endpoint: &str) -> String {
    let normalized_base = normalize_base_url(base_url);
    let endpoint = endpoint.trim_start_matches('/');
    format!("{}/{}", normalized_base, endpoint)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_slashes_are_stripped() {
        assert_eq!(
            normalize_base_url("http://localhost:11434///"),
            "http://localhost:11434"
        );
        assert_eq!(normalize_base_url(""), "");
    }

    #[test]
    fn endpoints_join_without_doubled_slashes() {
        assert_eq!(
            construct_api_url("http://localhost:11434/", "api/chat"),
            "http://localhost:11434/api/chat"
        );
        assert_eq!(
            construct_api_url("http://localhost:11434", "///api/tags"),
            "http://localhost:11434/api/tags"
        );
    }
}
