use std::net::IpAddr;
use thiserror::Error;
use url::Url;

/// Errors that can occur while validating the backend base URL.
#[derive(Error, Debug)]
pub enum UrlValidationError {
    /// The URL string could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// The URL uses a scheme other than http or https.
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    /// The URL has no host component.
    #[error("URL has no host")]
    MissingHost,
    /// Plain HTTP to a non-loopback host.
    #[error("HTTPS required (plain HTTP is only allowed for localhost)")]
    Insecure,
}

/// Validates the base URL of the hosted backend.
///
/// The API key and access token travel with every request, so the backend
/// must be reached over HTTPS. Plain HTTP is accepted only for loopback
/// hosts, which is how tests point the client at a local mock server.
///
/// # Examples
///
/// ```
/// use petdocs::util::validate_base_url;
///
/// let url = validate_base_url("https://proj.example.com").unwrap();
/// assert_eq!(url.host_str(), Some("proj.example.com"));
///
/// // Local mock servers may use plain HTTP
/// assert!(validate_base_url("http://127.0.0.1:54321").is_ok());
///
/// // Remote hosts may not
/// assert!(validate_base_url("http://proj.example.com").is_err());
/// assert!(validate_base_url("file:///etc/passwd").is_err());
/// ```
pub fn validate_base_url(url_str: &str) -> Result<Url, UrlValidationError> {
    let url = Url::parse(url_str)?;

    let scheme = url.scheme().to_owned();
    if scheme != "http" && scheme != "https" {
        return Err(UrlValidationError::UnsupportedScheme(scheme));
    }

    let host = url.host_str().ok_or(UrlValidationError::MissingHost)?;

    if scheme == "http" && !is_loopback_host(host) {
        tracing::error!(base_url = %url_str, "Rejecting non-HTTPS backend URL");
        return Err(UrlValidationError::Insecure);
    }
    if scheme == "http" {
        tracing::warn!(base_url = %url_str, "Using non-HTTPS backend URL (localhost only)");
    }

    Ok(url)
}

fn is_loopback_host(host: &str) -> bool {
    if host == "localhost" {
        return true;
    }

    // Strip brackets from IPv6 addresses for parsing
    let host_for_parse = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    host_for_parse
        .parse::<IpAddr>()
        .map(|ip| ip.is_loopback())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_https_accepted() {
        let url = validate_base_url("https://abc.supabase.co").unwrap();
        assert_eq!(url.scheme(), "https");
    }

    #[test]
    fn test_loopback_http_accepted() {
        assert!(validate_base_url("http://localhost:8080").is_ok());
        assert!(validate_base_url("http://127.0.0.1:8080").is_ok());
        assert!(validate_base_url("http://[::1]:8080").is_ok());
    }

    #[test]
    fn test_remote_http_rejected() {
        assert!(matches!(
            validate_base_url("http://abc.supabase.co"),
            Err(UrlValidationError::Insecure)
        ));
        assert!(matches!(
            validate_base_url("http://192.168.1.10"),
            Err(UrlValidationError::Insecure)
        ));
    }

    #[test]
    fn test_unsupported_scheme() {
        assert!(matches!(
            validate_base_url("ftp://abc.supabase.co"),
            Err(UrlValidationError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(
            validate_base_url("not a url"),
            Err(UrlValidationError::InvalidUrl(_))
        ));
    }
}
