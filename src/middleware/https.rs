use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::state::AppState;

/// Redirect plain-HTTP requests to HTTPS with 307 so the method is preserved.
///
/// TLS is terminated in front of this service, so the original scheme comes
/// from `X-Forwarded-Proto`. Inactive until an HTTPS port is configured.
pub async fn https_redirect(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(https_port) = state.config.security.https_port else {
        return next.run(request).await;
    };

    if forwarded_scheme(request.headers()).eq_ignore_ascii_case("https") {
        return next.run(request).await;
    }

    let Some(host) = request_host(&request) else {
        tracing::warn!("Cannot redirect to HTTPS without a Host header");
        return next.run(request).await;
    };

    let path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let location = https_location(&host, https_port, path);

    tracing::debug!(%location, "Redirecting to HTTPS");
    (StatusCode::TEMPORARY_REDIRECT, [(header::LOCATION, location)]).into_response()
}

fn forwarded_scheme(headers: &HeaderMap) -> &str {
    headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .unwrap_or("http")
}

fn request_host(request: &Request) -> Option<String> {
    request
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| request.uri().authority().map(|a| a.as_str().to_string()))
}

fn https_location(host: &str, port: u16, path: &str) -> String {
    // Drop any port on the incoming host, keeping IPv6 brackets intact
    let hostname = match host.rfind(':') {
        Some(idx) if !host[idx..].contains(']') => &host[..idx],
        _ => host,
    };
    if port == 443 {
        format!("https://{}{}", hostname, path)
    } else {
        format!("https://{}:{}{}", hostname, port, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_location_replaces_port() {
        assert_eq!(
            https_location("api.example.com:8080", 443, "/health?x=1"),
            "https://api.example.com/health?x=1"
        );
        assert_eq!(https_location("api.example.com", 8443, "/"), "https://api.example.com:8443/");
        assert_eq!(https_location("[::1]:80", 443, "/a"), "https://[::1]/a");
        assert_eq!(https_location("[::1]", 443, "/a"), "https://[::1]/a");
    }

    #[test]
    fn test_forwarded_scheme_uses_first_hop() {
        let mut headers = HeaderMap::new();
        assert_eq!(forwarded_scheme(&headers), "http");
        headers.insert("x-forwarded-proto", HeaderValue::from_static("https, http"));
        assert_eq!(forwarded_scheme(&headers), "https");
    }
}
