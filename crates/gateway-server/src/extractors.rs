//! Custom Axum extractors.

use axum::extract::FromRequestParts;
use axum::http::{header, request::Parts};

/// Rate-limit subject for a request.
//
// Key issuance/authentication is an external collaborator: the subject is
// taken from the caller-supplied `x-api-key` header or the bearer token,
// with an anonymous bucket as the fallback.
#[derive(Debug, Clone)]
pub struct Subject(pub String);

/// Fallback subject when no credential accompanies the request
pub const ANONYMOUS_SUBJECT: &str = "anonymous";

#[axum::async_trait]
impl<S> FromRequestParts<S> for Subject
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(key) = parts
            .headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
        {
            return Ok(Self(key.to_string()));
        }

        if let Some(token) = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .filter(|v| !v.is_empty())
        {
            return Ok(Self(token.to_string()));
        }

        Ok(Self(ANONYMOUS_SUBJECT.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(request: Request<()>) -> Subject {
        let (mut parts, ()) = request.into_parts();
        Subject::from_request_parts(&mut parts, &())
            .await
            .expect("infallible")
    }

    #[tokio::test]
    async fn test_api_key_header_preferred() {
        let request = Request::builder()
            .header("x-api-key", "sk-123")
            .header("authorization", "Bearer tok")
            .body(())
            .expect("request");

        assert_eq!(extract(request).await.0, "sk-123");
    }

    #[tokio::test]
    async fn test_bearer_token_fallback() {
        let request = Request::builder()
            .header("authorization", "Bearer tok")
            .body(())
            .expect("request");

        assert_eq!(extract(request).await.0, "tok");
    }

    #[tokio::test]
    async fn test_anonymous_default() {
        let request = Request::builder().body(()).expect("request");
        assert_eq!(extract(request).await.0, ANONYMOUS_SUBJECT);
    }
}
