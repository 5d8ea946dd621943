//! Bearer-token extraction shared by the push-fabric handshake.
//!
//! The REST CRUD surface (out of scope for this crate) has its own axum
//! auth layer; this module only extracts and validates the credential a
//! push-fabric client presents on connect.

use crate::auth::{jwt::JwtHandler, models::Claims};

/// Pull a bearer token out of a `?token=` query string or an
/// `Authorization: Bearer ...` header, preferring the query parameter
/// (browsers can't set arbitrary headers on a WebSocket upgrade request).
pub fn extract_bearer(query: Option<&str>, authorization_header: Option<&str>) -> Option<String> {
    let from_query = query.and_then(|q| {
        q.split('&')
            .find(|pair| pair.starts_with("token="))
            .and_then(|pair| pair.split('=').nth(1))
            .map(|t| t.to_string())
    });

    from_query.or_else(|| {
        authorization_header
            .and_then(|h| h.strip_prefix("Bearer "))
            .map(|t| t.to_string())
    })
}

/// Resolve a presented bearer token to a user id, or `None` if missing/invalid.
pub fn resolve_user_id(
    jwt_handler: &JwtHandler,
    query: Option<&str>,
    authorization_header: Option<&str>,
) -> Option<String> {
    let token = extract_bearer(query, authorization_header)?;
    let claims: Claims = jwt_handler.validate_token(&token).ok()?;
    Some(claims.sub)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_query_token_over_header() {
        let token = extract_bearer(Some("token=from-query"), Some("Bearer from-header"));
        assert_eq!(token.as_deref(), Some("from-query"));
    }

    #[test]
    fn falls_back_to_header() {
        let token = extract_bearer(None, Some("Bearer from-header"));
        assert_eq!(token.as_deref(), Some("from-header"));
    }

    #[test]
    fn missing_both_is_none() {
        assert_eq!(extract_bearer(None, None), None);
    }

    #[test]
    fn resolves_a_valid_token_to_its_user_id() {
        let jwt = JwtHandler::new("shh".to_string());
        let (token, _) = jwt.generate_token("user-7").unwrap();
        let query = format!("token={token}");
        let resolved = resolve_user_id(&jwt, Some(&query), None);
        assert_eq!(resolved.as_deref(), Some("user-7"));
    }

    #[test]
    fn rejects_an_invalid_token() {
        let jwt = JwtHandler::new("shh".to_string());
        assert_eq!(
            resolve_user_id(&jwt, None, Some("Bearer not-a-real-token")),
            None
        );
    }
}
