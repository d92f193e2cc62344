use std::time::Duration;

use tablegate_auth::{OidcAuthenticator, OidcConfig};

fn base_config() -> OidcConfig {
    OidcConfig {
        issuer: "https://issuer.example".to_string(),
        audience: None,
        jwks_url: None,
        jwks_json: Some(r#"{"keys": []}"#.to_string()),
        jwks_timeout: Duration::from_millis(200),
        jwks_refresh_ttl: Duration::from_secs(300),
        clock_skew: Duration::from_secs(60),
        principal_id_claim: "sub".to_string(),
        roles_claim: "roles".to_string(),
    }
}

#[tokio::test]
async fn empty_issuer_is_rejected() {
    let mut config = base_config();
    config.issuer = " ".to_string();
    let err = OidcAuthenticator::new(config).await.unwrap_err();
    assert_eq!(err.code, "ERR_INVALID_CONFIG");
}

#[tokio::test]
async fn missing_jwks_source_is_rejected() {
    let mut config = base_config();
    config.jwks_json = None;
    let err = OidcAuthenticator::new(config).await.unwrap_err();
    assert_eq!(err.code, "ERR_INVALID_CONFIG");
}

#[tokio::test]
async fn malformed_jwks_json_is_rejected() {
    let mut config = base_config();
    config.jwks_json = Some("not-json".to_string());
    let err = OidcAuthenticator::new(config).await.unwrap_err();
    assert_eq!(err.code, "ERR_INVALID_CONFIG");
}

#[tokio::test]
async fn token_for_unknown_kid_is_rejected() {
    let auth = OidcAuthenticator::new(base_config())
        .await
        .expect("authenticator should build from inline JWKS");

    let mut headers = http::HeaderMap::new();
    headers.insert(
        http::header::AUTHORIZATION,
        "Bearer not.a.token".parse().unwrap(),
    );
    let err = auth.authenticate(&headers).await.unwrap_err();
    assert_eq!(err.code, "ERR_AUTH_INVALID");
}
