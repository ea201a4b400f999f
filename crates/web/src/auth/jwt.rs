//! Bearer JWT verification (spec.md §4.G, §9: "JWT verification... accept
//! both symmetric (shared secret) and asymmetric (JWKS) algorithms; cache
//! the JWKS with time-based refresh; never trust `aud`").
//!
//! This backend only needs the verified `sub` claim — it is the tenant's
//! `owner_id` for everything downstream. No audience check is performed
//! (spec.md is explicit: "never trust `aud`").

use crate::config::JwtVerification;
use base64::Engine;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

const JWKS_REFRESH_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
}

#[derive(Debug, Deserialize)]
struct Jwk {
    kid: Option<String>,
    kty: String,
    n: Option<String>,
    e: Option<String>,
    alg: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JwkSet {
    keys: Vec<Jwk>,
}

struct CachedJwks {
    keys: Vec<Jwk>,
    fetched_at: Instant,
}

/// Verifies bearer JWTs against either a shared secret or a cached JWKS.
pub struct JwtVerifier {
    mode: JwtVerification,
    http: reqwest::Client,
    cache: RwLock<Option<CachedJwks>>,
}

impl JwtVerifier {
    pub fn new(mode: JwtVerification) -> Arc<Self> {
        Arc::new(Self { mode, http: reqwest::Client::new(), cache: RwLock::new(None) })
    }

    /// Returns the verified `sub` claim, to be used as `owner_id`.
    pub async fn verify(&self, token: &str) -> Option<String> {
        match &self.mode {
            JwtVerification::SharedSecret(secret) => {
                let mut validation = Validation::new(Algorithm::HS256);
                validation.validate_aud = false;
                let key = DecodingKey::from_secret(secret.as_bytes());
                decode::<Claims>(token, &key, &validation).ok().map(|d| d.claims.sub)
            }
            JwtVerification::Jwks { url } => self.verify_via_jwks(token, url).await,
        }
    }

    async fn verify_via_jwks(&self, token: &str, url: &str) -> Option<String> {
        let header = decode_header(token).ok()?;
        let jwk = self.find_key(url, header.kid.as_deref()).await?;
        let alg = match jwk.alg.as_deref() {
            Some("RS256") | None => Algorithm::RS256,
            Some(other) => {
                warn!(alg = other, "unsupported JWKS alg (only RS256 is supported)");
                return None;
            }
        };
        let n = jwk.n.as_deref()?;
        let e = jwk.e.as_deref()?;
        let key = DecodingKey::from_rsa_components(n, e).ok()?;
        let mut validation = Validation::new(alg);
        validation.validate_aud = false;
        decode::<Claims>(token, &key, &validation).ok().map(|d| d.claims.sub)
    }

    async fn find_key(&self, url: &str, kid: Option<&str>) -> Option<Jwk> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.as_ref() {
                if cached.fetched_at.elapsed() < JWKS_REFRESH_INTERVAL {
                    if let Some(k) = pick_key(&cached.keys, kid) {
                        return Some(k);
                    }
                }
            }
        }
        self.refresh(url).await;
        let cache = self.cache.read().await;
        cache.as_ref().and_then(|c| pick_key(&c.keys, kid))
    }

    async fn refresh(&self, url: &str) {
        debug!(url, "refreshing JWKS");
        let resp = match self.http.get(url).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "JWKS fetch failed");
                return;
            }
        };
        let set: JwkSet = match resp.json().await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "JWKS parse failed");
                return;
            }
        };
        let mut cache = self.cache.write().await;
        *cache = Some(CachedJwks { keys: set.keys, fetched_at: Instant::now() });
    }
}

fn pick_key(keys: &[Jwk], kid: Option<&str>) -> Option<Jwk> {
    keys.iter()
        .filter(|k| k.kty == "RSA" || k.kty == "EC")
        .find(|k| match (kid, &k.kid) {
            (Some(want), Some(have)) => want == have,
            (None, _) => true,
            _ => false,
        })
        .map(|k| Jwk { kid: k.kid.clone(), kty: k.kty.clone(), n: k.n.clone(), e: k.e.clone(), alg: k.alg.clone() })
}

/// Extracts a bearer token from the `Authorization` header, a `?token=`
/// query parameter, or the `sb-access-token` cookie, in that order
/// (spec.md §4.G).
pub fn extract_token(headers: &axum::http::HeaderMap, query: Option<&str>, cookie: Option<&str>) -> Option<String> {
    if let Some(auth) = headers.get(axum::http::header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        if let Some(tok) = auth.strip_prefix("Bearer ") {
            return Some(tok.to_string());
        }
    }
    if let Some(tok) = query {
        if !tok.is_empty() {
            return Some(tok.to_string());
        }
    }
    cookie.map(|c| c.to_string())
}

/// Decodes a JWT's payload without verifying its signature, used only by
/// the `/api/debug/dump-token` diagnostic route.
pub fn unsafe_decode_payload(token: &str) -> Option<serde_json::Value> {
    let mut parts = token.split('.');
    let _header = parts.next()?;
    let payload = parts.next()?;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(payload).ok()?;
    serde_json::from_slice(&bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn hs256_token(secret: &str, sub: &str, aud: Option<&str>) -> String {
        #[derive(serde::Serialize)]
        struct Out<'a> {
            sub: &'a str,
            #[serde(skip_serializing_if = "Option::is_none")]
            aud: Option<&'a str>,
        }
        encode(&Header::new(Algorithm::HS256), &Out { sub, aud }, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    #[tokio::test]
    async fn shared_secret_round_trips_the_sub_claim() {
        let verifier = JwtVerifier::new(JwtVerification::SharedSecret("top-secret".into()));
        let token = hs256_token("top-secret", "tenant-42", None);
        assert_eq!(verifier.verify(&token).await.as_deref(), Some("tenant-42"));
    }

    #[tokio::test]
    async fn shared_secret_rejects_wrong_key() {
        let verifier = JwtVerifier::new(JwtVerification::SharedSecret("top-secret".into()));
        let token = hs256_token("wrong-secret", "tenant-42", None);
        assert!(verifier.verify(&token).await.is_none());
    }

    #[tokio::test]
    async fn shared_secret_never_checks_audience() {
        // spec.md is explicit that `aud` is never validated -- a token
        // minted for an unrelated audience still verifies.
        let verifier = JwtVerifier::new(JwtVerification::SharedSecret("top-secret".into()));
        let token = hs256_token("top-secret", "tenant-42", Some("some-other-service"));
        assert_eq!(verifier.verify(&token).await.as_deref(), Some("tenant-42"));
    }

    #[test]
    fn extract_token_prefers_header_over_query_over_cookie() {
        let mut headers = axum::http::HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, "Bearer from-header".parse().unwrap());
        assert_eq!(extract_token(&headers, Some("from-query"), Some("from-cookie")).as_deref(), Some("from-header"));

        let empty = axum::http::HeaderMap::new();
        assert_eq!(extract_token(&empty, Some("from-query"), Some("from-cookie")).as_deref(), Some("from-query"));
        assert_eq!(extract_token(&empty, None, Some("from-cookie")).as_deref(), Some("from-cookie"));
        assert_eq!(extract_token(&empty, None, None), None);
    }
}
