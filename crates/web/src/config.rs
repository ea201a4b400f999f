//! HTTP-surface configuration (SPEC_FULL.md §11), layered on top of
//! `m360_core::Config`: the vars spec.md §6 lists that only the web surface
//! consumes (JWT verification, CORS/frontend origin).

use std::env;

/// How an inbound bearer JWT is verified. Both branches are spec.md §9's
/// "accept both symmetric (shared secret) and asymmetric (JWKS)".
#[derive(Debug, Clone)]
pub enum JwtVerification {
    /// `SUPABASE_JWT_SECRET` — HS256 shared secret, the common Supabase case.
    SharedSecret(String),
    /// JWKS fetched from `{SUPABASE_URL}/auth/v1/.well-known/jwks.json` (or
    /// an explicit override), cached with a time-based refresh.
    Jwks { url: String },
}

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub bind_addr: String,
    pub jwt: JwtVerification,
    pub frontend_base_url: Option<String>,
    pub supabase_project_ref: Option<String>,
}

impl WebConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8000".to_string());
        let frontend_base_url = env::var("FRONTEND_BASE_URL").ok();
        let supabase_project_ref = env::var("SUPABASE_PROJECT_REF").ok();

        let jwt = if let Ok(secret) = env::var("SUPABASE_JWT_SECRET") {
            JwtVerification::SharedSecret(secret)
        } else {
            let url = env::var("SUPABASE_URL")
                .map_err(|_| anyhow::anyhow!("neither SUPABASE_JWT_SECRET nor SUPABASE_URL is set"))?;
            JwtVerification::Jwks { url: format!("{}/auth/v1/.well-known/jwks.json", url.trim_end_matches('/')) }
        };

        Ok(Self { bind_addr, jwt, frontend_base_url, supabase_project_ref })
    }
}
