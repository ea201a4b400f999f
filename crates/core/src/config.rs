//! Runtime configuration (SPEC_FULL.md §11), covering the env vars spec.md
//! §6 lists that the runtime itself consumes: the database location and the
//! WireGuard server-side defaults used by peer registration (component J).
//!
//! `m360-web`'s `config` module layers the HTTP-facing vars (`SUPABASE_*`,
//! `FRONTEND_BASE_URL`) on top of this one, following the teacher's
//! `DaemonConfig`/`main.rs` split between a runtime config and a surface
//! config.

use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub run_db_migrations: bool,
    pub wg_pool_cidr: Option<String>,
    pub wg_server_public_key: Option<String>,
    pub wg_endpoint_host: Option<String>,
    pub wg_endpoint_port: u16,
    pub wg_dns_default: Option<String>,
    pub wg_interface: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            database_url: env::var("DATABASE_URL").unwrap_or_else(|_| "m360.sqlite3".to_string()),
            run_db_migrations: env::var("RUN_DB_MIGRATIONS").map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false),
            wg_pool_cidr: env::var("WG_POOL_CIDR").ok(),
            wg_server_public_key: env::var("WG_SERVER_PUBLIC_KEY").ok(),
            wg_endpoint_host: env::var("WG_ENDPOINT_HOST").ok(),
            wg_endpoint_port: env::var("WG_ENDPOINT_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(51820),
            wg_dns_default: env::var("WG_DNS_DEFAULT").ok(),
            wg_interface: env::var("WG_INTERFACE").unwrap_or_else(|_| "wg0".to_string()),
        }
    }

    /// `sqlite::memory:` (as spec.md §6 allows for `DATABASE_URL`) selects an
    /// in-process database instead of a file.
    pub fn is_memory(&self) -> bool {
        self.database_url == "sqlite::memory:"
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "m360.sqlite3".to_string(),
            run_db_migrations: false,
            wg_pool_cidr: None,
            wg_server_public_key: None,
            wg_endpoint_host: None,
            wg_endpoint_port: 51820,
            wg_dns_default: None,
            wg_interface: "wg0".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.wg_endpoint_port, 51820);
        assert!(!cfg.run_db_migrations);
    }
}
