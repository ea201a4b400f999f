//! Bearer JWT verification for the monitoring backend (spec.md §4.G, §9).
//!
//! The verified `sub` claim is the only identity fact this backend trusts;
//! there is no session store, no RBAC, no login UI — every route authorizes
//! by `owner_id` equality against tenant-scoped rows.

pub mod jwt;

pub use jwt::JwtVerifier;
