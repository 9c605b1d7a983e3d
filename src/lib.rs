//! svcgate - an HTTPS-terminating reverse proxy gateway
//!
//! This library provides a gateway that:
//! - Routes HTTPS traffic by Host header to configured http:// backends
//! - Applies a per-service policy to plaintext HTTP (proxy, redirect or reject)
//! - Authenticates requests per service (none or htpasswd-backed basic auth)
//! - Wraps routing in a configurable middleware chain (filter, gzip, logging, metrics)
//! - Obtains and renews certificates via ACME HTTP-01
//! - Persists certificate material in an encrypted sql, redis or directory cache

pub mod acme;
pub mod admin;
pub mod auth;
pub mod body;
pub mod cache;
pub mod config;
pub mod error;
pub mod middleware;
pub mod pool;
pub mod proxy;
pub mod router;
