//! Session and route guard for the gatepass desk.
//!
//! ARCHITECTURE
//! ============
//! - `credential`: the in-memory token and its decoded identity
//! - `persist`: durable storage and the `pb_auth` cookie
//! - `session`: login/logout/restore over both, with a watchable state
//! - `guard`: per-request path classification and redirects
//! - `records` / `gatepass`: authenticated access to the record store
//! - `routes` / `state`: the axum server surface

pub mod config;
pub mod credential;
pub mod gatepass;
pub mod guard;
pub mod persist;
pub mod records;
pub mod routes;
pub mod session;
pub mod state;
pub mod store;
