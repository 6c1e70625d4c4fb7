// SoCap session agent - library root

pub mod auth;
pub mod backend;
pub mod clock;
pub mod config;
pub mod error;
pub mod identity;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod store;
