//! HTTP API route handlers.

pub mod changes;
pub mod config;
pub mod graphql;
