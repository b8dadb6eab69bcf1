//! Middleware for the Herald server
//!
//! - `auth`: API key extraction and validation

pub mod auth;
