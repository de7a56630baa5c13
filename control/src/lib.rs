//! BFE Ingress Controller Library
//!
//! Exposes the compiler, configuration and Kubernetes watchers for the
//! binary and integration tests

pub mod apis;
pub mod compiler;
pub mod config;
pub mod error;
