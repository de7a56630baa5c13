//! Kubernetes API integrations
//!
//! This module contains the watchers and the reconciler feeding Ingress
//! resources (networking.k8s.io/v1) into the compiler.

pub mod ingress;
pub mod metrics;
