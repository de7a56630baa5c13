//! Ingress-to-config compiler
//!
//! ```text
//!   RoutingResource ──▶ annotations ──┬──▶ condition ──▶ rule_index ──▶ coverage ──┐
//!                                     ├──▶ backend ─────────────────────────────────┤
//!                                     └──▶ tls ─────────────────────────────────────┤
//!                                                                                   ▼
//!                                     reload ◀── store ◀── tables ◀──────── builder
//! ```
//!
//! Everything below `builder` is synchronous and owns no locks; `builder`
//! serializes access and drives dump and reload.

pub mod annotations;
pub mod backend;
pub mod builder;
pub mod condition;
pub mod coverage;
pub mod model;
pub mod reload;
pub mod rule_index;
pub mod store;
pub mod tables;
pub mod tls;

pub use builder::{AcceptedIndex, ConfigBuilder};
pub use model::{
    EndpointPort, EndpointSubset, EndpointsSnapshot, PathMode, PortRef, ResourceKey,
    RoutingResource, SecretSnapshot, ServicePortSpec, ServiceSnapshot,
};
pub use reload::{HttpReloader, ReloadSignal};
pub use store::ArtifactFamily;
