//! Cluster provisioner - Kubernetes controller for downstream cluster lifecycle
//!
//! A `Cluster` object either describes node pools to provision or points at an
//! existing cluster to import. The controller turns the first kind into RKE
//! control plane and Cluster API objects, and registers the second kind by
//! deploying an agent manifest into it.
//!
//! # Modules
//!
//! - [`crd`] - Custom Resource Definitions (Cluster, RKECluster, management types)
//! - [`controller`] - Reconcilers for Cluster and RKECluster, plus the import handshake
//! - [`generator`] - Object graph generation for provisioned clusters
//! - [`schema`] - Field pruning against dynamic schemas
//! - [`apply`] - Declarative apply of labelled object sets
//! - [`index`] - Node config to cluster reverse index
//! - [`discovery`] - Rediscovery of installed node config kinds
//! - [`kubeconfig`] - Service users, tokens and kubeconfig secrets
//! - [`scheme`] - Rust type to group/version/kind registry
//! - [`config`] - Command line and environment configuration
//! - [`error`] - Error types for the provisioner

#![deny(missing_docs)]

pub mod apply;
pub mod config;
pub mod controller;
pub mod crd;
pub mod discovery;
pub mod error;
pub mod generator;
pub mod index;
pub mod kubeconfig;
pub mod manifest;
pub mod naming;
pub mod schema;
pub mod scheme;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
