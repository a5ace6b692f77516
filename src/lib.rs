//! Elassandra-K8s: Kubernetes Operator for Elassandra and Cassandra
//!
//! This crate provides a Kubernetes operator reconciling Elassandra
//! datacenters: keyspace replication, roles, plugins and node tasks.

pub mod controller;
pub mod cql;
pub mod crd;
pub mod error;
pub mod http;
pub mod plugins;
pub mod telemetry;

#[cfg(feature = "rest-api")]
pub mod rest_api;

#[cfg(test)]
mod test_support;

pub use crate::error::{Error, Result};
