//! Finalizer handling for DataCenter teardown
//!
//! The finalizer holds a deleted DataCenter until its datacenter has been
//! removed from the replication of every managed keyspace and its plugins
//! have been torn down.

use kube::ResourceExt;

use crate::crd::DataCenter;

/// Finalizer name used to protect DataCenter resources
pub const DATACENTER_FINALIZER: &str = "datacenter.elassandra.strapdata.com/finalizer";

/// A deletion timestamp means deletion was requested and our finalizer is pending
pub fn is_being_deleted(dc: &DataCenter) -> bool {
    dc.metadata.deletion_timestamp.is_some()
}

pub fn has_finalizer(dc: &DataCenter) -> bool {
    dc.finalizers().iter().any(|f| f == DATACENTER_FINALIZER)
}
