//! Custom Resource Definitions for the Elassandra operator
//!
//! This module defines the DataCenter and Task CRDs.

mod datacenter;
mod task;
pub mod types;

pub use datacenter::{
    cluster_key, is_valid_cql_identifier, DataCenter, DataCenterSpec, DataCenterStatus,
    SpecValidationError,
};
pub use task::{
    BackupTaskSpec, CleanupTaskSpec, DecommissionTaskSpec, RebuildTaskSpec, RepairTaskSpec, Task,
    TaskSpec, TaskStatus, TestTaskSpec,
};
pub use types::*;
