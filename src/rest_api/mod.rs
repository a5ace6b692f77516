//! REST API module for external integrations
//!
//! Provides a read-only HTTP API over the operator's datacenter cache,
//! plus health and Prometheus metrics endpoints.

mod dto;
mod handlers;
mod server;

pub use dto::{DataCenterDetailResponse, DataCenterListResponse, DataCenterSummary, ErrorResponse};
pub use server::{router, run_server};
