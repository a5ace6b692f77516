//! HTTP handlers for the REST API

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use tracing::{debug, instrument};

use crate::controller::ResourceCache;
use crate::crd::DataCenter;

use super::dto::{
    DataCenterDetailResponse, DataCenterListResponse, DataCenterSummary, ErrorResponse,
    HealthResponse,
};

/// Health check endpoint
#[instrument]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// List all cached DataCenters, sorted by namespace and name
#[instrument(skip(cache))]
pub async fn list_datacenters(
    State(cache): State<ResourceCache<DataCenter>>,
) -> Json<DataCenterListResponse> {
    Json(list_response(cache.values().iter()))
}

/// List the cached DataCenters of one namespace
#[instrument(skip(cache), fields(namespace = %namespace))]
pub async fn list_namespace_datacenters(
    State(cache): State<ResourceCache<DataCenter>>,
    Path(namespace): Path<String>,
) -> Json<DataCenterListResponse> {
    let datacenters = cache.values();
    Json(list_response(
        datacenters
            .iter()
            .filter(|dc| dc.namespace_or_default() == namespace),
    ))
}

/// Get a specific DataCenter
#[instrument(skip(cache), fields(name = %name, namespace = %namespace))]
pub async fn get_datacenter(
    State(cache): State<ResourceCache<DataCenter>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<DataCenterDetailResponse>, (StatusCode, Json<ErrorResponse>)> {
    match cache.get(&format!("{namespace}/{name}")) {
        Some(dc) => Ok(Json(DataCenterDetailResponse::from(&dc))),
        None => {
            debug!("DataCenter not in cache");
            Err((
                StatusCode::NOT_FOUND,
                Json(ErrorResponse::new(
                    "not_found",
                    &format!("DataCenter {}/{} not found", namespace, name),
                )),
            ))
        }
    }
}

fn list_response<'a>(datacenters: impl Iterator<Item = &'a DataCenter>) -> DataCenterListResponse {
    let mut items: Vec<DataCenterSummary> = datacenters.map(DataCenterSummary::from).collect();
    items.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
    let total = items.len();
    DataCenterListResponse { items, total }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::DataCenterPhase;
    use crate::test_support::datacenter;

    fn cache() -> ResourceCache<DataCenter> {
        let cache = ResourceCache::new();
        let mut running = datacenter("cl1", "dc2");
        running.status = Some(crate::crd::DataCenterStatus {
            phase: DataCenterPhase::Running,
            ready_replicas: 3,
            ..Default::default()
        });
        cache.put(running.object_key(), running);
        let other = datacenter("cl1", "dc1");
        cache.put(other.object_key(), other);
        cache
    }

    #[tokio::test]
    async fn test_list_datacenters_sorted() {
        let Json(response) = list_datacenters(State(cache())).await;
        assert_eq!(response.total, 2);
        assert_eq!(response.items[0].datacenter, "dc1");
        assert_eq!(response.items[1].phase, DataCenterPhase::Running);
        assert_eq!(response.items[1].ready_replicas, 3);
    }

    #[tokio::test]
    async fn test_list_other_namespace_is_empty() {
        let Json(response) =
            list_namespace_datacenters(State(cache()), Path("other".to_string())).await;
        assert_eq!(response.total, 0);
    }

    #[tokio::test]
    async fn test_get_datacenter() {
        let Json(detail) = get_datacenter(
            State(cache()),
            Path(("db".to_string(), "elassandra-cl1-dc2".to_string())),
        )
        .await
        .unwrap();
        assert_eq!(detail.summary.cluster, "cl1");
        assert_eq!(detail.status.phase, DataCenterPhase::Running);

        let missing = get_datacenter(
            State(cache()),
            Path(("db".to_string(), "nope".to_string())),
        )
        .await;
        assert_eq!(missing.unwrap_err().0, StatusCode::NOT_FOUND);
    }
}
