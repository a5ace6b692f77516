//! Datacenter phase derivation from rack StatefulSets

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::StatefulSet;
use kube::ResourceExt;

use crate::crd::{DataCenter, DataCenterPhase, RackStatus};

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "elassandra-operator";
pub const CLUSTER_LABEL: &str = "elassandra.strapdata.com/cluster";
pub const DATACENTER_LABEL: &str = "elassandra.strapdata.com/datacenter";
pub const RACK_LABEL: &str = "elassandra.strapdata.com/rack";

/// Replica counts observed on the rack StatefulSets of one datacenter
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Observation {
    pub racks: BTreeMap<String, RackStatus>,
}

impl Observation {
    pub fn from_statefulsets<'a>(
        dc: &DataCenter,
        statefulsets: impl IntoIterator<Item = &'a StatefulSet>,
    ) -> Self {
        let mut racks = BTreeMap::new();
        for sts in statefulsets {
            let labels = sts.labels();
            let belongs = labels.get(CLUSTER_LABEL) == Some(&dc.spec.cluster_name)
                && labels.get(DATACENTER_LABEL) == Some(&dc.spec.datacenter_name)
                && sts.namespace().as_deref() == Some(dc.namespace_or_default().as_str());
            if !belongs {
                continue;
            }
            let rack = labels
                .get(RACK_LABEL)
                .cloned()
                .unwrap_or_else(|| sts.name_any());
            let status = sts.status.as_ref();
            racks.insert(
                rack,
                RackStatus {
                    replicas: status.map(|s| s.replicas).unwrap_or(0),
                    ready_replicas: status.and_then(|s| s.ready_replicas).unwrap_or(0),
                },
            );
        }
        Self { racks }
    }

    pub fn replicas(&self) -> i32 {
        self.racks.values().map(|r| r.replicas).sum()
    }

    pub fn ready_replicas(&self) -> i32 {
        self.racks.values().map(|r| r.ready_replicas).sum()
    }
}

/// Next phase of a datacenter given what its StatefulSets report.
///
/// `Error` is never produced here, it is set when a reconciliation fails
/// and cleared by the next converged observation.
pub fn next_phase(
    current: DataCenterPhase,
    dc: &DataCenter,
    observed: &Observation,
    generation_changed: bool,
) -> DataCenterPhase {
    let desired = dc.spec.replicas;
    let replicas = observed.replicas();
    let ready = observed.ready_replicas();

    if dc.spec.parked {
        return if ready == 0 {
            DataCenterPhase::Parked
        } else {
            DataCenterPhase::Parking
        };
    }

    let converged = replicas == desired && ready >= desired;

    match current {
        DataCenterPhase::Creating if replicas == 0 && desired > 0 => DataCenterPhase::Creating,
        DataCenterPhase::Creating
        | DataCenterPhase::Starting
        | DataCenterPhase::Parking
        | DataCenterPhase::Parked => {
            if converged {
                DataCenterPhase::Running
            } else {
                DataCenterPhase::Starting
            }
        }
        _ if replicas < desired => DataCenterPhase::ScalingUp,
        _ if replicas > desired => DataCenterPhase::ScalingDown,
        _ if converged => DataCenterPhase::Running,
        DataCenterPhase::ScalingUp
        | DataCenterPhase::ScalingDown
        | DataCenterPhase::Updating
        | DataCenterPhase::RollingBack => current,
        _ if generation_changed => DataCenterPhase::Updating,
        _ => current,
    }
}
