//! Condition management helpers following Kubernetes API conventions

use chrono::Utc;

use crate::crd::{Condition, CqlStatus, DataCenterPhase, DataCenterStatus};

pub const CONDITION_TYPE_READY: &str = "Ready";
pub const CONDITION_TYPE_PROGRESSING: &str = "Progressing";
pub const CONDITION_TYPE_DEGRADED: &str = "Degraded";

pub const CONDITION_STATUS_TRUE: &str = "True";
pub const CONDITION_STATUS_FALSE: &str = "False";

/// Update or add a condition to the conditions list
///
/// The transition time only moves when the status flips.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: &str,
    reason: &str,
    message: &str,
    observed_generation: Option<i64>,
) {
    let now = Utc::now().to_rfc3339();

    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) {
        if existing.status != status {
            existing.last_transition_time = now;
        }
        existing.status = status.to_string();
        existing.reason = reason.to_string();
        existing.message = message.to_string();
        existing.observed_generation = observed_generation;
    } else {
        conditions.push(Condition {
            type_: type_.to_string(),
            status: status.to_string(),
            last_transition_time: now,
            reason: reason.to_string(),
            message: message.to_string(),
            observed_generation,
        });
    }
}

pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_)
        .map(|c| c.status == CONDITION_STATUS_TRUE)
        .unwrap_or(false)
}

fn flag(value: bool) -> &'static str {
    if value {
        CONDITION_STATUS_TRUE
    } else {
        CONDITION_STATUS_FALSE
    }
}

/// Derive Ready, Progressing and Degraded from the phase and CQL status
pub fn update_datacenter_conditions(status: &mut DataCenterStatus, generation: Option<i64>) {
    let phase = status.phase;
    let cql_ok = status.cql_status != CqlStatus::Errored;

    let ready = phase == DataCenterPhase::Running && cql_ok;
    let ready_message = format!(
        "{}/{} replicas ready, CQL {:?}",
        status.ready_replicas, status.replicas, status.cql_status
    );
    set_condition(
        &mut status.conditions,
        CONDITION_TYPE_READY,
        flag(ready),
        &phase.to_string(),
        &ready_message,
        generation,
    );

    let progressing = matches!(
        phase,
        DataCenterPhase::Creating
            | DataCenterPhase::Starting
            | DataCenterPhase::ScalingUp
            | DataCenterPhase::ScalingDown
            | DataCenterPhase::Updating
            | DataCenterPhase::RollingBack
            | DataCenterPhase::Parking
    );
    set_condition(
        &mut status.conditions,
        CONDITION_TYPE_PROGRESSING,
        flag(progressing),
        &phase.to_string(),
        "",
        generation,
    );

    let (degraded, reason, message) = if phase == DataCenterPhase::Error {
        (
            true,
            "ReconcileFailed",
            status.last_error.clone().unwrap_or_default(),
        )
    } else if !cql_ok {
        (
            true,
            "CqlUnavailable",
            status.cql_status_message.clone().unwrap_or_default(),
        )
    } else {
        (false, "NoIssues", String::new())
    };
    set_condition(
        &mut status.conditions,
        CONDITION_TYPE_DEGRADED,
        flag(degraded),
        reason,
        &message,
        generation,
    );
}
