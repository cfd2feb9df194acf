//! Bundle and resource status conditions.
//!
//! Conditions follow the Kubernetes shape: a type, a tri-state status, a
//! machine-readable reason and a human message. Transition times are only
//! bumped when the status of a condition actually changes.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ReconcileError;
use crate::types::ResourceName;

pub const REASON_TERMINAL_ERROR: &str = "TerminalError";
pub const REASON_RETRIABLE_ERROR: &str = "RetriableError";
pub const REASON_DEPENDENCIES_NOT_READY: &str = "DependenciesNotReady";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::True => "True",
            Self::False => "False",
            Self::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConditionType {
    Blocked,
    InProgress,
    Ready,
    Error,
}

impl ConditionType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Blocked => "Blocked",
            Self::InProgress => "InProgress",
            Self::Ready => "Ready",
            Self::Error => "Error",
        }
    }
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    pub fn new(condition_type: ConditionType, status: ConditionStatus) -> Self {
        Self {
            condition_type,
            status,
            reason: String::new(),
            message: String::new(),
            last_transition_time: None,
        }
    }

    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>, message: impl Into<String>) -> Self {
        self.reason = reason.into();
        self.message = message.into();
        self
    }

    /// Same status, reason and message.
    pub fn equivalent(&self, other: &Self) -> bool {
        self.condition_type == other.condition_type
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }
}

/// Status of one resource of a bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    pub name: ResourceName,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl ResourceStatus {
    pub fn condition(&self, condition_type: ConditionType) -> Option<&Condition> {
        find_condition(&self.conditions, condition_type)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_statuses: Vec<ResourceStatus>,
    #[serde(default)]
    pub is_ready: bool,
}

impl BundleStatus {
    pub fn condition(&self, condition_type: ConditionType) -> Option<&Condition> {
        find_condition(&self.conditions, condition_type)
    }

    pub fn resource(&self, name: &str) -> Option<&ResourceStatus> {
        self.resource_statuses.iter().find(|r| r.name == name)
    }

    /// Equal ignoring transition timestamps.
    pub fn equivalent(&self, other: &Self) -> bool {
        self.observed_generation == other.observed_generation
            && self.is_ready == other.is_ready
            && conditions_equivalent(&self.conditions, &other.conditions)
            && self.resource_statuses.len() == other.resource_statuses.len()
            && self
                .resource_statuses
                .iter()
                .zip(&other.resource_statuses)
                .all(|(a, b)| a.name == b.name && conditions_equivalent(&a.conditions, &b.conditions))
    }

    /// Carry over transition times from `previous` for every condition whose
    /// status did not change; stamp `now` on the rest.
    pub fn stamp_transitions(&mut self, previous: &Self, now: DateTime<Utc>) {
        stamp(&mut self.conditions, &previous.conditions, now);
        for resource in &mut self.resource_statuses {
            let old = previous
                .resource(&resource.name)
                .map(|r| r.conditions.as_slice())
                .unwrap_or_default();
            stamp(&mut resource.conditions, old, now);
        }
    }
}

fn find_condition(conditions: &[Condition], condition_type: ConditionType) -> Option<&Condition> {
    conditions.iter().find(|c| c.condition_type == condition_type)
}

fn conditions_equivalent(a: &[Condition], b: &[Condition]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.equivalent(y))
}

fn stamp(conditions: &mut [Condition], previous: &[Condition], now: DateTime<Utc>) {
    for condition in conditions {
        condition.last_transition_time = match find_condition(previous, condition.condition_type) {
            Some(old) if old.status == condition.status => old.last_transition_time.or(Some(now)),
            _ => Some(now),
        };
    }
}

/// Final per-pass state of one resource.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceState {
    Ready,
    /// Applied but not ready yet.
    InProgress,
    /// Not attempted; these direct dependencies were not ready.
    Blocked(Vec<ResourceName>),
    Error(ReconcileError),
}

impl ResourceState {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    pub fn error(&self) -> Option<&ReconcileError> {
        match self {
            Self::Error(e) => Some(e),
            _ => None,
        }
    }
}

fn flag(value: bool) -> ConditionStatus {
    if value {
        ConditionStatus::True
    } else {
        ConditionStatus::False
    }
}

fn error_reason(retriable: bool) -> &'static str {
    if retriable {
        REASON_RETRIABLE_ERROR
    } else {
        REASON_TERMINAL_ERROR
    }
}

/// Conditions describing a resource in `state`.
///
/// A retriable error keeps the resource `InProgress` since another attempt
/// is already scheduled.
pub fn resource_conditions(state: &ResourceState) -> Vec<Condition> {
    use ConditionType::{Blocked, Error, InProgress, Ready};

    match state {
        ResourceState::Ready => vec![
            Condition::new(Blocked, ConditionStatus::False),
            Condition::new(InProgress, ConditionStatus::False),
            Condition::new(Ready, ConditionStatus::True),
            Condition::new(Error, ConditionStatus::False),
        ],
        ResourceState::InProgress => vec![
            Condition::new(Blocked, ConditionStatus::False),
            Condition::new(InProgress, ConditionStatus::True),
            Condition::new(Ready, ConditionStatus::False),
            Condition::new(Error, ConditionStatus::False),
        ],
        ResourceState::Blocked(dependencies) => {
            let names: Vec<String> = dependencies.iter().map(|d| format!("{d:?}")).collect();
            vec![
                Condition::new(Blocked, ConditionStatus::True).with_reason(
                    REASON_DEPENDENCIES_NOT_READY,
                    format!("Not ready: [{}]", names.join(" ")),
                ),
                Condition::new(InProgress, ConditionStatus::False),
                Condition::new(Ready, ConditionStatus::False),
                Condition::new(Error, ConditionStatus::False),
            ]
        }
        ResourceState::Error(err) => {
            let retriable = err.is_retriable();
            vec![
                Condition::new(Blocked, ConditionStatus::False),
                Condition::new(InProgress, flag(retriable)),
                Condition::new(Ready, ConditionStatus::False),
                Condition::new(Error, ConditionStatus::True)
                    .with_reason(error_reason(retriable), err.to_string()),
            ]
        }
    }
}

/// Aggregate state of a bundle after a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BundleState {
    Ready,
    InProgress,
    Error { message: String, retriable: bool },
}

/// Conditions describing a bundle in `state`.
pub fn bundle_conditions(state: &BundleState) -> Vec<Condition> {
    use ConditionType::{Error, InProgress, Ready};

    match state {
        BundleState::Ready => vec![
            Condition::new(InProgress, ConditionStatus::False),
            Condition::new(Ready, ConditionStatus::True),
            Condition::new(Error, ConditionStatus::False),
        ],
        BundleState::InProgress => vec![
            Condition::new(InProgress, ConditionStatus::True),
            Condition::new(Ready, ConditionStatus::False),
            Condition::new(Error, ConditionStatus::False),
        ],
        BundleState::Error { message, retriable } => vec![
            Condition::new(InProgress, flag(*retriable)),
            Condition::new(Ready, ConditionStatus::False),
            Condition::new(Error, ConditionStatus::True)
                .with_reason(error_reason(*retriable), message.clone()),
        ],
    }
}

/// A condition that changed status or reason between two statuses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// `None` for bundle-level conditions.
    pub resource: Option<ResourceName>,
    pub condition_type: ConditionType,
    pub status: ConditionStatus,
    pub reason: String,
}

/// Every condition of `new` whose (status, reason) differs from `old`.
pub fn transitions(old: &BundleStatus, new: &BundleStatus) -> Vec<Transition> {
    let changed = |previous: &[Condition], current: &[Condition], resource: Option<&ResourceName>| {
        current
            .iter()
            .filter(|c| {
                find_condition(previous, c.condition_type)
                    .map_or(true, |p| p.status != c.status || p.reason != c.reason)
            })
            .map(|c| Transition {
                resource: resource.cloned(),
                condition_type: c.condition_type,
                status: c.status,
                reason: c.reason.clone(),
            })
            .collect::<Vec<_>>()
    };

    let mut result = changed(&old.conditions, &new.conditions, None);
    for resource in &new.resource_statuses {
        let previous = old
            .resource(&resource.name)
            .map(|r| r.conditions.as_slice())
            .unwrap_or_default();
        result.extend(changed(previous, &resource.conditions, Some(&resource.name)));
    }
    result
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use chrono::TimeZone;

    fn status_with(state: &ResourceState, bundle: &BundleState) -> BundleStatus {
        BundleStatus {
            observed_generation: Some(1),
            conditions: bundle_conditions(bundle),
            resource_statuses: vec![ResourceStatus {
                name: "a".to_string(),
                conditions: resource_conditions(state),
            }],
            is_ready: matches!(bundle, BundleState::Ready),
        }
    }

    #[test]
    fn test_blocked_condition_lists_dependencies() {
        let conditions = resource_conditions(&ResourceState::Blocked(vec!["db".to_string()]));
        let blocked = find_condition(&conditions, ConditionType::Blocked).unwrap();
        assert_eq!(blocked.status, ConditionStatus::True);
        assert_eq!(blocked.reason, REASON_DEPENDENCIES_NOT_READY);
        assert_eq!(blocked.message, r#"Not ready: ["db"]"#);
    }

    #[test]
    fn test_retriable_error_keeps_in_progress() {
        let err = ReconcileError::StoreTransport {
            reason: "connection reset".to_string(),
        };
        let conditions = resource_conditions(&ResourceState::Error(err));
        let in_progress = find_condition(&conditions, ConditionType::InProgress).unwrap();
        let error = find_condition(&conditions, ConditionType::Error).unwrap();
        assert_eq!(in_progress.status, ConditionStatus::True);
        assert_eq!(error.reason, REASON_RETRIABLE_ERROR);
    }

    #[test]
    fn test_equivalent_ignores_timestamps() {
        let a = status_with(&ResourceState::Ready, &BundleState::Ready);
        let mut b = a.clone();
        b.stamp_transitions(&BundleStatus::default(), Utc::now());
        assert!(a.equivalent(&b));
        assert_ne!(a, b);
    }

    #[test]
    fn test_stamp_keeps_time_of_unchanged_conditions() {
        let then = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap();

        let mut previous = status_with(&ResourceState::InProgress, &BundleState::InProgress);
        previous.stamp_transitions(&BundleStatus::default(), then);

        let mut next = status_with(&ResourceState::Ready, &BundleState::Ready);
        next.stamp_transitions(&previous, now);

        let blocked = next.resource("a").unwrap().condition(ConditionType::Blocked).unwrap();
        let ready = next.resource("a").unwrap().condition(ConditionType::Ready).unwrap();
        assert_eq!(blocked.last_transition_time, Some(then));
        assert_eq!(ready.last_transition_time, Some(now));
    }

    #[test]
    fn test_transitions_report_only_changes() {
        let old = status_with(&ResourceState::InProgress, &BundleState::InProgress);
        let new = status_with(&ResourceState::Ready, &BundleState::Ready);

        let changes = transitions(&old, &new);
        assert!(changes.iter().any(|t| t.resource.is_none()
            && t.condition_type == ConditionType::Ready
            && t.status == ConditionStatus::True));
        assert!(changes
            .iter()
            .all(|t| t.condition_type != ConditionType::Blocked));
        assert!(transitions(&new, &new).is_empty());
    }
}
