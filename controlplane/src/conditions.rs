/*
Copyright 2024 The Kubernetes Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! The closed vocabulary of status conditions the graph attaches to objects.
//!
//! Conditions are built without timestamps or generations; those are only
//! known when the status is written back, see [`Condition::to_k8s`].

use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum ConditionType {
    Accepted,
    Programmed,
    ResolvedRefs,
    Conflicted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum ConditionReason {
    Accepted,
    Programmed,
    ResolvedRefs,
    NoConflicts,
    InvalidParameters,
    GatewayClassConflict,
    GatewayConflict,
    BackendNotFound,
    InvalidKind,
    ProtocolConflict,
    HostnameConflict,
    UnsupportedValue,
    UnsupportedProtocol,
    InvalidRouteKinds,
    InvalidCertificateRef,
    NoMatchingParent,
    NotAllowedByListeners,
    NoMatchingListenerHostname,
    ListenersNotValid,
    Invalid,
    TargetPortFallback,
}

macro_rules! display_as_debug {
    ($($t:ty),*) => {
        $(
            impl fmt::Display for $t {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    fmt::Debug::fmt(self, f)
                }
            }
        )*
    };
}

display_as_debug!(ConditionType, ConditionStatus, ConditionReason);

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Condition {
    pub type_: ConditionType,
    pub status: ConditionStatus,
    pub reason: ConditionReason,
    pub message: String,
}

impl Condition {
    pub fn new(
        type_: ConditionType,
        status: ConditionStatus,
        reason: ConditionReason,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_,
            status,
            reason,
            message: message.into(),
        }
    }

    /// Returns true if the condition stops the object from routing traffic.
    pub fn is_blocking(&self) -> bool {
        match self.type_ {
            ConditionType::Conflicted => self.status == ConditionStatus::True,
            ConditionType::Accepted | ConditionType::Programmed => {
                self.status == ConditionStatus::False
            }
            // An unresolved reference only degrades the object.
            ConditionType::ResolvedRefs => false,
        }
    }

    pub fn to_k8s(&self, observed_generation: Option<i64>, now: &metav1::Time) -> metav1::Condition {
        metav1::Condition {
            type_: self.type_.to_string(),
            status: self.status.to_string(),
            reason: self.reason.to_string(),
            message: self.message.clone(),
            observed_generation,
            last_transition_time: now.clone(),
        }
    }
}

/// Removes conditions of a repeated type, keeping the last one added.
pub fn deduplicate(conditions: &[Condition]) -> Vec<Condition> {
    let mut result: Vec<Condition> = Vec::with_capacity(conditions.len());
    for cond in conditions {
        match result.iter().position(|c| c.type_ == cond.type_) {
            Some(idx) => result[idx] = cond.clone(),
            None => result.push(cond.clone()),
        }
    }
    result
}

// GatewayClass

pub fn gateway_class_accepted() -> Condition {
    Condition::new(
        ConditionType::Accepted,
        ConditionStatus::True,
        ConditionReason::Accepted,
        "GatewayClass is accepted",
    )
}

pub fn gateway_class_invalid_parameters(msg: impl Into<String>) -> Condition {
    Condition::new(
        ConditionType::Accepted,
        ConditionStatus::False,
        ConditionReason::InvalidParameters,
        msg,
    )
}

pub fn gateway_class_conflict() -> Condition {
    Condition::new(
        ConditionType::Accepted,
        ConditionStatus::False,
        ConditionReason::GatewayClassConflict,
        "The resource is ignored due to a conflicting GatewayClass",
    )
}

// Gateway

pub fn gateway_accepted() -> Vec<Condition> {
    vec![
        Condition::new(
            ConditionType::Accepted,
            ConditionStatus::True,
            ConditionReason::Accepted,
            "Gateway is accepted",
        ),
        Condition::new(
            ConditionType::Programmed,
            ConditionStatus::True,
            ConditionReason::Programmed,
            "Gateway is programmed",
        ),
    ]
}

pub fn gateway_conflict() -> Vec<Condition> {
    let msg = "The resource is ignored due to a conflicting Gateway resource";
    vec![
        Condition::new(
            ConditionType::Accepted,
            ConditionStatus::False,
            ConditionReason::GatewayConflict,
            msg,
        ),
        Condition::new(
            ConditionType::Programmed,
            ConditionStatus::False,
            ConditionReason::GatewayConflict,
            msg,
        ),
    ]
}

pub fn gateway_listeners_not_valid() -> Vec<Condition> {
    let msg = "Gateway has no valid listeners";
    vec![
        Condition::new(
            ConditionType::Accepted,
            ConditionStatus::False,
            ConditionReason::ListenersNotValid,
            msg,
        ),
        Condition::new(
            ConditionType::Programmed,
            ConditionStatus::False,
            ConditionReason::Invalid,
            msg,
        ),
    ]
}

pub fn gateway_invalid_class(msg: impl Into<String>) -> Vec<Condition> {
    let msg = msg.into();
    vec![
        Condition::new(
            ConditionType::Accepted,
            ConditionStatus::False,
            ConditionReason::Invalid,
            msg.clone(),
        ),
        Condition::new(
            ConditionType::Programmed,
            ConditionStatus::False,
            ConditionReason::Invalid,
            msg,
        ),
    ]
}

// Listener

pub fn listener_accepted() -> Vec<Condition> {
    vec![
        Condition::new(
            ConditionType::Accepted,
            ConditionStatus::True,
            ConditionReason::Accepted,
            "Listener is accepted",
        ),
        Condition::new(
            ConditionType::ResolvedRefs,
            ConditionStatus::True,
            ConditionReason::ResolvedRefs,
            "All references are resolved",
        ),
        Condition::new(
            ConditionType::Programmed,
            ConditionStatus::True,
            ConditionReason::Programmed,
            "Listener is programmed",
        ),
        Condition::new(
            ConditionType::Conflicted,
            ConditionStatus::False,
            ConditionReason::NoConflicts,
            "No conflicts",
        ),
    ]
}

fn listener_rejected(reason: ConditionReason, msg: String) -> Vec<Condition> {
    vec![
        Condition::new(ConditionType::Accepted, ConditionStatus::False, reason, msg.clone()),
        Condition::new(
            ConditionType::Programmed,
            ConditionStatus::False,
            ConditionReason::Invalid,
            msg,
        ),
    ]
}

pub fn listener_unsupported_protocol(msg: impl Into<String>) -> Vec<Condition> {
    listener_rejected(ConditionReason::UnsupportedProtocol, msg.into())
}

pub fn listener_unsupported_value(msg: impl Into<String>) -> Vec<Condition> {
    listener_rejected(ConditionReason::UnsupportedValue, msg.into())
}

pub fn listener_invalid_route_kinds(msg: impl Into<String>) -> Vec<Condition> {
    let msg = msg.into();
    let mut conds = listener_rejected(ConditionReason::InvalidRouteKinds, msg.clone());
    conds.push(Condition::new(
        ConditionType::ResolvedRefs,
        ConditionStatus::False,
        ConditionReason::InvalidRouteKinds,
        msg,
    ));
    conds
}

pub fn listener_invalid_certificate_ref(msg: impl Into<String>) -> Vec<Condition> {
    let msg = msg.into();
    let mut conds = listener_rejected(ConditionReason::Invalid, msg.clone());
    conds.push(Condition::new(
        ConditionType::ResolvedRefs,
        ConditionStatus::False,
        ConditionReason::InvalidCertificateRef,
        msg,
    ));
    conds
}

fn listener_conflicted(reason: ConditionReason, msg: &str) -> Vec<Condition> {
    vec![
        Condition::new(ConditionType::Accepted, ConditionStatus::False, reason, msg),
        Condition::new(ConditionType::Conflicted, ConditionStatus::True, reason, msg),
        Condition::new(
            ConditionType::Programmed,
            ConditionStatus::False,
            ConditionReason::Invalid,
            msg,
        ),
    ]
}

pub fn listener_protocol_conflict() -> Vec<Condition> {
    listener_conflicted(
        ConditionReason::ProtocolConflict,
        "Multiple listeners for the same port use different protocols",
    )
}

pub fn listener_hostname_conflict() -> Vec<Condition> {
    listener_conflicted(
        ConditionReason::HostnameConflict,
        "Multiple listeners for the same port use the same hostname",
    )
}

// HTTPRoute, reported per parent reference

pub fn route_accepted() -> Condition {
    Condition::new(
        ConditionType::Accepted,
        ConditionStatus::True,
        ConditionReason::Accepted,
        "The route is accepted",
    )
}

pub fn route_resolved_refs() -> Condition {
    Condition::new(
        ConditionType::ResolvedRefs,
        ConditionStatus::True,
        ConditionReason::ResolvedRefs,
        "All references are resolved",
    )
}

pub fn route_no_matching_parent(msg: impl Into<String>) -> Condition {
    Condition::new(
        ConditionType::Accepted,
        ConditionStatus::False,
        ConditionReason::NoMatchingParent,
        msg,
    )
}

pub fn route_not_allowed_by_listeners() -> Condition {
    Condition::new(
        ConditionType::Accepted,
        ConditionStatus::False,
        ConditionReason::NotAllowedByListeners,
        "Route is not allowed by any listener",
    )
}

pub fn route_no_matching_listener_hostname() -> Condition {
    Condition::new(
        ConditionType::Accepted,
        ConditionStatus::False,
        ConditionReason::NoMatchingListenerHostname,
        "Listener hostname does not match the Route hostnames",
    )
}

pub fn route_unsupported_value(msg: impl Into<String>) -> Condition {
    Condition::new(
        ConditionType::Accepted,
        ConditionStatus::False,
        ConditionReason::UnsupportedValue,
        msg,
    )
}

pub fn route_backend_not_found(msg: impl Into<String>) -> Condition {
    Condition::new(
        ConditionType::ResolvedRefs,
        ConditionStatus::False,
        ConditionReason::BackendNotFound,
        msg,
    )
}

pub fn route_invalid_kind(msg: impl Into<String>) -> Condition {
    Condition::new(
        ConditionType::ResolvedRefs,
        ConditionStatus::False,
        ConditionReason::InvalidKind,
        msg,
    )
}

pub fn route_backend_unsupported_value(msg: impl Into<String>) -> Condition {
    Condition::new(
        ConditionType::ResolvedRefs,
        ConditionStatus::False,
        ConditionReason::UnsupportedValue,
        msg,
    )
}

pub fn route_target_port_fallback(msg: impl Into<String>) -> Condition {
    Condition::new(
        ConditionType::ResolvedRefs,
        ConditionStatus::True,
        ConditionReason::TargetPortFallback,
        msg,
    )
}
