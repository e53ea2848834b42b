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

//! Match precedence for HTTPRoute matches.
//!
//! Gateway API gives precedence to the rule with the largest number of
//! (continuing on ties): characters in a matching non-wildcard hostname,
//! characters in a matching hostname, characters in a matching path, method
//! match, header matches and query param matches. Remaining ties go to the
//! oldest Route, then to the Route first in `{namespace}/{name}` order, then
//! to the first matching rule within that Route.
//!
//! Hostname and path are resolved by the data plane itself, so only the
//! remaining criteria are compared here.

use std::cmp::Ordering;

use crate::graph::{MatchRule, RouteMeta};

/// Sorts match rules from highest to lowest priority. The sort is stable so
/// that matches which compare equal keep the order they were authored in;
/// the first match to win is the first one in the list.
pub fn sort_match_rules(match_rules: &mut [MatchRule]) {
    match_rules.sort_by(|a, b| {
        if higher_priority(a, b) {
            Ordering::Less
        } else if higher_priority(b, a) {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    });
}

/// Returns true if `rule1` has a higher priority than `rule2`.
pub fn higher_priority(rule1: &MatchRule, rule2: &MatchRule) -> bool {
    let match1 = &rule1.matches;
    let match2 = &rule2.matches;

    // Presence of a method wins, whatever the method is.
    match (match1.method.is_some(), match2.method.is_some()) {
        (true, false) => return true,
        (false, true) => return false,
        _ => {}
    }

    let headers1 = match1.headers.as_ref().map_or(0, Vec::len);
    let headers2 = match2.headers.as_ref().map_or(0, Vec::len);
    if headers1 != headers2 {
        return headers1 > headers2;
    }

    let params1 = match1.query_params.as_ref().map_or(0, Vec::len);
    let params2 = match2.query_params.as_ref().map_or(0, Vec::len);
    if params1 != params2 {
        return params1 > params2;
    }

    less_object_meta(&rule1.source, &rule2.source)
}

/// Orders Routes by creation timestamp, then namespace, then name.
pub fn less_object_meta(meta1: &RouteMeta, meta2: &RouteMeta) -> bool {
    let ts1 = meta1.creation_timestamp.as_ref().map(|t| t.0);
    let ts2 = meta2.creation_timestamp.as_ref().map(|t| t.0);

    if ts1 == ts2 {
        return (&meta1.key.namespace, &meta1.key.name) < (&meta2.key.namespace, &meta2.key.name);
    }
    ts1 < ts2
}
