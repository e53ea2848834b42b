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

use std::collections::BTreeMap;
use std::sync::Arc;

use gateway_api::apis::standard::gatewayclasses::GatewayClass as GatewayClassObject;

use crate::conditions::{self, Condition};
use crate::NamespacedName;

/// The GatewayClass this controller serves.
#[derive(Clone, Debug)]
pub struct GatewayClass {
    pub source: Arc<GatewayClassObject>,
    /// Problems found with the class. A valid class has none.
    pub conditions: Vec<Condition>,
    pub valid: bool,
}

/// The GatewayClasses that reference this controller.
#[derive(Clone, Debug, Default)]
pub struct ProcessedGatewayClasses {
    /// The class named on the command line, if it references this controller.
    pub winner: Option<Arc<GatewayClassObject>>,
    /// Every other class that references this controller.
    pub ignored: BTreeMap<NamespacedName, Arc<GatewayClassObject>>,
}

/// Splits the classes referencing `controller_name` into the winner and the
/// ignored ones. Also returns whether a class named `class_name` exists,
/// whichever controller it references.
pub fn process_gateway_classes(
    classes: &BTreeMap<NamespacedName, Arc<GatewayClassObject>>,
    class_name: &str,
    controller_name: &str,
) -> (ProcessedGatewayClasses, bool) {
    let mut processed = ProcessedGatewayClasses::default();
    let mut exists = false;

    for (key, class) in classes {
        let ours = class.spec.controller_name == controller_name;
        if key.name == class_name {
            exists = true;
            if ours {
                processed.winner = Some(class.clone());
            }
        } else if ours {
            processed.ignored.insert(key.clone(), class.clone());
        }
    }

    (processed, exists)
}

pub fn build_gateway_class(class: Option<&Arc<GatewayClassObject>>) -> Option<GatewayClass> {
    let class = class?;

    let mut conds = vec![];
    let valid = match validate_gateway_class(class) {
        Ok(()) => true,
        Err(msg) => {
            conds.push(conditions::gateway_class_invalid_parameters(msg));
            false
        }
    };

    Some(GatewayClass {
        source: class.clone(),
        conditions: conds,
        valid,
    })
}

fn validate_gateway_class(class: &GatewayClassObject) -> Result<(), String> {
    if class.spec.parameters_ref.is_some() {
        return Err("spec.parametersRef: Forbidden: parametersRef is not supported".to_string());
    }
    Ok(())
}
