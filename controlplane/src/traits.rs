use gateway_api::apis::standard::{gatewayclasses::GatewayClass, gateways::Gateway};
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;

/// Gives read access to the conditions currently written on an object.
pub trait HasConditions {
    fn get_conditions(&self) -> &[metav1::Condition];
}

impl HasConditions for Gateway {
    fn get_conditions(&self) -> &[metav1::Condition] {
        self.status
            .as_ref()
            .and_then(|s| s.conditions.as_deref())
            .unwrap_or_default()
    }
}

impl HasConditions for GatewayClass {
    fn get_conditions(&self) -> &[metav1::Condition] {
        self.status
            .as_ref()
            .and_then(|s| s.conditions.as_deref())
            .unwrap_or_default()
    }
}
