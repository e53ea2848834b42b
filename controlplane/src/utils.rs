use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;

// Merges freshly computed conditions with the ones currently set on an object.
//
// A condition keeps its last transition time if the object already carries a
// condition of the same type with the same status. The observed generation is
// always taken from the new condition.
pub fn merge_conditions(
    current: &[metav1::Condition],
    new_conds: Vec<metav1::Condition>,
) -> Vec<metav1::Condition> {
    new_conds
        .into_iter()
        .map(|mut new_cond| {
            if let Some(existing) = current.iter().find(|c| c.type_ == new_cond.type_) {
                if existing.status == new_cond.status {
                    new_cond.last_transition_time = existing.last_transition_time.clone();
                }
            }
            new_cond
        })
        .collect()
}
