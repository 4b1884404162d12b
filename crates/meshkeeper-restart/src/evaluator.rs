//! Composite evaluation of restart predicates

use k8s_openapi::api::core::v1::Pod;
use tracing::debug;

use crate::predicates::Predicate;
use crate::workload::{has_sidecar_status, is_pod_ready, pod_name, pod_namespace};

/// OR of all predicates over `subject`
///
/// Every predicate is evaluated, even after the first match, so the debug log
/// shows the full picture.
pub fn any_matches<S: ?Sized, P: Predicate<S>>(predicates: &[P], subject: &S) -> bool {
    let mut matched = false;
    for predicate in predicates {
        let result = predicate.matches(subject);
        debug!(predicate = predicate.name(), matched = result, "restart predicate evaluated");
        matched |= result;
    }
    matched
}

/// Whether a pod must be restarted under `predicates`
///
/// Gate predicates ([`Predicate::must_match`]) must all hold. The remaining
/// predicates are OR-ed; with none of them there is nothing to restart for.
pub fn requires_restart<P: Predicate<Pod>>(predicates: &[P], pod: &Pod) -> bool {
    let gates_hold = predicates
        .iter()
        .filter(|p| p.must_match())
        .all(|p| p.matches(pod));
    if !gates_hold {
        return false;
    }
    predicates
        .iter()
        .filter(|p| !p.must_match())
        .any(|p| p.matches(pod))
}

/// Ready pods with an injected sidecar that `predicates` select for restart
pub fn select_pods<'a, P: Predicate<Pod>>(pods: &'a [Pod], predicates: &[P]) -> Vec<&'a Pod> {
    let selected: Vec<_> = pods
        .iter()
        .filter(|pod| is_pod_ready(pod) && has_sidecar_status(pod))
        .filter(|pod| requires_restart(predicates, pod))
        .collect();
    for pod in &selected {
        debug!(
            namespace = pod_namespace(pod),
            pod = pod_name(pod),
            "pod selected for sidecar restart"
        );
    }
    selected
}
