use crate::{Pod, ResourceExt};
use identity_controller_core::{ServiceAccount, DEFAULT_NAMESPACE};

const DEFAULT_SERVICE_ACCOUNT: &str = "default";

/// The ServiceAccount a pod runs as.
pub fn service_account(pod: &Pod) -> ServiceAccount {
    let name = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.service_account_name.as_deref())
        .filter(|name| !name.is_empty())
        .unwrap_or(DEFAULT_SERVICE_ACCOUNT);
    let ns = pod.namespace().unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
    ServiceAccount::new(ns, name)
}

/// The node a pod is scheduled to, if any.
pub fn node_name(pod: &Pod) -> Option<String> {
    pod.spec
        .as_ref()?
        .node_name
        .clone()
        .filter(|name| !name.is_empty())
}

/// Indicates whether a pod uses its node's credential service.
///
/// Host-network pods bypass it and finished pods no longer need it.
pub fn runs_on_node(pod: &Pod) -> bool {
    let host_network = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.host_network)
        .unwrap_or(false);
    let finished = matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded" | "Failed")
    );
    !host_network && !finished
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ObjectMeta, PodSpec, PodStatus};

    fn mk_pod(sa: Option<&str>, node: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                namespace: Some("ns-0".to_string()),
                name: Some("pod-0".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                service_account_name: sa.map(Into::into),
                node_name: node.map(Into::into),
                ..Default::default()
            }),
            status: None,
        }
    }

    #[test]
    fn service_account_defaults() {
        assert_eq!(
            service_account(&mk_pod(None, None)),
            ServiceAccount::new("ns-0", "default")
        );
        assert_eq!(
            service_account(&mk_pod(Some("ksa1"), None)),
            ServiceAccount::new("ns-0", "ksa1")
        );
    }

    #[test]
    fn node_assignment() {
        assert_eq!(node_name(&mk_pod(None, None)), None);
        assert_eq!(node_name(&mk_pod(None, Some(""))), None);
        assert_eq!(
            node_name(&mk_pod(None, Some("n1"))),
            Some("n1".to_string())
        );
    }

    #[test]
    fn host_network_and_finished_pods_are_not_on_node() {
        let pod = mk_pod(None, Some("n1"));
        assert!(runs_on_node(&pod));

        let mut host = pod.clone();
        host.spec.as_mut().unwrap().host_network = Some(true);
        assert!(!runs_on_node(&host));

        let mut done = pod;
        done.status = Some(PodStatus {
            phase: Some("Succeeded".to_string()),
            ..Default::default()
        });
        assert!(!runs_on_node(&done));
    }
}
