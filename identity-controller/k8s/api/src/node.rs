use crate::Node;
use identity_controller_core::{LEGACY_ZONE_LABEL, ZONE_LABEL};

/// The zone a node runs in.
pub fn zone(node: &Node) -> Option<String> {
    let labels = node.metadata.labels.as_ref()?;
    labels
        .get(ZONE_LABEL)
        .or_else(|| labels.get(LEGACY_ZONE_LABEL))
        .filter(|zone| !zone.is_empty())
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ObjectMeta;
    use maplit::btreemap;

    fn mk_node(labels: std::collections::BTreeMap<String, String>) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some("n1".to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn zone_labels() {
        let node = mk_node(btreemap! {
            ZONE_LABEL.to_string() => "us-central1-a".to_string(),
            LEGACY_ZONE_LABEL.to_string() => "us-central1-b".to_string(),
        });
        assert_eq!(zone(&node), Some("us-central1-a".to_string()));

        let legacy = mk_node(btreemap! {
            LEGACY_ZONE_LABEL.to_string() => "us-central1-b".to_string(),
        });
        assert_eq!(zone(&legacy), Some("us-central1-b".to_string()));

        assert_eq!(zone(&mk_node(Default::default())), None);
    }
}
