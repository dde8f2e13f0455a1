use crate::DEFAULT_NAMESPACE;
use std::fmt;

/// Identifies a Kubernetes ServiceAccount.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServiceAccount {
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid service account key: {0:?}")]
pub struct InvalidKey(pub String);

impl ServiceAccount {
    /// Builds a ServiceAccount, substituting the default namespace when the
    /// namespace is empty.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        let namespace = namespace.into();
        let namespace = if namespace.is_empty() {
            DEFAULT_NAMESPACE.to_string()
        } else {
            namespace
        };
        Self {
            namespace,
            name: name.into(),
        }
    }

    /// Parses a `namespace/name` key.
    pub fn from_key(key: &str) -> Result<Self, InvalidKey> {
        match key.split_once('/') {
            Some((ns, name)) if !name.is_empty() && !name.contains('/') => Ok(Self::new(ns, name)),
            _ => Err(InvalidKey(key.to_string())),
        }
    }

    /// Returns the stable `namespace/name` key.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ServiceAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_namespace_is_default() {
        let sa = ServiceAccount::new("", "ksa1");
        assert_eq!(sa.key(), "default/ksa1");
    }

    #[test]
    fn parses_keys() {
        assert_eq!(
            ServiceAccount::from_key("t/ksa1").unwrap(),
            ServiceAccount::new("t", "ksa1")
        );
        assert_eq!(
            ServiceAccount::from_key("/ksa1").unwrap(),
            ServiceAccount::new("default", "ksa1")
        );
        assert!(ServiceAccount::from_key("ksa1").is_err());
        assert!(ServiceAccount::from_key("t/").is_err());
        assert!(ServiceAccount::from_key("t/a/b").is_err());
    }
}
