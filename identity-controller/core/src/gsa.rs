use serde::{Deserialize, Serialize};
use std::fmt;

/// A Google service account email. Empty means no authorized identity.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GsaEmail(String);

impl GsaEmail {
    pub fn new(email: impl Into<String>) -> Self {
        Self(email.into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GsaEmail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for GsaEmail {
    fn from(email: String) -> Self {
        Self(email)
    }
}

impl From<&str> for GsaEmail {
    fn from(email: &str) -> Self {
        Self(email.to_string())
    }
}

impl AsRef<str> for GsaEmail {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
