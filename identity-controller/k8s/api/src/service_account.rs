use crate::ServiceAccount;
use identity_controller_core::{GsaEmail, GSA_ANNOTATION};

/// Reads the GSA a ServiceAccount asks to impersonate. Blank values are
/// treated as absent.
pub fn gsa_annotation(sa: &ServiceAccount) -> Option<GsaEmail> {
    let value = sa.metadata.annotations.as_ref()?.get(GSA_ANNOTATION)?.trim();
    if value.is_empty() {
        return None;
    }
    Some(GsaEmail::new(value))
}
