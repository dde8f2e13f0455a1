use crate::{collapse::Collapse, VerifyError};
use ahash::AHashMap as HashMap;
use identity_controller_client::Authority;
use identity_controller_core::{GsaEmail, ServiceAccount, VerifyResult};
use identity_controller_k8s_index::SharedIndex;
use parking_lot::Mutex;
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, info, warn};

/// Holds the set of KSA -> GSA mappings the authority currently permits.
///
/// Every change to the verified set happens inside a verification collapsed
/// per ServiceAccount, so at most one `authorize` call is outstanding for a
/// given KSA and the read of the previous entry and the write of the new one
/// cannot interleave with another verification of the same KSA.
#[derive(Clone)]
pub struct Verifier {
    inner: Arc<Inner>,
}

struct Inner {
    index: SharedIndex,
    authority: Arc<dyn Authority>,
    verified: Mutex<HashMap<ServiceAccount, GsaEmail>>,
    inflight: Collapse<Result<VerifyResult, VerifyError>>,
}

impl Verifier {
    pub fn new(index: SharedIndex, authority: Arc<dyn Authority>) -> Self {
        Self {
            inner: Arc::new(Inner {
                index,
                authority,
                verified: Default::default(),
                inflight: Default::default(),
            }),
        }
    }

    /// Re-derives the mapping for `ksa` from its current annotation and the
    /// authority's decision, updating the verified set.
    pub async fn force_verify(&self, ksa: &ServiceAccount) -> Result<VerifyResult, VerifyError> {
        let verifier = self.clone();
        let sa = ksa.clone();
        self.inner
            .inflight
            .run(&ksa.key(), async move { verifier.verify(&sa).await })
            .await
            .unwrap_or_else(|| Err(VerifyError::Abandoned(ksa.clone())))
    }

    /// Returns the verified GSA for `ksa`, verifying it if it has not been
    /// verified yet. Returns an empty email if the KSA has no annotation or is
    /// denied.
    pub async fn verified_gsa(&self, ksa: &ServiceAccount) -> Result<GsaEmail, VerifyError> {
        if let Some(gsa) = self.cached(ksa) {
            return Ok(gsa);
        }
        let result = self.force_verify(ksa).await?;
        Ok(result.cur_gsa)
    }

    /// Returns every non-empty verified mapping for the ServiceAccounts in the
    /// index. KSAs that fail to verify are logged and left out.
    pub async fn all_verified(&self) -> BTreeMap<ServiceAccount, GsaEmail> {
        let service_accounts = self.inner.index.read().service_accounts();
        let mut verified = BTreeMap::new();
        for sa in service_accounts {
            match self.verified_gsa(&sa).await {
                Ok(gsa) if gsa.is_empty() => {}
                Ok(gsa) => {
                    verified.insert(sa, gsa);
                }
                Err(error) => warn!(%sa, %error, "Skipping unverifiable ServiceAccount"),
            }
        }
        verified
    }

    /// Returns the verified GSA for `ksa` without consulting the authority.
    pub fn cached(&self, ksa: &ServiceAccount) -> Option<GsaEmail> {
        self.inner.verified.lock().get(ksa).cloned()
    }

    async fn verify(&self, ksa: &ServiceAccount) -> Result<VerifyResult, VerifyError> {
        let pre_verified_gsa = self.cached(ksa).unwrap_or_default();

        let gsa = self.inner.index.read().gsa_annotation(ksa).cloned();
        let Some(gsa) = gsa else {
            debug!(%ksa, "No GSA annotation");
            self.inner.verified.lock().remove(ksa);
            return Ok(VerifyResult {
                pre_verified_gsa,
                ..Default::default()
            });
        };

        let permitted = self
            .inner
            .authority
            .authorize(ksa, &gsa)
            .await
            .map_err(|error| VerifyError::Authority {
                ksa: ksa.clone(),
                source: Arc::new(error),
            })?;

        if !permitted {
            info!(%ksa, %gsa, "Mapping denied");
            self.inner.verified.lock().remove(ksa);
            return Ok(VerifyResult {
                pre_verified_gsa,
                cur_gsa: GsaEmail::default(),
                denied: true,
            });
        }

        debug!(%ksa, %gsa, "Mapping permitted");
        self.inner.verified.lock().insert(ksa.clone(), gsa.clone());
        Ok(VerifyResult {
            pre_verified_gsa,
            cur_gsa: gsa,
            denied: false,
        })
    }

    #[cfg(test)]
    pub(crate) fn inflight(&self) -> usize {
        self.inner.inflight.inflight()
    }
}

impl std::fmt::Debug for Verifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Verifier")
            .field("verified", &self.inner.verified.lock().len())
            .finish_non_exhaustive()
    }
}
