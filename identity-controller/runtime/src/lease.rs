use crate::{
    core::IDENTITY_CONTROLLER_NAME,
    k8s::{self, ObjectMeta},
};
use anyhow::Result;
use k8s_openapi::api::coordination::v1 as coordv1;
use kube::api::{Patch, PatchParams};
use kubert::lease::{Claim, ClaimParams, LeaseManager};
use std::{collections::BTreeMap, sync::Arc};
use tokio::{sync::watch, time};
use tracing::{debug, info};

const LEASE_DURATION: time::Duration = time::Duration::from_secs(30);
const LEASE_NAME: &str = "identity-controller-write";
const RENEW_GRACE_PERIOD: time::Duration = time::Duration::from_secs(1);

/// Ensures the write Lease exists and starts contending for it as `hostname`.
pub async fn init<T>(
    runtime: &kubert::Runtime<T>,
    ns: &str,
    hostname: &str,
) -> Result<watch::Receiver<Arc<Claim>>> {
    let api = k8s::Api::<coordv1::Lease>::namespaced(runtime.client(), ns);

    // Resource version "0" makes the apply a create-only operation, so an
    // existing Lease and its holder are left alone.
    let lease = coordv1::Lease {
        metadata: ObjectMeta {
            name: Some(LEASE_NAME.to_string()),
            namespace: Some(ns.to_string()),
            resource_version: Some("0".to_string()),
            labels: Some(BTreeMap::from([(
                "app.kubernetes.io/name".to_string(),
                IDENTITY_CONTROLLER_NAME.to_string(),
            )])),
            ..Default::default()
        },
        spec: None,
    };
    let params = PatchParams::apply(IDENTITY_CONTROLLER_NAME);
    match api.patch(LEASE_NAME, &params, &Patch::Apply(lease)).await {
        Ok(_) => info!(name = LEASE_NAME, %ns, "Created write Lease"),
        Err(k8s::Error::Api(_)) => debug!(name = LEASE_NAME, %ns, "Write Lease already exists"),
        Err(error) => return Err(error.into()),
    }

    let (claims, _task) = LeaseManager::init(api, LEASE_NAME)
        .await?
        .spawn(
            hostname,
            ClaimParams {
                lease_duration: LEASE_DURATION,
                renew_grace_period: RENEW_GRACE_PERIOD,
            },
        )
        .await?;
    Ok(claims)
}

/// Completes once `hostname` holds the lease.
pub async fn claimed(claims: &mut watch::Receiver<Arc<Claim>>, hostname: &str) -> Result<()> {
    loop {
        if claims.borrow_and_update().is_current_for(hostname) {
            return Ok(());
        }
        claims.changed().await?;
    }
}

/// Completes once `hostname` has held the lease and then lost it.
pub async fn lost(mut claims: watch::Receiver<Arc<Claim>>, hostname: &str) {
    if claimed(&mut claims, hostname).await.is_err() {
        return;
    }
    loop {
        if claims.changed().await.is_err() {
            return;
        }
        if !claims.borrow_and_update().is_current_for(hostname) {
            return;
        }
    }
}
