//! Storage expansion and claim cleanup.
//!
//! The platform refuses in-place changes to a workload's volume claim
//! templates. Growing the data volume therefore means orphan-deleting the
//! workload, resizing every claim individually and creating the workload
//! again. Shrinking is never attempted.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;
use tracing::{debug, info};

use crate::cluster::{ordinal_of, Cluster, ResourceKind};
use crate::config::PollSettings;
use crate::error::{Error, Result};
use crate::retry::poll;
use crate::store::{ClusterStores, Propagation};

/// Name of the data volume claim template.
pub const DATA_VOLUME: &str = "data";

const STORAGE: &str = "storage";
const RESIZE_PENDING: &str = "FileSystemResizePending";

// ============================================================================
// Quantities
// ============================================================================

/// Parse a resource quantity (`10Gi`, `500M`, `1.5e9`, `100m`) into base units.
pub fn parse_quantity(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    const BINARY: [(&str, i32); 6] = [("Ki", 1), ("Mi", 2), ("Gi", 3), ("Ti", 4), ("Pi", 5), ("Ei", 6)];
    for (suffix, power) in BINARY {
        if let Some(number) = raw.strip_suffix(suffix) {
            return parse_number(number).map(|n| n * 1024f64.powi(power));
        }
    }

    const DECIMAL: [(&str, i32); 7] = [("m", -1), ("k", 1), ("M", 2), ("G", 3), ("T", 4), ("P", 5), ("E", 6)];
    for (suffix, power) in DECIMAL {
        if let Some(number) = raw.strip_suffix(suffix) {
            // "1E" is an exa suffix, "1e3" is an exponent.
            if let Some(n) = parse_number(number) {
                return Some(n * 1000f64.powi(power));
            }
        }
    }

    parse_number(raw)
}

fn parse_number(raw: &str) -> Option<f64> {
    if raw.is_empty() || raw.starts_with('-') || !raw.starts_with(|c: char| c.is_ascii_digit() || c == '.' || c == '+') {
        return None;
    }
    raw.parse::<f64>().ok().filter(|n| n.is_finite())
}

/// Strict numeric comparison; false when either side does not parse.
pub fn is_strictly_larger(new: &str, old: &str) -> bool {
    match (parse_quantity(new), parse_quantity(old)) {
        (Some(new), Some(old)) => new > old,
        _ => false,
    }
}

fn same_quantity(a: &str, b: &str) -> bool {
    match (parse_quantity(a), parse_quantity(b)) {
        (Some(a), Some(b)) => a == b,
        _ => a == b,
    }
}

/// Storage request of the workload's data claim template.
pub fn requested_storage(sts: &StatefulSet) -> Option<String> {
    let templates = sts.spec.as_ref()?.volume_claim_templates.as_ref()?;
    let data = templates
        .iter()
        .find(|t| t.metadata.name.as_deref() == Some(DATA_VOLUME))?;
    claim_request(data)
}

fn claim_request(pvc: &PersistentVolumeClaim) -> Option<String> {
    pvc.spec
        .as_ref()?
        .resources
        .as_ref()?
        .requests
        .as_ref()?
        .get(STORAGE)
        .map(|q| q.0.clone())
}

fn claim_capacity(pvc: &PersistentVolumeClaim) -> Option<String> {
    pvc.status
        .as_ref()?
        .capacity
        .as_ref()?
        .get(STORAGE)
        .map(|q| q.0.clone())
}

/// A claim's resize has been accepted by the storage backend.
pub fn resize_settled(pvc: &PersistentVolumeClaim, requested: &str) -> bool {
    let pending = pvc
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map_or(false, |conds| conds.iter().any(|c| c.type_ == RESIZE_PENDING));
    if pending {
        return true;
    }
    claim_capacity(pvc).map_or(false, |capacity| same_quantity(&capacity, requested))
}

// ============================================================================
// Expansion
// ============================================================================

/// Grow every data claim of the cluster to the size requested by `desired`,
/// recreating the workload around the resize.
pub async fn expand(
    cluster: &Cluster,
    stores: &ClusterStores,
    desired: &StatefulSet,
    resize_wait: PollSettings,
) -> Result<()> {
    let key = cluster.key();
    let requested = requested_storage(desired).ok_or_else(|| {
        Error::Internal(format!("workload of {} has no {} claim template", key, DATA_VOLUME))
    })?;
    let sts_name = cluster.resource_name(ResourceKind::StatefulSet);

    info!(cluster = %key, size = %requested, "Deleting workload to expand storage");
    match stores.statefulsets.delete(&sts_name, Propagation::Orphan).await {
        Err(e) if !e.is_not_found() => return Err(e),
        _ => {}
    }

    let claims = stores.pvcs.list(&cluster.selector_labels()).await?;
    for claim in claims {
        let name = claim.name_any();
        if claim.metadata.deletion_timestamp.is_some() {
            debug!(cluster = %key, pvc = %name, "Skipping claim being deleted");
            continue;
        }

        let updated = resize_claim(cluster, claim, &requested);
        stores.pvcs.replace(&updated).await?;
        info!(cluster = %key, pvc = %name, size = %requested, "Requested claim resize");

        let what = format!("resize of pvc {}", name);
        let (pvcs, claim_name, size) = (&stores.pvcs, name.as_str(), requested.as_str());
        poll(&what, resize_wait, move || async move {
            Ok(match pvcs.get(claim_name).await? {
                Some(current) => resize_settled(&current, size),
                None => true,
            })
        })
        .await?;
    }

    let mut fresh = desired.clone();
    fresh.metadata.resource_version = None;
    fresh.metadata.uid = None;
    stores.statefulsets.create(&fresh).await?;
    info!(cluster = %key, "Recreated workload after storage expansion");
    Ok(())
}

fn resize_claim(cluster: &Cluster, mut claim: PersistentVolumeClaim, requested: &str) -> PersistentVolumeClaim {
    let spec = claim.spec.get_or_insert_with(Default::default);
    spec.resources
        .get_or_insert_with(Default::default)
        .requests
        .get_or_insert_with(BTreeMap::new)
        .insert(STORAGE.to_string(), Quantity(requested.to_string()));

    if let Some(owner) = cluster.owner_reference() {
        let owners = claim.metadata.owner_references.get_or_insert_with(Vec::new);
        if !owners.iter().any(|o| o.uid == owner.uid) {
            owners.push(owner);
        }
    }
    claim
}

// ============================================================================
// Scale-in cleanup
// ============================================================================

/// Delete data claims left behind by members beyond the desired count.
/// Returns how many claims were deleted.
pub async fn cleanup_excess_claims(cluster: &Cluster, stores: &ClusterStores) -> Result<usize> {
    let replicas = cluster.replicas();
    let mut deleted = 0;

    for claim in stores.pvcs.list(&cluster.selector_labels()).await? {
        if claim.metadata.deletion_timestamp.is_some() {
            continue;
        }
        let name = claim.name_any();
        let Some(ordinal) = ordinal_of(&name) else {
            continue;
        };
        if ordinal < replicas {
            continue;
        }

        match stores.pvcs.delete(&name, Propagation::Default).await {
            Ok(()) => {
                info!(cluster = %cluster.key(), pvc = %name, "Deleted claim of removed member");
                deleted += 1;
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
    }
    Ok(deleted)
}
