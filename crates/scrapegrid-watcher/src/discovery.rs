//! One-time API discovery for optional CRDs.
//!
//! `Probe` and `ScrapeConfig` are not installed on every cluster. Their
//! informers are only created when discovery finds the resource; otherwise
//! an always-empty stand-in takes their place.

use std::collections::BTreeSet;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{APIGroupList, APIResourceList};
use tracing::info;

use scrapegrid_crd::{MONITORING_GROUP, ResourceKind};

use crate::error::{WatcherError, WatcherResult};

/// Optional monitor kinds whose CRD the API server serves.
///
/// A failing discovery call is fatal: serving a config with kinds silently
/// missing is worse than not starting.
pub async fn installed_optional_kinds(client: &kube::Client) -> WatcherResult<BTreeSet<ResourceKind>> {
    let groups = client
        .list_api_groups()
        .await
        .map_err(WatcherError::Discovery)?;

    let mut installed = BTreeSet::new();
    for kind in ResourceKind::MONITORS.into_iter().filter(|k| k.is_optional()) {
        let Some(group_version) = kind.group_version() else {
            continue;
        };
        if !serves_group_version(&groups, &group_version) {
            info!(%kind, %group_version, "CRD group version not served, watching nothing");
            continue;
        }
        let resources = client
            .list_api_group_resources(&group_version)
            .await
            .map_err(WatcherError::Discovery)?;
        if lists_resource(&resources, kind) {
            installed.insert(kind);
        } else {
            info!(%kind, "CRD not installed, watching nothing");
        }
    }
    Ok(installed)
}

fn serves_group_version(groups: &APIGroupList, group_version: &str) -> bool {
    groups
        .groups
        .iter()
        .filter(|g| g.name == MONITORING_GROUP)
        .flat_map(|g| g.versions.iter())
        .any(|v| v.group_version == group_version)
}

fn lists_resource(resources: &APIResourceList, kind: ResourceKind) -> bool {
    resources.resources.iter().any(|r| r.name == kind.plural())
}
