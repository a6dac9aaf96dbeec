use std::borrow::Borrow;
use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::apps::v1::Deployment;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::Resource;

use crate::types::Report;

/// Field the index is keyed by: the name of the controlling Report.
pub const OWNER_KEY: &str = ".metadata.controller";

/// Name of the Report controlling `deployment`, if a Report controls it at all.
pub fn controller_owner(deployment: &Deployment) -> Option<String> {
    let owner = deployment
        .metadata
        .owner_references
        .as_ref()?
        .iter()
        .find(|owner| owner.controller == Some(true))?;

    if owner.api_version != Report::api_version(&()) || owner.kind != Report::kind(&()) {
        return None;
    }
    Some(owner.name.clone())
}

/// Maps a Deployment event back to the Report that should be reconciled for it.
pub fn report_for(deployment: &Deployment) -> Option<ObjectRef<Report>> {
    let owner = controller_owner(deployment)?;
    let namespace = deployment.metadata.namespace.as_deref()?;
    Some(ObjectRef::new(&owner).within(namespace))
}

/// Reverse lookup from a Report to the Deployments it controls.
///
/// This is a projection of owner references and is thrown away and rebuilt
/// rather than updated in place.
#[derive(Debug, Default)]
pub struct OwnerIndex {
    entries: BTreeMap<(String, String), BTreeSet<String>>,
}

impl OwnerIndex {
    pub fn from_deployments<I, D>(deployments: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Borrow<Deployment>,
    {
        let mut entries: BTreeMap<(String, String), BTreeSet<String>> = BTreeMap::new();
        for deployment in deployments {
            let deployment = deployment.borrow();
            let (owner, namespace, name) = match (
                controller_owner(deployment),
                deployment.metadata.namespace.clone(),
                deployment.metadata.name.clone(),
            ) {
                (Some(owner), Some(namespace), Some(name)) => (owner, namespace, name),
                _ => continue,
            };
            entries.entry((namespace, owner)).or_default().insert(name);
        }
        Self { entries }
    }

    pub fn from_store(store: &Store<Deployment>) -> Self {
        Self::from_deployments(store.state())
    }

    /// Names of the Deployments in `namespace` controlled by `report`, sorted.
    pub fn owned_by(&self, namespace: &str, report: &str) -> Vec<String> {
        self.entries
            .get(&(namespace.to_string(), report.to_string()))
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
