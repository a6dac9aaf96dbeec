use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, PostParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::reconcile::Error;

/// Namespaced read/write access to typed objects.
///
/// Writes carry the object's `resourceVersion`, so a racing writer surfaces as a
/// 409 from [`ObjectStore::create`] or [`ObjectStore::replace`] instead of a merge.
#[async_trait]
pub trait ObjectStore<K>: Send + Sync
where
    K: Send + Sync + 'static,
{
    /// Returns `None` when the object does not exist.
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, kube::Error>;

    async fn create(&self, namespace: &str, obj: &K) -> Result<K, kube::Error>;

    async fn replace(&self, namespace: &str, name: &str, obj: &K) -> Result<K, kube::Error>;
}

#[async_trait]
impl<K> ObjectStore<K> for Client
where
    K: Resource<DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug
        + Send
        + Sync
        + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, kube::Error> {
        let api = Api::<K>::namespaced(self.clone(), namespace);
        match api.get(name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(kube::Error::Api(err)) if err.code == 404 => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn create(&self, namespace: &str, obj: &K) -> Result<K, kube::Error> {
        Api::<K>::namespaced(self.clone(), namespace)
            .create(&PostParams::default(), obj)
            .await
    }

    async fn replace(&self, namespace: &str, name: &str, obj: &K) -> Result<K, kube::Error> {
        Api::<K>::namespaced(self.clone(), namespace)
            .replace(name, &PostParams::default(), obj)
            .await
    }
}

/// What a [`create_or_update`] call did to the cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Created,
    Updated,
    /// The mutation left the live object as it was; nothing was written.
    Unchanged,
    /// The object changed (or appeared) between the read and the write.
    Conflict,
}

/// Fetches the object `namespace/name` (or starts from an empty one), applies
/// `mutate` and writes the result back under optimistic concurrency.
///
/// A failing `mutate` aborts before anything is written.
pub async fn create_or_update<K, S, F>(
    store: &S,
    namespace: &str,
    name: &str,
    mutate: F,
) -> Result<Outcome, Error>
where
    K: Resource + Default + Clone + PartialEq + Send + Sync + 'static,
    S: ObjectStore<K> + ?Sized,
    F: FnOnce(&mut K) -> Result<(), Error> + Send,
{
    let current = store
        .get(namespace, name)
        .await
        .map_err(|source| apply_failed(namespace, name, source))?;

    let result = match current {
        None => {
            let mut obj = K::default();
            obj.meta_mut().name = Some(name.to_string());
            obj.meta_mut().namespace = Some(namespace.to_string());
            mutate(&mut obj)?;
            store.create(namespace, &obj).await.map(|_| Outcome::Created)
        }
        Some(existing) => {
            let mut obj = existing.clone();
            mutate(&mut obj)?;
            if obj == existing {
                return Ok(Outcome::Unchanged);
            }
            store
                .replace(namespace, name, &obj)
                .await
                .map(|_| Outcome::Updated)
        }
    };

    match result {
        Ok(outcome) => Ok(outcome),
        Err(kube::Error::Api(err)) if err.code == 409 => Ok(Outcome::Conflict),
        Err(err) => Err(apply_failed(namespace, name, err)),
    }
}

fn apply_failed(namespace: &str, name: &str, source: kube::Error) -> Error {
    Error::ApplyFailed {
        namespace: namespace.to_string(),
        name: name.to_string(),
        source,
    }
}

/// Makes `owner` the controlling owner of `object`.
///
/// An existing reference to the same owner (matched by group, kind and name) is
/// replaced, so a recreated owner with a fresh uid takes over its children.
/// Other non-controller references are left alone.
pub fn set_controller_reference<O, K>(owner: &O, object: &mut K) -> Result<(), Error>
where
    O: Resource<DynamicType = ()>,
    K: Resource,
{
    let owner_meta = owner.meta();
    let name = owner_meta
        .name
        .clone()
        .ok_or(Error::MissingObjectKey(".metadata.name"))?;
    let uid = owner_meta
        .uid
        .clone()
        .ok_or(Error::MissingObjectKey(".metadata.uid"))?;

    // a namespaced owner can only control objects in its own namespace
    if let Some(owner_namespace) = owner_meta.namespace.as_ref() {
        if object.meta().namespace.as_ref() != Some(owner_namespace) {
            return Err(Error::CrossNamespaceOwner {
                owner_namespace: owner_namespace.clone(),
                namespace: object.meta().namespace.clone().unwrap_or_default(),
            });
        }
    }

    let reference = OwnerReference {
        api_version: O::api_version(&()).to_string(),
        kind: O::kind(&()).to_string(),
        name,
        uid,
        controller: Some(true),
        block_owner_deletion: Some(true),
    };

    let references = object
        .meta_mut()
        .owner_references
        .get_or_insert_with(Vec::new);

    if let Some(other) = references
        .iter()
        .find(|r| r.controller == Some(true) && !same_owner(r, &reference))
    {
        return Err(Error::AlreadyOwned {
            kind: other.kind.clone(),
            name: other.name.clone(),
        });
    }

    match references.iter_mut().find(|r| same_owner(r, &reference)) {
        Some(slot) => *slot = reference,
        None => references.push(reference),
    }

    Ok(())
}

fn same_owner(left: &OwnerReference, right: &OwnerReference) -> bool {
    api_group(&left.api_version) == api_group(&right.api_version)
        && left.kind == right.kind
        && left.name == right.name
}

/// The group half of an `apiVersion`; the core group is empty.
fn api_group(api_version: &str) -> &str {
    api_version
        .rsplit_once('/')
        .map(|(group, _)| group)
        .unwrap_or("")
}
