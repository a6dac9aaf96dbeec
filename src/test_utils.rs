//! In-memory stand-in for the API server used by the reconciler tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::core::ErrorResponse;
use kube::Resource;

use crate::apply::ObjectStore;
use crate::types::{Report, ReportSpec};

/// A Report as the API server would return it, with a uid of `uid-<name>`.
pub fn report(namespace: &str, name: &str, base_url: &str, compare_url: &str) -> Report {
    let mut report = Report::new(
        name,
        ReportSpec {
            base_url: base_url.to_string(),
            compare_url: compare_url.to_string(),
        },
    );
    report.metadata.namespace = Some(namespace.to_string());
    report.metadata.uid = Some(format!("uid-{}", name));
    report
}

fn api_error(code: u16, reason: &str, message: String) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    })
}

/// Objects of one kind keyed by namespace and name, with resourceVersion checks.
pub struct FakeStore<K> {
    objects: Mutex<BTreeMap<(String, String), K>>,
    writes: AtomicUsize,
    conflict_next_write: AtomicBool,
    fail_next_write: AtomicBool,
    unavailable: AtomicBool,
}

impl<K> Default for FakeStore<K> {
    fn default() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            writes: AtomicUsize::new(0),
            conflict_next_write: AtomicBool::new(false),
            fail_next_write: AtomicBool::new(false),
            unavailable: AtomicBool::new(false),
        }
    }
}

impl<K: Resource + Clone> FakeStore<K> {
    fn key(obj: &K) -> (String, String) {
        let meta = obj.meta();
        (
            meta.namespace.clone().unwrap_or_default(),
            meta.name.clone().unwrap_or_default(),
        )
    }

    /// Seeds an object without counting it as a write.
    pub fn insert(&self, mut obj: K) {
        obj.meta_mut().resource_version.get_or_insert_with(|| "1".to_string());
        self.objects.lock().unwrap().insert(Self::key(&obj), obj);
    }

    /// Swaps the stored object, as if it was deleted and created again.
    pub fn replace_stored(&self, obj: K) {
        self.objects.lock().unwrap().remove(&Self::key(&obj));
        self.insert(obj);
    }

    /// Changes a stored object the way another client would.
    pub fn modify(&self, namespace: &str, name: &str, f: impl FnOnce(&mut K)) {
        let mut objects = self.objects.lock().unwrap();
        let obj = objects
            .get_mut(&(namespace.to_string(), name.to_string()))
            .expect("object to modify should exist");
        f(obj);
        bump(obj);
    }

    pub fn stored(&self, namespace: &str, name: &str) -> Option<K> {
        self.objects
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Number of successful create and replace calls.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Fails the next create or replace with a 409.
    pub fn inject_conflict(&self) {
        self.conflict_next_write.store(true, Ordering::SeqCst);
    }

    /// Fails the next create or replace with a 503, leaving reads alone.
    pub fn inject_write_failure(&self) {
        self.fail_next_write.store(true, Ordering::SeqCst);
    }

    /// Fails every read with a 503.
    pub fn inject_unavailable(&self) {
        self.unavailable.store(true, Ordering::SeqCst);
    }

    fn check_write(&self, name: &str) -> Result<(), kube::Error> {
        if self.conflict_next_write.swap(false, Ordering::SeqCst) {
            return Err(api_error(409, "Conflict", format!("{} was modified", name)));
        }
        if self.fail_next_write.swap(false, Ordering::SeqCst) {
            return Err(api_error(503, "ServiceUnavailable", "server unavailable".to_string()));
        }
        Ok(())
    }

    fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, kube::Error> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(api_error(503, "ServiceUnavailable", "server unavailable".to_string()));
        }
        Ok(self.stored(namespace, name))
    }

    fn create(&self, namespace: &str, obj: &K) -> Result<K, kube::Error> {
        let name = obj.meta().name.clone().unwrap_or_default();
        self.check_write(&name)?;
        let mut objects = self.objects.lock().unwrap();
        let key = (namespace.to_string(), name.clone());
        if objects.contains_key(&key) {
            return Err(api_error(409, "AlreadyExists", format!("{} already exists", name)));
        }
        let mut created = obj.clone();
        created.meta_mut().namespace = Some(namespace.to_string());
        created.meta_mut().resource_version = Some("1".to_string());
        objects.insert(key, created.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(created)
    }

    fn replace(&self, namespace: &str, name: &str, obj: &K) -> Result<K, kube::Error> {
        self.check_write(name)?;
        let mut objects = self.objects.lock().unwrap();
        let current = objects
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| api_error(404, "NotFound", format!("{} not found", name)))?;
        if current.meta().resource_version != obj.meta().resource_version {
            return Err(api_error(409, "Conflict", format!("{} was modified", name)));
        }
        *current = obj.clone();
        bump(current);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(current.clone())
    }
}

fn bump<K: Resource>(obj: &mut K) {
    let next = obj
        .meta()
        .resource_version
        .as_deref()
        .and_then(|rv| rv.parse::<u64>().ok())
        .unwrap_or(0)
        + 1;
    obj.meta_mut().resource_version = Some(next.to_string());
}

#[derive(Default)]
pub struct FakeCluster {
    pub reports: FakeStore<Report>,
    pub deployments: FakeStore<Deployment>,
}

#[async_trait]
impl ObjectStore<Report> for FakeCluster {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Report>, kube::Error> {
        self.reports.get(namespace, name)
    }

    async fn create(&self, namespace: &str, obj: &Report) -> Result<Report, kube::Error> {
        self.reports.create(namespace, obj)
    }

    async fn replace(
        &self,
        namespace: &str,
        name: &str,
        obj: &Report,
    ) -> Result<Report, kube::Error> {
        self.reports.replace(namespace, name, obj)
    }
}

#[async_trait]
impl ObjectStore<Deployment> for FakeCluster {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Deployment>, kube::Error> {
        self.deployments.get(namespace, name)
    }

    async fn create(&self, namespace: &str, obj: &Deployment) -> Result<Deployment, kube::Error> {
        self.deployments.create(namespace, obj)
    }

    async fn replace(
        &self,
        namespace: &str,
        name: &str,
        obj: &Deployment,
    ) -> Result<Deployment, kube::Error> {
        self.deployments.replace(namespace, name, obj)
    }
}
