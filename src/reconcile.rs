use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Container, EnvVar, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::runtime::controller::{Context, ReconcilerAction};
use kube::runtime::reflector::Store;
use kube::ResourceExt;
use thiserror::Error;
use tracing::Instrument;

use crate::apply::{self, ObjectStore, Outcome};
use crate::config::Config;
use crate::owner_index::{OwnerIndex, OWNER_KEY};
use crate::types::Report;

pub const DEPLOYMENT_NAME: &str = "gazo-san-report";
const CONTAINER_IMAGE: &str = "aa332266/gazo-san-report:latest";
const CONTAINER_ARGS: &[&str] = &["local-server"];

pub struct Data {
    pub client: kube::Client,
    /// Reflector cache of Deployments, the source the owner index is projected from.
    pub deployments: Store<Deployment>,
    pub config: Config,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("MissingObjectKey: {0}")]
    MissingObjectKey(&'static str),
    #[error("Failed to get report {key}: {source}")]
    GetReportFailed {
        key: ReportKey,
        #[source]
        source: kube::Error,
    },
    #[error("Failed to apply {namespace}/{name}: {source}")]
    ApplyFailed {
        namespace: String,
        name: String,
        #[source]
        source: kube::Error,
    },
    #[error("Deployment {namespace}/{name} was modified concurrently")]
    Conflict { namespace: String, name: String },
    #[error(
        "Owner in namespace {owner_namespace:?} cannot control an object in namespace {namespace:?}"
    )]
    CrossNamespaceOwner {
        owner_namespace: String,
        namespace: String,
    },
    #[error("Object is already controlled by {kind} {name}")]
    AlreadyOwned { kind: String, name: String },
}

impl Error {
    /// Errors that will not clear up on retry until something outside the
    /// controller changes.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Error::MissingObjectKey(_)
                | Error::CrossNamespaceOwner { .. }
                | Error::AlreadyOwned { .. }
        )
    }
}

/// Namespace and name of a Report to reconcile.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ReportKey {
    pub namespace: String,
    pub name: String,
}

impl ReportKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    fn for_report(report: &Report) -> Result<Self, Error> {
        let namespace = report
            .namespace()
            .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
        let name = report
            .metadata
            .name
            .clone()
            .ok_or(Error::MissingObjectKey(".metadata.name"))?;
        Ok(Self::new(namespace, name))
    }
}

impl fmt::Display for ReportKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Converges the Deployment of one Report. Holds no state between calls.
pub struct Reconciler<'a, S: ?Sized> {
    store: &'a S,
    cache: Option<&'a Store<Deployment>>,
}

impl<'a, S> Reconciler<'a, S>
where
    S: ObjectStore<Report> + ObjectStore<Deployment> + ?Sized,
{
    pub fn new(store: &'a S) -> Self {
        Self { store, cache: None }
    }

    pub fn with_cache(mut self, cache: &'a Store<Deployment>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub async fn reconcile(&self, key: &ReportKey) -> Result<ReconcilerAction, Error> {
        let report: Report = match ObjectStore::<Report>::get(self.store, &key.namespace, &key.name)
            .await
            .map_err(|source| Error::GetReportFailed {
                key: key.clone(),
                source,
            })? {
            Some(report) => report,
            None => {
                // children are left to the garbage collector via their owner reference
                let cache = self.cache.filter(|_| tracing::enabled!(tracing::Level::DEBUG));
                if let Some(cache) = cache {
                    let index = OwnerIndex::from_store(cache);
                    let orphans = index.owned_by(&key.namespace, &key.name);
                    tracing::debug!(
                        index = OWNER_KEY,
                        indexed = index.len(),
                        orphans = orphans.len(),
                        "report is gone, nothing to do"
                    );
                } else {
                    tracing::debug!("report is gone, nothing to do");
                }
                return Ok(ReconcilerAction {
                    requeue_after: None,
                });
            }
        };

        let desired = desired_deployment(&report);

        let outcome = apply::create_or_update(
            self.store,
            &key.namespace,
            DEPLOYMENT_NAME,
            |deployment: &mut Deployment| {
                fill_unset(deployment, &desired);
                apply::set_controller_reference(&report, deployment)
            },
        )
        .await?;

        match outcome {
            Outcome::Conflict => {
                return Err(Error::Conflict {
                    namespace: key.namespace.clone(),
                    name: DEPLOYMENT_NAME.to_string(),
                })
            }
            Outcome::Unchanged => {
                tracing::debug!(deployment = DEPLOYMENT_NAME, "deployment up to date")
            }
            outcome => {
                tracing::info!(deployment = DEPLOYMENT_NAME, ?outcome, "applied deployment")
            }
        }

        Ok(ReconcilerAction {
            requeue_after: None,
        })
    }
}

pub async fn reconcile(report: Arc<Report>, ctx: Context<Data>) -> Result<ReconcilerAction, Error> {
    let data = ctx.get_ref();
    let key = ReportKey::for_report(&report)?;
    let span = tracing::info_span!("reconcile", report = %key);

    let result = Reconciler::new(&data.client)
        .with_cache(&data.deployments)
        .reconcile(&key)
        .instrument(span)
        .await;
    if let Err(error) = &result {
        tracing::error!(
            report = %key,
            %error,
            permanent = error.is_permanent(),
            "reconcile failed"
        );
    }
    result
}

pub fn error_policy(error: &Error, ctx: Context<Data>) -> ReconcilerAction {
    let config = &ctx.get_ref().config;
    let requeue_after = if error.is_permanent() {
        config.permanent_requeue
    } else {
        config.error_requeue
    };
    tracing::debug!(?requeue_after, %error, "requeueing after error");
    ReconcilerAction {
        requeue_after: Some(requeue_after),
    }
}

pub fn labels_for(report_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), DEPLOYMENT_NAME.to_string()),
        ("controller".to_string(), report_name.to_string()),
    ])
}

/// The Deployment a Report asks for, before it is merged into the live object.
fn desired_deployment(report: &Report) -> Deployment {
    let name = report.metadata.name.clone().unwrap_or_default();
    let labels = labels_for(&name);

    Deployment {
        metadata: ObjectMeta {
            name: Some(DEPLOYMENT_NAME.to_string()),
            namespace: report.namespace(),
            ..ObjectMeta::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..LabelSelector::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: DEPLOYMENT_NAME.to_string(),
                        image: Some(CONTAINER_IMAGE.to_string()),
                        args: Some(CONTAINER_ARGS.iter().map(|arg| arg.to_string()).collect()),
                        env: Some(vec![
                            EnvVar {
                                name: "BaseURL".to_string(),
                                value: Some(report.spec.base_url.clone()),
                                ..EnvVar::default()
                            },
                            EnvVar {
                                name: "CompareURL".to_string(),
                                value: Some(report.spec.compare_url.clone()),
                                ..EnvVar::default()
                            },
                        ]),
                        ..Container::default()
                    }],
                    ..PodSpec::default()
                }),
            },
            ..DeploymentSpec::default()
        }),
        status: None,
    }
}

/// Copies fields from `desired` into `deployment` only where `deployment` leaves
/// them unset. Values someone changed by hand, like replicas, stay as they are.
fn fill_unset(deployment: &mut Deployment, desired: &Deployment) {
    let desired = match desired.spec.as_ref() {
        Some(spec) => spec,
        None => return,
    };
    let spec = deployment.spec.get_or_insert_with(DeploymentSpec::default);

    if spec.replicas.is_none() {
        spec.replicas = desired.replicas;
    }

    if spec
        .selector
        .match_labels
        .as_ref()
        .map_or(true, |labels| labels.is_empty())
    {
        spec.selector.match_labels = desired.selector.match_labels.clone();
    }

    let template_meta = spec.template.metadata.get_or_insert_with(ObjectMeta::default);
    if template_meta.labels.is_none() {
        template_meta.labels = desired
            .template
            .metadata
            .as_ref()
            .and_then(|meta| meta.labels.clone());
    }

    let pod_spec = spec.template.spec.get_or_insert_with(PodSpec::default);
    if pod_spec.containers.is_empty() {
        pod_spec.containers = desired
            .template
            .spec
            .as_ref()
            .map(|pod| pod.containers.clone())
            .unwrap_or_default();
    }
}
