mod apply;
mod config;
mod owner_index;
mod reconcile;
#[cfg(test)]
mod test_utils;
mod types;

use anyhow::Result;
use futures_util::stream::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, ListParams};
use kube::runtime::controller::{Context, Controller};
use kube::runtime::reflector::{self, store::Writer};
use kube::runtime::watcher;
use kube::Client;
use tracing_subscriber::EnvFilter;

use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::from_env()?;
    tracing::info!(watch_namespace = ?config.watch_namespace, "configuration loaded");

    let client = Client::try_default().await?;

    let (report_api, deployment_api) = match config.watch_namespace.as_deref() {
        Some(namespace) => (
            Api::<types::Report>::namespaced(client.clone(), namespace),
            Api::<Deployment>::namespaced(client.clone(), namespace),
        ),
        None => (
            Api::<types::Report>::all(client.clone()),
            Api::<Deployment>::all(client.clone()),
        ),
    };

    // the owner index is projected from this cache on demand
    let writer = Writer::<Deployment>::default();
    let deployments = writer.as_reader();
    let deployment_cache = reflector::reflector(
        writer,
        watcher(deployment_api.clone(), ListParams::default()),
    )
    .for_each(|event| async move {
        if let Err(error) = event {
            tracing::warn!(%error, "deployment watch failed");
        }
    });

    let controller = Controller::new(report_api, ListParams::default())
        .watches(deployment_api, ListParams::default(), |deployment| {
            owner_index::report_for(&deployment)
        })
        .shutdown_on_signal()
        .run(
            reconcile::reconcile,
            reconcile::error_policy,
            Context::new(reconcile::Data {
                client,
                deployments,
                config,
            }),
        )
        .for_each(|res| async move {
            match res {
                Ok(o) => tracing::info!("reconciled {:?}", o),
                Err(e) => tracing::warn!("reconcile failed: {}", e),
            }
        });

    tokio::select! {
        _ = controller => {}
        _ = deployment_cache => {}
    }

    tracing::info!("controller terminated");

    Ok(())
}
