use futures::StreamExt;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::runtime::reflector::{self, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::hash::Hash;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::Result;

/// Reflector-backed views of the cluster state the projection reads from.
#[derive(Clone)]
pub struct ClusterStores {
    pub ingresses: Store<Ingress>,
    pub services: Store<Service>,
}

/// Start watching ingresses and services.
///
/// Returns the stores plus a coalesced notification channel: the channel has
/// capacity one and senders use try_send, so any number of watch events that
/// arrive while an update is in flight collapse into a single wake-up. The
/// consumer re-reads the stores, which always hold the latest state.
pub async fn watch_cluster(client: Client) -> Result<(ClusterStores, mpsc::Receiver<()>)> {
    let (tx, rx) = mpsc::channel(1);

    let (ingresses, ingress_writer) = reflector::store();
    let (services, service_writer) = reflector::store();

    spawn_reflector(
        Api::<Ingress>::all(client.clone()),
        ingress_writer,
        tx.clone(),
    );
    spawn_reflector(Api::<Service>::all(client), service_writer, tx);

    ingresses.wait_until_ready().await.map_err(|e| {
        crate::Error::Discovery(format!("ingress watch failed to initialise: {e}"))
    })?;
    services.wait_until_ready().await.map_err(|e| {
        crate::Error::Discovery(format!("service watch failed to initialise: {e}"))
    })?;

    Ok((ClusterStores { ingresses, services }, rx))
}

fn spawn_reflector<K>(api: Api<K>, writer: reflector::store::Writer<K>, tx: mpsc::Sender<()>)
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Clone + Eq + Hash,
{
    tokio::spawn(async move {
        let mut stream = reflector::reflector(writer, watcher(api, watcher::Config::default()))
            .touched_objects()
            .boxed();
        while let Some(event) = stream.next().await {
            match event {
                Ok(_) => {
                    // A full channel already holds a pending wake-up.
                    let _ = tx.try_send(());
                }
                Err(e) => {
                    warn!("watch stream error, will re-establish: {e}");
                }
            }
        }
        debug!("watch stream terminated");
    });
}
