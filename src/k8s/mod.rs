//! Kubernetes-facing side of the reconciler: watching ingresses and
//! services, and projecting them into the canonical entry list.

mod projection;
mod watcher;

pub use projection::{annotations, project, EntryDefaults};
pub use watcher::{watch_cluster, ClusterStores};
