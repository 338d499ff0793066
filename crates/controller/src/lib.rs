//! Cairn controller: the reconcile driver. kube-runtime's `Controller` feeds
//! Cluster keys to the reconciler one at a time per Cluster, and each cycle's
//! result decides when the Cluster is looked at again.

#![forbid(unsafe_code)]

mod backoff;
mod reconciler;
mod runtime;
mod settings;

pub use backoff::Backoff;
pub use reconciler::{CycleReport, Platform, ReconcileAction, Reconciler};
pub use runtime::{owning_cluster, run};
pub use settings::Settings;
