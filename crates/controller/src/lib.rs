//! ApplicationSet controller: turns a set into its desired applications and
//! drives the merge engine, the finalizer safety valve and requeue scheduling.
//! `runtime` wires the pipeline into a kube-rs controller loop.

#![forbid(unsafe_code)]

pub mod assemble;
pub mod config;
pub mod finalizer;
mod reconcile;
pub mod runtime;
pub mod schedule;

pub use assemble::{assemble, check_unique_names};
pub use config::ControllerConfig;
pub use finalizer::{destination_reachable, release_unreachable};
pub use reconcile::{Outcome, Reconciler};
pub use runtime::{Context, RuntimeError};
pub use schedule::{backoff, min_requeue};
