//! ApplicationSet core types: sets, generated applications, destinations and errors.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

mod application;
mod appset;
mod destination;
mod error;

pub use application::{
    AppProject, AppProjectSpec, Application, ApplicationDestination, ApplicationSource,
    ApplicationSpec, GroupKind, ObjectKey,
};
pub use appset::{
    ApplicationSet, ApplicationSetSpec, ApplicationSetTemplate, ApplicationsSyncPolicy,
    ClusterGenerator, GeneratorKind, GeneratorSpec, GitDirectoryItem, GitFileItem, GitGenerator,
    LabelSelector, LabelSelectorRequirement, ListGenerator, MatrixGenerator, MergeGenerator,
    SelectorOperator, SetSyncPolicy, TemplateMeta,
};
pub use destination::{
    trim_server, ConnectionState, ConnectionStatus, Destination, DestinationConfig, TlsClientConfig,
};
pub use error::{
    DestinationError, GeneratorError, ReconcileError, RenderError, ResourceFailure, ResourceOp,
    StoreError,
};

/// One parameter row produced by a generator: placeholder name -> value.
pub type ParamRow = BTreeMap<String, String>;

pub const API_GROUP: &str = "argoproj.io";
pub const API_VERSION: &str = "v1alpha1";
pub const APPLICATION_KIND: &str = "Application";
pub const APPLICATION_SET_KIND: &str = "ApplicationSet";
pub const APP_PROJECT_KIND: &str = "AppProject";

/// Label selecting secrets that describe a destination cluster.
pub const CLUSTER_SECRET_TYPE_LABEL: &str = "argocd.argoproj.io/secret-type";
pub const CLUSTER_SECRET_TYPE_VALUE: &str = "cluster";
/// RFC3339 timestamp written on a cluster secret when a refresh is requested.
pub const REFRESH_ANNOTATION: &str = "argocd.argoproj.io/refresh";

/// Address of the API server as seen from inside the cluster.
pub const IN_CLUSTER_SERVER: &str = "https://kubernetes.default.svc";
pub const IN_CLUSTER_NAME: &str = "in-cluster";

/// Finalizer that makes the downstream controller clean up deployed resources.
pub const RESOURCES_FINALIZER: &str = "resources-finalizer.argocd.argoproj.io";
/// Bookkeeping annotation written by the notifications controller.
pub const NOTIFIED_ANNOTATION: &str = "notified.notifications.argoproj.io";

/// `group/version` string for all argoproj.io kinds handled here.
pub fn api_version() -> String {
    format!("{}/{}", API_GROUP, API_VERSION)
}

pub mod prelude {
    pub use super::{
        Application, ApplicationSet, ApplicationSetTemplate, Destination, GeneratorKind,
        GeneratorSpec, ObjectKey, ParamRow, ReconcileError, StoreError,
    };
}
