//! Reconcilers for the four custom resources

use std::{sync::Arc, time::Duration};

use kube::{runtime::controller::Action, Client, Resource};
use log::warn;
use uuid::Uuid;

use crate::{
  crd::ResourceVar,
  grants::Granter,
  hosts::HostSelector,
  iam::Sharder,
  postgres::Connector,
  reference::ReferenceError,
  Error, ErrorKind, Result,
};

pub mod database;
pub mod host_credentials;
pub mod service_user;
pub mod user;

/// Delay before retrying a resource that failed for a reason it can not fix itself
pub const RETRY_DELAY: Duration = Duration::from_secs(10);

/// Everything a reconcile needs apart from the Kubernetes client
pub struct Services {
  pub selector: HostSelector,
  pub connector: Arc<dyn Connector>,
  pub manager_role: String,
  pub admin_database: String,
  pub granter: Granter,
  pub sharder: Sharder,
  pub resync_period: Duration,
}

pub struct Context {
  pub client: Client,
  pub services: Services,
}

impl Context {
  pub fn new(client: Client, services: Services) -> Self {
    Context { client, services }
  }
}

/// Short id tying together the log lines of one reconcile
pub fn request_id() -> String {
  let mut id = Uuid::new_v4().simple().to_string();
  id.truncate(8);
  id
}

/// `(namespace, name)` of a namespaced resource
pub fn key<K: Resource>(obj: &K) -> Result<(String, String)> {
  let meta = obj.meta();
  match (&meta.namespace, &meta.name) {
    (Some(namespace), Some(name)) => Ok((namespace.clone(), name.clone())),
    _ => Err(Error::invalid("resource has no namespace or name")),
  }
}

/// Resolves an optional reference, an absent one counts as having no value
pub(crate) async fn resolve(
  services: &Services,
  namespace: &str,
  field: &str,
  reference: Option<&ResourceVar>,
) -> Result<String> {
  let reference = reference.ok_or_else(|| Error::reference(field, ReferenceError::NoValue))?;
  services
    .selector
    .resolver()
    .resolve(reference, namespace)
    .await
    .map_err(|e| Error::reference(field, e))
}

/// Invalid resources wait for a change, anything else is retried shortly
pub fn requeue_for(err: &Error) -> Action {
  match err.kind() {
    ErrorKind::Invalid => Action::await_change(),
    ErrorKind::Transient => Action::requeue(RETRY_DELAY),
    ErrorKind::Operational => {
      warn!("Retrying after operational failure: {}", err);
      Action::requeue(RETRY_DELAY)
    }
  }
}

pub fn error_policy<K>(_obj: Arc<K>, err: &Error, _ctx: Arc<Context>) -> Action {
  requeue_for(err)
}
