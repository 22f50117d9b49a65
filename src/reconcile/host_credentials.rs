use std::sync::Arc;

use kube::runtime::controller::Action;
use log::debug;

use super::{key, request_id, Context};
use crate::{crd::PostgreSQLHostCredentials, Result};

/// Host credentials only carry data for the other resources
pub async fn reconcile(creds: Arc<PostgreSQLHostCredentials>, _ctx: Arc<Context>) -> Result<Action> {
  let (namespace, name) = key(creds.as_ref())?;
  debug!("[{}] Host credentials {}/{} present", request_id(), namespace, name);
  Ok(Action::await_change())
}
