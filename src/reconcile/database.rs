use std::sync::Arc;

use chrono::Utc;
use kube::{
  api::{Api, Patch, PatchParams},
  runtime::controller::Action,
};
use log::{info, warn};
use serde_json::json;

use super::{key, request_id, requeue_for, resolve, Context, Services};
use crate::{
  crd::{DatabasePhase, PostgreSQLDatabase, PostgreSQLDatabaseSpec, PostgreSQLDatabaseStatus},
  postgres::{Credentials, Ensurer},
  Error, ErrorKind, Result,
};

/// Host and owning user of a converged database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Converged {
  pub host: String,
  pub user: String,
}

/// Materializes the database on its host
pub async fn converge(services: &Services, namespace: &str, spec: &PostgreSQLDatabaseSpec) -> Result<Converged> {
  if spec.name.is_empty() {
    return Err(Error::invalid("name is required"));
  }
  let (host, admin) = services
    .selector
    .select(namespace, spec.host.as_ref(), spec.host_credentials.as_deref())
    .await?;
  let user = match spec.user.as_ref().filter(|u| !u.is_empty()) {
    Some(user) => resolve(services, namespace, "user", Some(user)).await?,
    None => spec.name.clone(),
  };
  let password = resolve(services, namespace, "password", spec.password.as_ref()).await?;
  let extensions: Vec<String> = spec.extensions.iter().map(|e| e.name.clone()).collect();

  let target = Credentials {
    name: spec.name.clone(),
    user: user.clone(),
    password,
    params: admin.params.clone(),
    shared: spec.is_shared,
  };
  Ensurer::new(services.connector.as_ref(), &services.manager_role, &services.admin_database)
    .ensure(&host, &admin, &target, &extensions)
    .await?;
  Ok(Converged { host, user })
}

/// Status for the outcome of [`converge`]; host and user are kept from `previous` on failure
pub fn status_for(outcome: &Result<Converged>, previous: Option<&PostgreSQLDatabaseStatus>) -> PostgreSQLDatabaseStatus {
  let previous = previous.cloned().unwrap_or_default();
  match outcome {
    Ok(converged) => PostgreSQLDatabaseStatus {
      phase: Some(DatabasePhase::Running),
      phase_updated: previous.phase_updated,
      host: converged.host.clone(),
      user: converged.user.clone(),
      error: String::new(),
    },
    Err(err) => PostgreSQLDatabaseStatus {
      phase: Some(match err.kind() {
        ErrorKind::Invalid => DatabasePhase::Invalid,
        _ => DatabasePhase::Failed,
      }),
      phase_updated: previous.phase_updated,
      host: previous.host,
      user: previous.user,
      error: err.to_string(),
    },
  }
}

/// Whether anything but the timestamp differs
pub fn status_changed(previous: Option<&PostgreSQLDatabaseStatus>, next: &PostgreSQLDatabaseStatus) -> bool {
  match previous {
    None => true,
    Some(previous) => {
      previous.phase != next.phase || previous.host != next.host || previous.user != next.user || previous.error != next.error
    }
  }
}

pub fn action_for(outcome: &Result<Converged>, services: &Services) -> Action {
  match outcome {
    Ok(_) => Action::requeue(services.resync_period),
    Err(err) => requeue_for(err),
  }
}

pub async fn reconcile(db: Arc<PostgreSQLDatabase>, ctx: Arc<Context>) -> Result<Action> {
  let id = request_id();
  let (namespace, name) = key(db.as_ref())?;
  info!("[{}] Reconciling database {}/{}", id, namespace, name);

  let outcome = converge(&ctx.services, &namespace, &db.spec).await;
  match &outcome {
    Ok(converged) => info!(
      "[{}] Database {}/{} is running on {} for {}",
      id, namespace, name, converged.host, converged.user
    ),
    Err(err) if err.kind() == ErrorKind::Invalid => warn!("[{}] Database {}/{} is invalid: {}", id, namespace, name, err),
    Err(err) => warn!("[{}] Database {}/{} failed: {}", id, namespace, name, err),
  }

  let mut status = status_for(&outcome, db.status.as_ref());
  if status_changed(db.status.as_ref(), &status) {
    status.phase_updated = Some(Utc::now());
    let api = Api::<PostgreSQLDatabase>::namespaced(ctx.client.clone(), &namespace);
    api
      .patch_status(&name, &PatchParams::default(), &Patch::Merge(json!({ "status": status })))
      .await?;
    info!("[{}] Status of {}/{} is now {:?}", id, namespace, name, status.phase);
  }
  Ok(action_for(&outcome, &ctx.services))
}
