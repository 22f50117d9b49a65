use std::{sync::Arc, time::Duration};

use kube::{
  api::Api,
  runtime::{
    controller::Action,
    finalizer::{self, finalizer, Event},
  },
};
use log::info;

use super::{key, request_id, Context, Services};
use crate::{
  crd::{PostgreSQLUser, PostgreSQLUserSpec},
  grants::sanitize,
  Error, Result,
};

/// Finalizer holding PostgreSQLUser resources until their IAM statement is gone
pub const USER_FINALIZER: &str = "postgresql.lunar.tech/finalizer";

/// Converges role memberships and the IAM statement of one user. Both run
/// even when the other fails.
pub async fn sync(services: &Services, namespace: &str, spec: &PostgreSQLUserSpec) -> Result<()> {
  if spec.name.is_empty() {
    return Err(Error::invalid("name is required"));
  }
  let sanitized = sanitize(&spec.name);
  let grants = services
    .granter
    .sync_user(namespace, &sanitized, &spec.read, &spec.write)
    .await;
  let iam = services
    .sharder
    .ensure_user(&spec.name, &sanitized)
    .await
    .map_err(Error::from);

  let errors: Vec<Error> = grants.err().into_iter().chain(iam.err()).collect();
  Error::combine(errors).map_or(Ok(()), Err)
}

/// Drops the IAM statement of a deleted user. Role memberships stay in place.
pub async fn cleanup(services: &Services, spec: &PostgreSQLUserSpec) -> Result<()> {
  services.sharder.remove_user(&spec.name).await?;
  Ok(())
}

/// Runs one finalizer event. A finished cleanup is requeued right away so the
/// controller observes the deletion.
pub async fn handle(services: &Services, event: Event<PostgreSQLUser>) -> Result<Action> {
  let id = request_id();
  match event {
    Event::Apply(user) => {
      let (namespace, name) = key(user.as_ref())?;
      info!("[{}] Syncing user {}/{} ({})", id, namespace, name, user.spec.name);
      sync(services, &namespace, &user.spec).await?;
      info!("[{}] User {}/{} is in sync", id, namespace, name);
      Ok(Action::requeue(services.resync_period))
    }
    Event::Cleanup(user) => {
      let (namespace, name) = key(user.as_ref())?;
      info!("[{}] Cleaning up user {}/{} ({})", id, namespace, name, user.spec.name);
      cleanup(services, &user.spec).await?;
      Ok(Action::requeue(Duration::ZERO))
    }
  }
}

fn unwrap_finalizer(err: finalizer::Error<Error>) -> Error {
  match err {
    finalizer::Error::ApplyFailed(err) | finalizer::Error::CleanupFailed(err) => err,
    finalizer::Error::AddFinalizer(err) | finalizer::Error::RemoveFinalizer(err) => Error::Kube(err),
    finalizer::Error::UnnamedObject => Error::invalid("resource has no name"),
  }
}

pub async fn reconcile(user: Arc<PostgreSQLUser>, ctx: Arc<Context>) -> Result<Action> {
  let (namespace, _) = key(user.as_ref())?;
  let api = Api::<PostgreSQLUser>::namespaced(ctx.client.clone(), &namespace);
  finalizer(&api, USER_FINALIZER, user, |event| handle(&ctx.services, event))
    .await
    .map_err(unwrap_finalizer)
}
