use std::sync::Arc;

use kube::runtime::controller::Action;
use log::{info, warn};

use super::{key, request_id, requeue_for, resolve, Context, Services};
use crate::{
  crd::{PostgreSQLServiceUser, PostgreSQLServiceUserSpec},
  postgres::{primitives, ConnectionTarget},
  Error, Result,
};

/// Creates the login role of a service, sets its password and grants its roles.
/// Returns the host the role lives on.
pub async fn ensure(services: &Services, namespace: &str, spec: &PostgreSQLServiceUserSpec) -> Result<String> {
  if spec.name.is_empty() {
    return Err(Error::invalid("name is required"));
  }
  let (host, admin) = services.selector.select(namespace, Some(&spec.host), None).await?;
  let password = resolve(services, namespace, "password", spec.password.as_ref()).await?;
  let roles: Vec<String> = spec.roles.iter().map(|r| r.role_name.clone()).collect();

  let mut session = services
    .connector
    .connect(&ConnectionTarget::admin(&host, &services.admin_database, &admin))
    .await?;
  primitives::create_role(session.as_mut(), &spec.name, true, &roles, Some(&password)).await?;
  primitives::alter_service_role(session.as_mut(), &spec.name, &password).await?;
  session.close().await?;
  Ok(host)
}

pub async fn reconcile(user: Arc<PostgreSQLServiceUser>, ctx: Arc<Context>) -> Result<Action> {
  let id = request_id();
  let (namespace, name) = key(user.as_ref())?;
  info!("[{}] Reconciling service user {}/{}", id, namespace, name);

  match ensure(&ctx.services, &namespace, &user.spec).await {
    Ok(host) => {
      info!("[{}] Service user {} is ready on {}", id, user.spec.name, host);
      Ok(Action::requeue(ctx.services.resync_period))
    }
    Err(err) => {
      warn!("[{}] Service user {}/{} failed: {}", id, namespace, name, err);
      Ok(requeue_for(&err))
    }
  }
}
