use std::sync::Arc;

use anyhow::{bail, Context as _};
use clap::Parser;
use futures_util::StreamExt;
use kube::{
  api::Api,
  runtime::{controller, reflector::ObjectRef, watcher, Controller},
  Client, Resource,
};
use log::{error, info, warn};
use tokio::sync::watch;

use operator::{
  config::Config,
  grants::{Converger, Granter, KubeDatabaseInventory, Planner},
  hosts::{HostSelector, KubeHostCredentialsStore},
  iam::{AwsPolicyStore, Sharder},
  postgres::{Connector, PgConnector},
  reconcile::{self, error_policy, Context, Services},
  reference::KubeResolver,
  resync::Resync,
  Error, PostgreSQLDatabase, PostgreSQLHostCredentials, PostgreSQLServiceUser, PostgreSQLUser,
};

type ReconcileResult<K> = Result<(ObjectRef<K>, controller::Action), controller::Error<Error, watcher::Error>>;

async fn report<K>(kind: &str, res: ReconcileResult<K>)
where
  K: Resource,
{
  match res {
    Ok((obj, _)) => {
      info!("Reconciled {} {}", kind, obj);
    }
    Err(controller::Error::ObjectNotFound(obj)) => {
      info!("Object not found: {}", obj);
    }
    Err(controller::Error::ReconcilerFailed(e, obj)) => {
      warn!("Reconcile of {} {} failed: {}", kind, obj, e);
    }
    Err(e) => {
      error!("{} controller error: {}", kind, e);
    }
  }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  env_logger::init();
  let config = Config::parse();

  // try load from env var which Terraform uses
  let client = match Client::try_default().await {
    Ok(c) => c,
    _ => {
      use kube::config::KubeConfigOptions;
      use std::convert::TryFrom;

      match std::env::var("KUBE_CTX") {
        Ok(ctx) => Client::try_from(
          kube::Config::from_kubeconfig(&KubeConfigOptions {
            context: Some(ctx),
            ..KubeConfigOptions::default()
          })
          .await?,
        )
        .context("Failed to load KUBE_CTX context")?,

        _ => bail!("Failed to create client"),
      }
    }
  };

  let selector = HostSelector::new(
    config.host_credentials(),
    Arc::new(KubeHostCredentialsStore::new(client.clone())),
    Arc::new(KubeResolver::new(client.clone())),
  );
  info!("Loaded admin credentials for {} hosts", selector.credentials().len());

  let connector: Arc<dyn Connector> = Arc::new(PgConnector);
  let grants = config.grant_config();
  let planner = Planner::new(
    selector.clone(),
    Arc::new(KubeDatabaseInventory::new(client.clone())),
    config.feature_flags(),
  );
  let converger = Converger::new(
    connector.clone(),
    selector.clone(),
    grants.static_roles,
    config.admin_database.clone(),
  );
  let store = AwsPolicyStore::from_env(&config.aws_region, &config.aws_credentials()).await;

  let ctx = Arc::new(Context::new(
    client.clone(),
    Services {
      selector,
      connector,
      manager_role: config.manager_role_name.clone(),
      admin_database: config.admin_database.clone(),
      granter: Granter::new(planner, converger, grants.role_prefix),
      sharder: Sharder::new(Arc::new(store), config.sharder_config()),
      resync_period: config.resync_period(),
    },
  ));

  let (resync, sync_requests) = Resync::channel();
  let (stop_tx, stop_rx) = watch::channel(false);
  let ticker = tokio::spawn(resync.run(config.sync_interval(), stop_rx));

  let databases = Controller::new(Api::<PostgreSQLDatabase>::all(client.clone()), watcher::Config::default())
    .shutdown_on_signal()
    .run(reconcile::database::reconcile, error_policy, ctx.clone())
    .for_each(|res| report("database", res));

  // role convergence is not safe across users on a shared database
  let users = Controller::new(Api::<PostgreSQLUser>::all(client.clone()), watcher::Config::default())
    .with_config(controller::Config::default().concurrency(1))
    .reconcile_all_on(sync_requests)
    .shutdown_on_signal()
    .run(reconcile::user::reconcile, error_policy, ctx.clone())
    .for_each(|res| report("user", res));

  let service_users = Controller::new(Api::<PostgreSQLServiceUser>::all(client.clone()), watcher::Config::default())
    .shutdown_on_signal()
    .run(reconcile::service_user::reconcile, error_policy, ctx.clone())
    .for_each(|res| report("service user", res));

  let host_credentials = Controller::new(
    Api::<PostgreSQLHostCredentials>::all(client.clone()),
    watcher::Config::default(),
  )
  .shutdown_on_signal()
  .run(reconcile::host_credentials::reconcile, error_policy, ctx.clone())
  .for_each(|res| report("host credentials", res));

  info!("Starting controllers");
  tokio::join!(databases, users, service_users, host_credentials);

  stop_tx.send(true).ok();
  ticker.await.context("Resync ticker panicked")?;
  info!("Controllers stopped");
  Ok(())
}
