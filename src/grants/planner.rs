use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use kube::{api::ListParams, Api, Client};
use log::{info, warn};

use super::{access_key, DatabaseSchema, FeatureFlags, HostAccess, Privilege, ReadWriteAccess};
use crate::{
  crd::{AccessSpec, PostgreSQLDatabase, PostgreSQLDatabaseSpec, ResourceVar, WriteAccessSpec},
  hosts::HostSelector,
  reference::ReferenceError,
  Error, Result,
};

/// Databases declared in a namespace
#[async_trait]
pub trait DatabaseInventory: Send + Sync {
  async fn list(&self, namespace: &str) -> Result<Vec<PostgreSQLDatabaseSpec>>;
}

pub struct KubeDatabaseInventory {
  client: Client,
}

impl KubeDatabaseInventory {
  pub fn new(client: Client) -> Self {
    KubeDatabaseInventory { client }
  }
}

#[async_trait]
impl DatabaseInventory for KubeDatabaseInventory {
  async fn list(&self, namespace: &str) -> Result<Vec<PostgreSQLDatabaseSpec>> {
    let api = Api::<PostgreSQLDatabase>::namespaced(self.client.clone(), namespace);
    let list = api.list(&ListParams::default()).await?;
    Ok(list.items.into_iter().map(|db| db.spec).collect())
  }
}

/// Accesses grouped by `host/database` along with the intents that failed to
/// plan. `access` is usable even when `errors` is not empty.
#[derive(Debug, Default)]
pub struct Plan {
  pub access: HostAccess,
  pub errors: Vec<Error>,
}

pub struct Planner {
  selector: HostSelector,
  inventory: Arc<dyn DatabaseInventory>,
  flags: FeatureFlags,
}

impl Planner {
  pub fn new(selector: HostSelector, inventory: Arc<dyn DatabaseInventory>, flags: FeatureFlags) -> Self {
    Planner {
      selector,
      inventory,
      flags,
    }
  }

  pub async fn plan(&self, namespace: &str, reads: &[AccessSpec], writes: &[WriteAccessSpec]) -> Plan {
    let intents = reads
      .iter()
      .map(|access| (access, Privilege::Read, false))
      .chain(writes.iter().map(|w| (&w.access, Privilege::Write, w.extended)));

    let mut plan = Plan::default();
    let mut inventory: Option<Vec<PostgreSQLDatabaseSpec>> = None;
    let now = Utc::now();

    for (access, privilege, extended) in intents {
      if !access.is_active(now) {
        info!("Skipping inactive {:?} access on {:?}", privilege, access.database.value);
        continue;
      }
      let extended = if extended && !self.flags.extended_write {
        info!("Extended write is disabled, granting plain write");
        false
      } else {
        extended
      };

      let host = match self.resolve(namespace, "host", &access.host).await {
        Ok(host) => host,
        Err(err) => {
          plan.errors.push(err);
          continue;
        }
      };

      if access.all_databases {
        if !self.flags.all_databases(privilege) {
          info!("All databases {:?} access is disabled, ignoring intent on {}", privilege, host);
          continue;
        }
        if inventory.is_none() {
          match self.inventory.list(namespace).await {
            Ok(list) => inventory = Some(list),
            Err(err) => {
              plan.errors.push(err);
              continue;
            }
          }
        }
        for database in inventory.iter().flatten() {
          let database_host = self
            .selector
            .resolve_host(namespace, database.host.as_ref(), database.host_credentials.as_deref())
            .await;
          match database_host {
            Ok(h) if h == host => {
              plan.push(&host, &database.name, &database.name, privilege, access, extended);
            }
            Ok(_) => {}
            Err(err) => warn!("Skipping database {} in {}: {}", database.name, namespace, err),
          }
        }
        continue;
      }

      let database = match self.resolve(namespace, "database", &access.database).await {
        Ok(database) => database,
        Err(err) => {
          plan.errors.push(err);
          continue;
        }
      };
      let schema = match self.selector.resolver().resolve(&access.schema, namespace).await {
        Ok(schema) => schema,
        Err(ReferenceError::NoValue) => database.clone(),
        Err(err) => {
          plan.errors.push(Error::reference("schema", err));
          continue;
        }
      };
      plan.push(&host, &database, &schema, privilege, access, extended);
    }
    plan
  }

  async fn resolve(&self, namespace: &str, field: &str, reference: &ResourceVar) -> Result<String> {
    self
      .selector
      .resolver()
      .resolve(reference, namespace)
      .await
      .map_err(|e| Error::reference(field, e))
  }
}

impl Plan {
  fn push(
    &mut self,
    host: &str,
    database: &str,
    schema: &str,
    privilege: Privilege,
    access: &AccessSpec,
    extended: bool,
  ) {
    self
      .access
      .entry(access_key(host, database))
      .or_default()
      .push(ReadWriteAccess {
        host: host.to_string(),
        database: DatabaseSchema {
          name: database.to_string(),
          schema: schema.to_string(),
          privilege,
        },
        access: access.clone(),
        extended,
      });
  }
}
