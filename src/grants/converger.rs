use std::{
  collections::{BTreeMap, BTreeSet},
  sync::Arc,
};

use log::info;

use super::{HostAccess, Privilege, ReadWriteAccess};
use crate::{
  hosts::HostSelector,
  postgres::{
    primitives::{self, TablePrivileges},
    AdminCredentials, ConnectionTarget, Connector, Session,
  },
  Error, Result,
};

const READ_SUFFIX: &str = "_read";
const READWRITE_SUFFIX: &str = "_readwrite";

/// Privileges a managed role carries on its database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedGrant {
  pub database: String,
  pub schemas: BTreeSet<String>,
  pub privileges: TablePrivileges,
}

/// Roles required on one host. Static roles carry no grant of their own.
pub type RequiredRoles = BTreeMap<String, Option<ManagedGrant>>;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct RoleDiff {
  pub add: Vec<String>,
  pub remove: Vec<String>,
}

pub fn read_role(database: &str) -> String {
  format!("{}{}", database, READ_SUFFIX)
}

pub fn readwrite_role(database: &str) -> String {
  format!("{}{}", database, READWRITE_SUFFIX)
}

/// Recognises names following the `<database>_read`/`<database>_readwrite` convention
pub fn is_managed_role(role: &str) -> bool {
  role.ends_with(READ_SUFFIX) || role.ends_with(READWRITE_SUFFIX)
}

/// Static roles plus one managed role per database; write wins over read
pub fn required_roles<'a>(
  static_roles: &[String],
  accesses: impl IntoIterator<Item = &'a ReadWriteAccess>,
) -> RequiredRoles {
  let mut per_database: BTreeMap<&str, (Privilege, bool, BTreeSet<String>)> = BTreeMap::new();
  for access in accesses {
    let entry = per_database
      .entry(access.database.name.as_str())
      .or_insert((Privilege::Read, false, BTreeSet::new()));
    entry.0 = entry.0.max(access.database.privilege);
    entry.1 |= access.database.privilege == Privilege::Write && access.extended;
    entry.2.insert(access.database.schema.clone());
  }

  let mut required: RequiredRoles = static_roles.iter().map(|r| (r.clone(), None)).collect();
  for (database, (privilege, extended, schemas)) in per_database {
    let (role, privileges) = match (privilege, extended) {
      (Privilege::Read, _) => (read_role(database), TablePrivileges::Read),
      (Privilege::Write, false) => (readwrite_role(database), TablePrivileges::Write),
      (Privilege::Write, true) => (readwrite_role(database), TablePrivileges::ExtendedWrite),
    };
    required.insert(
      role,
      Some(ManagedGrant {
        database: database.to_string(),
        schemas,
        privileges,
      }),
    );
  }
  required
}

/// Roles to grant and managed roles to revoke. Roles outside the naming
/// convention are never revoked.
pub fn diff_roles(existing: &[String], required: &RequiredRoles) -> RoleDiff {
  let add = required
    .keys()
    .filter(|role| !existing.contains(*role))
    .cloned()
    .collect();
  let mut remove: Vec<String> = existing
    .iter()
    .filter(|role| is_managed_role(role) && !required.contains_key(*role))
    .cloned()
    .collect();
  remove.sort();
  RoleDiff { add, remove }
}

/// Applies planned accesses as role memberships of a login role
pub struct Converger {
  connector: Arc<dyn Connector>,
  selector: HostSelector,
  static_roles: Vec<String>,
  admin_database: String,
}

impl Converger {
  pub fn new(
    connector: Arc<dyn Connector>,
    selector: HostSelector,
    static_roles: Vec<String>,
    admin_database: impl Into<String>,
  ) -> Self {
    Converger {
      connector,
      selector,
      static_roles,
      admin_database: admin_database.into(),
    }
  }

  /// Converges every host in `access` and every configured host, one after
  /// the other. Hosts without a planned access lose their managed roles.
  pub async fn converge(&self, login_role: &str, access: &HostAccess) -> Result<()> {
    let mut hosts: BTreeMap<&str, Vec<&ReadWriteAccess>> = self
      .selector
      .credentials()
      .keys()
      .map(|host| (host.as_str(), Vec::new()))
      .collect();
    for access in access.values().flatten() {
      hosts.entry(access.host.as_str()).or_default().push(access);
    }

    let mut errors = Vec::new();
    for (host, accesses) in hosts {
      if let Err(err) = self.converge_host(login_role, host, accesses).await {
        errors.push(err);
      }
    }
    Error::combine(errors).map_or(Ok(()), Err)
  }

  async fn converge_host(&self, login_role: &str, host: &str, accesses: Vec<&ReadWriteAccess>) -> Result<()> {
    let admin = self.selector.admin_for(host)?;
    let mut session = self
      .connector
      .connect(&ConnectionTarget::admin(host, &self.admin_database, &admin))
      .await?;

    let required = if accesses.is_empty() {
      RequiredRoles::new()
    } else {
      // IAM authenticated, no password
      primitives::create_role(session.as_mut(), login_role, true, &[], None).await?;
      required_roles(&self.static_roles, accesses)
    };
    let existing = primitives::role_memberships(session.as_mut(), login_role).await?;
    let diff = diff_roles(&existing, &required);

    let mut errors = Vec::new();
    for role in &diff.add {
      let grant = required.get(role).and_then(Option::as_ref);
      match self.add(session.as_mut(), host, &admin, login_role, role, grant).await {
        Ok(()) => info!("Granted {} to {} on {}", role, login_role, host),
        Err(err) => errors.push(err),
      }
    }
    for role in &diff.remove {
      match primitives::revoke_role(session.as_mut(), role, login_role).await {
        Ok(()) => info!("Revoked {} from {} on {}", role, login_role, host),
        Err(err) => errors.push(err.into()),
      }
    }
    session.close().await?;
    Error::combine(errors).map_or(Ok(()), Err)
  }

  async fn add(
    &self,
    session: &mut dyn Session,
    host: &str,
    admin: &AdminCredentials,
    login_role: &str,
    role: &str,
    grant: Option<&ManagedGrant>,
  ) -> Result<()> {
    if let Some(grant) = grant {
      let mut db = self
        .connector
        .connect(&ConnectionTarget::admin(host, &grant.database, admin))
        .await?;
      primitives::create_role(db.as_mut(), role, false, &[], None).await?;
      primitives::grant_connect(db.as_mut(), &grant.database, role).await?;
      for schema in &grant.schemas {
        primitives::grant_schema_usage(db.as_mut(), role, schema).await?;
        primitives::grant_table_privileges(db.as_mut(), role, schema, grant.privileges).await?;
      }
      db.close().await?;
    }
    primitives::grant_role(session, role, login_role).await?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    crd::AccessSpec,
    grants::DatabaseSchema,
    testing::{selector, FakeCluster, FakeHostCredentialsStore, FakeResolver},
  };

  fn access(database: &str, privilege: Privilege, extended: bool) -> ReadWriteAccess {
    ReadWriteAccess {
      host: "pg:5432".into(),
      database: DatabaseSchema {
        name: database.into(),
        schema: database.into(),
        privilege,
      },
      access: AccessSpec::default(),
      extended,
    }
  }

  fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
  }

  #[test]
  fn write_wins_over_read() {
    let accesses = [
      access("orders", Privilege::Read, false),
      access("orders", Privilege::Write, false),
      access("billing", Privilege::Read, false),
    ];
    let required = required_roles(&strings(&["rds_iam"]), &accesses);
    assert_eq!(
      required.keys().collect::<Vec<_>>(),
      vec!["billing_read", "orders_readwrite", "rds_iam"]
    );
    assert_eq!(required["rds_iam"], None);
    assert_eq!(
      required["orders_readwrite"].as_ref().unwrap().privileges,
      TablePrivileges::Write
    );
  }

  #[test]
  fn extended_write_keeps_role_name() {
    let required = required_roles(&[], &[access("orders", Privilege::Write, true)]);
    let grant = required["orders_readwrite"].as_ref().unwrap();
    assert_eq!(grant.privileges, TablePrivileges::ExtendedWrite);
  }

  #[test]
  fn diff_only_touches_managed_roles() {
    let required = required_roles(&strings(&["rds_iam"]), &[access("orders", Privilege::Read, false)]);
    let existing = strings(&["billing_read", "orders_readwrite", "analytics", "rds_iam"]);

    let diff = diff_roles(&existing, &required);
    assert_eq!(
      diff,
      RoleDiff {
        add: strings(&["orders_read"]),
        remove: strings(&["billing_read", "orders_readwrite"]),
      }
    );
  }

  #[tokio::test]
  async fn new_role_is_prepared_on_its_database() {
    let cluster = FakeCluster::default();
    let selector = selector(
      &[("pg:5432", AdminCredentials {
        user: "admin".into(),
        password: "admin".into(),
        params: String::new(),
      })],
      FakeResolver::default(),
      FakeHostCredentialsStore::default(),
    );
    let converger = Converger::new(Arc::new(cluster.connector()), selector, vec![], "postgres");
    let mut host_access = HostAccess::new();
    host_access.insert(
      "pg:5432/orders".into(),
      vec![access("orders", Privilege::Write, true)],
    );

    converger.converge("bob", &host_access).await.unwrap();

    assert_eq!(cluster.memberships("bob"), vec!["orders_readwrite"]);
    assert_eq!(
      cluster.connections(),
      vec!["admin@pg:5432/postgres", "admin@pg:5432/orders"]
    );
    let statements = cluster.statements();
    for expected in [
      "CREATE ROLE bob WITH LOGIN",
      "CREATE ROLE orders_readwrite WITH NOLOGIN",
      "GRANT CONNECT ON DATABASE orders TO orders_readwrite",
      "GRANT USAGE ON SCHEMA orders TO orders_readwrite",
      "GRANT SELECT, INSERT, UPDATE, DELETE, TRUNCATE, REFERENCES, TRIGGER ON ALL TABLES IN SCHEMA orders TO orders_readwrite",
      "GRANT orders_readwrite TO bob",
    ] {
      assert!(statements.contains(&expected.to_string()), "missing {expected}");
    }

    // second run has nothing to do
    let before = statements.len();
    converger.converge("bob", &host_access).await.unwrap();
    assert_eq!(cluster.statements()[before..], ["CREATE ROLE bob WITH LOGIN".to_string()]);
  }

  fn admin() -> AdminCredentials {
    AdminCredentials {
      user: "admin".into(),
      password: "admin".into(),
      params: String::new(),
    }
  }

  #[tokio::test]
  async fn hosts_without_access_lose_managed_roles() {
    let cluster = FakeCluster::default();
    let selector = selector(
      &[("pg:5432", admin()), ("other:5432", admin())],
      FakeResolver::default(),
      FakeHostCredentialsStore::default(),
    );
    let converger = Converger::new(Arc::new(cluster.connector()), selector, strings(&["rds_iam"]), "postgres");
    let mut host_access = HostAccess::new();
    host_access.insert("pg:5432/orders".into(), vec![access("orders", Privilege::Read, false)]);
    converger.converge("bob", &host_access).await.unwrap();
    assert_eq!(cluster.memberships("bob"), vec!["orders_read", "rds_iam"]);

    converger.converge("bob", &HostAccess::new()).await.unwrap();
    assert_eq!(cluster.memberships("bob"), vec!["rds_iam"]);
    assert!(cluster.statements().contains(&"REVOKE orders_read FROM bob".to_string()));
  }

  #[tokio::test]
  async fn empty_host_does_not_create_login() {
    let cluster = FakeCluster::default();
    let selector = selector(&[("pg:5432", admin())], FakeResolver::default(), FakeHostCredentialsStore::default());
    let converger = Converger::new(Arc::new(cluster.connector()), selector, strings(&["rds_iam"]), "postgres");

    converger.converge("bob", &HostAccess::new()).await.unwrap();
    assert!(!cluster.has_role("bob"));
    assert!(cluster.statements().is_empty());
  }

  #[tokio::test]
  async fn unknown_host_is_reported() {
    let cluster = FakeCluster::default();
    let selector = selector(&[], FakeResolver::default(), FakeHostCredentialsStore::default());
    let converger = Converger::new(Arc::new(cluster.connector()), selector, vec![], "postgres");
    let mut host_access = HostAccess::new();
    host_access.insert("pg:5432/orders".into(), vec![access("orders", Privilege::Read, false)]);

    let err = converger.converge("bob", &host_access).await.unwrap_err();
    assert_eq!(err.to_string(), "unknown credentials for host pg:5432");
    assert!(cluster.connections().is_empty());
  }
}
