//! Developer access: planning declared read/write intents into role
//! memberships and converging PostgreSQL onto that plan.

use std::collections::BTreeMap;

use log::info;

use crate::{
  crd::{AccessSpec, WriteAccessSpec},
  Error, Result,
};

pub mod converger;
pub mod planner;

pub use converger::Converger;
pub use planner::{DatabaseInventory, KubeDatabaseInventory, Plan, Planner};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Privilege {
  Read,
  Write,
}

/// Target of a grant
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DatabaseSchema {
  pub name: String,
  pub schema: String,
  pub privilege: Privilege,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadWriteAccess {
  pub host: String,
  pub database: DatabaseSchema,
  /// The intent this access was planned from
  pub access: AccessSpec,
  /// Extended write privileges, already gated by the cluster flag
  pub extended: bool,
}

/// Planned accesses keyed by `host/database`
pub type HostAccess = BTreeMap<String, Vec<ReadWriteAccess>>;

pub fn access_key(host: &str, database: &str) -> String {
  format!("{}/{}", host, database)
}

/// PostgreSQL legal form of a user name
pub fn sanitize(name: &str) -> String {
  name.replace('.', "_")
}

/// Roles and naming shared by every managed user
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GrantConfig {
  pub static_roles: Vec<String>,
  pub role_prefix: String,
}

/// Cluster wide toggles
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeatureFlags {
  pub all_databases_read: bool,
  pub all_databases_write: bool,
  pub extended_write: bool,
}

impl FeatureFlags {
  pub fn all_databases(&self, privilege: Privilege) -> bool {
    match privilege {
      Privilege::Read => self.all_databases_read,
      Privilege::Write => self.all_databases_write,
    }
  }
}

pub struct Granter {
  planner: Planner,
  converger: Converger,
  role_prefix: String,
}

impl Granter {
  pub fn new(planner: Planner, converger: Converger, role_prefix: impl Into<String>) -> Self {
    Granter {
      planner,
      converger,
      role_prefix: role_prefix.into(),
    }
  }

  /// PostgreSQL login role for an already sanitized user name
  pub fn login_role(&self, sanitized: &str) -> String {
    format!("{}{}", self.role_prefix, sanitized)
  }

  /// Plans the intents and converges every host they touch. Intents that fail
  /// to plan are reported without holding back the others.
  pub async fn sync_user(
    &self,
    namespace: &str,
    sanitized: &str,
    reads: &[AccessSpec],
    writes: &[WriteAccessSpec],
  ) -> Result<()> {
    let Plan { access, mut errors } = self.planner.plan(namespace, reads, writes).await;
    let login_role = self.login_role(sanitized);
    info!(
      "Planned {} database accesses for {} with {} errors",
      access.values().map(Vec::len).sum::<usize>(),
      login_role,
      errors.len()
    );
    if let Err(err) = self.converger.converge(&login_role, &access).await {
      errors.push(err);
    }
    Error::combine(errors).map_or(Ok(()), Err)
  }
}
