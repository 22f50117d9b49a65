use log::{info, warn};

use super::{
  identifier,
  primitives::{self, create_role},
  AdminCredentials, ConnectionTarget, Connector, Credentials, Session, SqlError,
};

const INVALID_GRANT_OPERATION: &str = "0LP01";

/// Materializes a database, its owning role, schema and extensions on a host.
///
/// All owning roles share membership with a manager role in both directions so
/// any controller identity can administer objects created by another one.
pub struct Ensurer<'a> {
  connector: &'a dyn Connector,
  manager_role: &'a str,
  admin_database: &'a str,
}

impl<'a> Ensurer<'a> {
  pub fn new(connector: &'a dyn Connector, manager_role: &'a str, admin_database: &'a str) -> Self {
    Ensurer {
      connector,
      manager_role,
      admin_database,
    }
  }

  pub async fn ensure(
    &self,
    host: &str,
    admin: &AdminCredentials,
    target: &Credentials,
    extensions: &[String],
  ) -> Result<(), SqlError> {
    identifier(&target.name)?;
    identifier(&target.user)?;
    identifier(self.manager_role)?;
    for extension in extensions {
      identifier(extension)?;
    }

    let mut session = self
      .connector
      .connect(&ConnectionTarget::admin(host, self.admin_database, admin))
      .await?;
    self.ensure_owner(session.as_mut(), target).await?;
    session.close().await?;

    let mut session = self
      .connector
      .connect(&ConnectionTarget {
        host: host.to_string(),
        database: target.name.clone(),
        user: target.user.clone(),
        password: target.password.clone(),
        params: admin.params.clone(),
      })
      .await?;
    primitives::create_schema(session.as_mut(), &target.name).await?;
    primitives::revoke_public(session.as_mut(), &target.name).await?;
    session.close().await?;

    if !extensions.is_empty() {
      let mut session = self
        .connector
        .connect(&ConnectionTarget::admin(host, &target.name, admin))
        .await?;
      primitives::ensure_extensions(session.as_mut(), &target.name, extensions).await?;
      session.close().await?;
    }

    info!("Database {} on {} is ready for {}", target.name, host, target.user);
    Ok(())
  }

  async fn ensure_owner(&self, session: &mut dyn Session, target: &Credentials) -> Result<(), SqlError> {
    create_role(session, self.manager_role, true, &[], None).await?;
    let in_roles = if target.user == self.manager_role {
      Vec::new()
    } else {
      vec![self.manager_role.to_string()]
    };
    create_role(session, &target.user, true, &in_roles, Some(&target.password)).await?;
    if target.user != self.manager_role {
      match primitives::grant_role(session, &target.user, self.manager_role).await {
        Err(err) if err.code() == Some(INVALID_GRANT_OPERATION) => {
          warn!(
            "Role {} can not be granted to {}: {}",
            target.user, self.manager_role, err
          );
        }
        res => res?,
      }
    }

    primitives::create_database(session, &target.name).await?;

    if target.shared {
      let previous = primitives::database_owner(session, &target.name).await?;
      primitives::alter_database_owner(session, &target.name, self.manager_role).await?;
      if let Some(previous) = previous.filter(|o| o != &target.user && o != self.manager_role) {
        primitives::grant_role(session, &previous, &target.user).await?;
      }
    } else {
      primitives::alter_database_owner(session, &target.name, &target.user).await?;
    }
    Ok(())
  }
}
