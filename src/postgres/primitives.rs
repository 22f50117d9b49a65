//! Idempotent statements. Repeating any of them converges on the same state;
//! "already exists" failures are reported as success.

use log::info;

use super::{identifier, literal, Session, SqlError};

const DUPLICATE_OBJECT: &str = "42710";
const DUPLICATE_DATABASE: &str = "42P04";
const DUPLICATE_SCHEMA: &str = "42P06";

/// SQLSTATE name when `code` means the object is already there
pub fn idempotent_code_name(code: &str) -> Option<&'static str> {
  match code {
    DUPLICATE_OBJECT => Some("duplicate_object"),
    DUPLICATE_DATABASE => Some("duplicate_database"),
    DUPLICATE_SCHEMA => Some("duplicate_schema"),
    _ => None,
  }
}

/// Whether the statement failed with an error that leaves the object in place
pub fn is_idempotent(err: &SqlError) -> bool {
  err.code().and_then(idempotent_code_name).is_some()
}

async fn execute_idempotent(session: &mut dyn Session, statement: &str) -> Result<bool, SqlError> {
  match session.execute(statement).await {
    Ok(()) => Ok(true),
    Err(err) => match err.code().and_then(idempotent_code_name) {
      Some(name) => {
        info!("{}: {}, treating as success", statement, name);
        Ok(false)
      }
      None => Err(err),
    },
  }
}

/// Table privileges granted to a managed role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TablePrivileges {
  Read,
  Write,
  ExtendedWrite,
}

impl TablePrivileges {
  pub fn sql(self) -> &'static str {
    match self {
      TablePrivileges::Read => "SELECT",
      TablePrivileges::Write => "SELECT, INSERT, UPDATE, DELETE",
      TablePrivileges::ExtendedWrite => "SELECT, INSERT, UPDATE, DELETE, TRUNCATE, REFERENCES, TRIGGER",
    }
  }
}

/// Creates `name` when missing. Memberships in `in_roles` are granted either way.
/// An existing role gets its password reset when one is given.
pub async fn create_role(
  session: &mut dyn Session,
  name: &str,
  login: bool,
  in_roles: &[String],
  password: Option<&str>,
) -> Result<(), SqlError> {
  let name = identifier(name)?;
  for role in in_roles {
    identifier(role)?;
  }

  let mut statement = format!("CREATE ROLE {} WITH {}", name, if login { "LOGIN" } else { "NOLOGIN" });
  if let Some(password) = password {
    statement.push_str(&format!(" PASSWORD {}", literal(password)));
  }
  if !in_roles.is_empty() {
    statement.push_str(&format!(" IN ROLE {}", in_roles.join(", ")));
  }

  let created = execute_idempotent(session, &statement).await?;
  if !created {
    if let Some(password) = password {
      session
        .execute(&format!("ALTER ROLE {} WITH PASSWORD {}", name, literal(password)))
        .await?;
    }
  }
  if !in_roles.is_empty() {
    session
      .execute(&format!("GRANT {} TO {}", in_roles.join(", "), name))
      .await?;
  }
  Ok(())
}

/// Makes `member` a member of `role`
pub async fn grant_role(session: &mut dyn Session, role: &str, member: &str) -> Result<(), SqlError> {
  session
    .execute(&format!("GRANT {} TO {}", identifier(role)?, identifier(member)?))
    .await
}

pub async fn revoke_role(session: &mut dyn Session, role: &str, member: &str) -> Result<(), SqlError> {
  session
    .execute(&format!("REVOKE {} FROM {}", identifier(role)?, identifier(member)?))
    .await
}

/// Sets the password of a service login that never expires and cannot create roles
pub async fn alter_service_role(session: &mut dyn Session, name: &str, password: &str) -> Result<(), SqlError> {
  session
    .execute(&format!(
      "ALTER ROLE {} WITH LOGIN PASSWORD {} VALID UNTIL 'infinity' NOCREATEROLE",
      identifier(name)?,
      literal(password)
    ))
    .await
}

pub async fn create_database(session: &mut dyn Session, name: &str) -> Result<(), SqlError> {
  execute_idempotent(session, &format!("CREATE DATABASE {}", identifier(name)?))
    .await
    .map(drop)
}

pub async fn alter_database_owner(session: &mut dyn Session, name: &str, owner: &str) -> Result<(), SqlError> {
  session
    .execute(&format!(
      "ALTER DATABASE {} OWNER TO {}",
      identifier(name)?,
      identifier(owner)?
    ))
    .await
}

/// Current owner of database `name`
pub async fn database_owner(session: &mut dyn Session, name: &str) -> Result<Option<String>, SqlError> {
  let owners = session
    .query_names(
      "SELECT pg_get_userbyid(datdba)::text FROM pg_database WHERE datname = $1",
      &[name],
    )
    .await?;
  Ok(owners.into_iter().next())
}

/// Must run as the role that should own the schema
pub async fn create_schema(schema_owner: &mut dyn Session, name: &str) -> Result<(), SqlError> {
  execute_idempotent(schema_owner, &format!("CREATE SCHEMA {}", identifier(name)?))
    .await
    .map(drop)
}

/// Strips PUBLIC of every right on the database, the public schema and its tables
pub async fn revoke_public(database_owner: &mut dyn Session, database: &str) -> Result<(), SqlError> {
  let database = identifier(database)?;
  for statement in [
    format!("REVOKE ALL ON DATABASE {} FROM PUBLIC", database),
    "REVOKE ALL ON SCHEMA public FROM PUBLIC".to_string(),
    "REVOKE ALL ON ALL TABLES IN SCHEMA public FROM PUBLIC".to_string(),
  ] {
    database_owner.execute(&statement).await?;
  }
  Ok(())
}

pub async fn grant_connect(session: &mut dyn Session, database: &str, role: &str) -> Result<(), SqlError> {
  session
    .execute(&format!(
      "GRANT CONNECT ON DATABASE {} TO {}",
      identifier(database)?,
      identifier(role)?
    ))
    .await
}

pub async fn grant_schema_usage(session: &mut dyn Session, role: &str, schema: &str) -> Result<(), SqlError> {
  session
    .execute(&format!(
      "GRANT USAGE ON SCHEMA {} TO {}",
      identifier(schema)?,
      identifier(role)?
    ))
    .await
}

pub async fn grant_table_privileges(
  session: &mut dyn Session,
  role: &str,
  schema: &str,
  privileges: TablePrivileges,
) -> Result<(), SqlError> {
  session
    .execute(&format!(
      "GRANT {} ON ALL TABLES IN SCHEMA {} TO {}",
      privileges.sql(),
      identifier(schema)?,
      identifier(role)?
    ))
    .await
}

/// Role names `user` is a direct member of
pub async fn role_memberships(session: &mut dyn Session, user: &str) -> Result<Vec<String>, SqlError> {
  session
    .query_names(
      "SELECT r.rolname::text FROM pg_user u \
       JOIN pg_auth_members m ON m.member = u.usesysid \
       JOIN pg_roles r ON r.oid = m.roleid \
       WHERE u.usename = $1",
      &[user],
    )
    .await
}

/// Installs missing extensions into `schema`. Extensions are never removed.
pub async fn ensure_extensions(session: &mut dyn Session, schema: &str, extensions: &[String]) -> Result<(), SqlError> {
  if extensions.is_empty() {
    return Ok(());
  }
  let schema = identifier(schema)?;
  let installed = session.query_names("SELECT extname::text FROM pg_extension", &[]).await?;
  for extension in extensions {
    if installed.iter().any(|e| e == extension) {
      continue;
    }
    session
      .execute(&format!(
        "CREATE EXTENSION IF NOT EXISTS {} WITH SCHEMA {}",
        identifier(extension)?,
        schema
      ))
      .await?;
    info!("Created extension {} in schema {}", extension, schema);
  }
  Ok(())
}
