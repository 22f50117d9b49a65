//! PostgreSQL access: connection targets, the driver seam and idempotent
//! statement primitives.

use std::{borrow::Cow, fmt, str::FromStr};

use async_trait::async_trait;
use log::debug;
use sqlx::{
  postgres::{PgConnectOptions, PgConnection, PgSslMode},
  Connection, Executor,
};
use thiserror::Error;

pub mod ensure;
pub mod primitives;

pub use ensure::Ensurer;

const DEFAULT_PORT: u16 = 5432;

#[derive(Debug, Error)]
pub enum SqlError {
  #[error("invalid identifier {0:?}")]
  InvalidIdentifier(String),
  #[error("invalid host {0:?}, expected hostname:port")]
  InvalidHost(String),
  #[error("{message} (SQLSTATE {code})")]
  Database { code: String, message: String },
  #[error(transparent)]
  Driver(sqlx::Error),
}

impl From<sqlx::Error> for SqlError {
  fn from(err: sqlx::Error) -> Self {
    match err {
      sqlx::Error::Database(db) => {
        let code = db.code().map(Cow::into_owned);
        match code {
          Some(code) => SqlError::Database {
            code,
            message: db.message().to_string(),
          },
          None => SqlError::Driver(sqlx::Error::Database(db)),
        }
      }
      other => SqlError::Driver(other),
    }
  }
}

impl SqlError {
  pub fn code(&self) -> Option<&str> {
    match self {
      SqlError::Database { code, .. } => Some(code),
      _ => None,
    }
  }
}

/// Login used by the controller against a host
#[derive(Clone, Default, PartialEq)]
pub struct AdminCredentials {
  pub user: String,
  pub password: String,
  pub params: String,
}

impl fmt::Debug for AdminCredentials {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("AdminCredentials")
      .field("user", &self.user)
      .field("params", &self.params)
      .finish_non_exhaustive()
  }
}

/// Desired database and its owning role
#[derive(Clone, Default, PartialEq)]
pub struct Credentials {
  pub name: String,
  pub user: String,
  pub password: String,
  pub params: String,
  pub shared: bool,
}

impl fmt::Debug for Credentials {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Credentials")
      .field("name", &self.name)
      .field("user", &self.user)
      .field("shared", &self.shared)
      .finish_non_exhaustive()
  }
}

#[derive(Clone, PartialEq)]
pub struct ConnectionTarget {
  /// `hostname:port`
  pub host: String,
  pub database: String,
  pub user: String,
  pub password: String,
  pub params: String,
}

impl fmt::Display for ConnectionTarget {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}@{}/{}", self.user, self.host, self.database)
  }
}

impl fmt::Debug for ConnectionTarget {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Display::fmt(self, f)
  }
}

impl ConnectionTarget {
  pub fn admin(host: &str, database: &str, admin: &AdminCredentials) -> Self {
    ConnectionTarget {
      host: host.to_string(),
      database: database.to_string(),
      user: admin.user.clone(),
      password: admin.password.clone(),
      params: admin.params.clone(),
    }
  }

  pub fn connect_options(&self) -> Result<PgConnectOptions, SqlError> {
    let (hostname, port) = match self.host.rsplit_once(':') {
      Some((hostname, port)) => (
        hostname,
        port
          .parse::<u16>()
          .map_err(|_| SqlError::InvalidHost(self.host.clone()))?,
      ),
      None => (self.host.as_str(), DEFAULT_PORT),
    };
    if hostname.is_empty() {
      return Err(SqlError::InvalidHost(self.host.clone()));
    }

    let mut opts = PgConnectOptions::new()
      .host(hostname)
      .port(port)
      .database(&self.database)
      .username(&self.user);
    if !self.password.is_empty() {
      opts = opts.password(&self.password);
    }

    for (key, value) in parse_params(&self.params) {
      opts = match key {
        "sslmode" => opts.ssl_mode(PgSslMode::from_str(value).map_err(SqlError::Driver)?),
        "application_name" => opts.application_name(value),
        _ => opts.options([(key, value)]),
      };
    }
    Ok(opts)
  }
}

/// Splits `key=value key2=value2`, skipping entries without `=`
pub fn parse_params(params: &str) -> impl Iterator<Item = (&str, &str)> {
  params.split_whitespace().filter_map(|kv| kv.split_once('='))
}

/// Accepts `[a-zA-Z_][a-zA-Z0-9_]*`, the only names interpolated into DDL
pub fn identifier(name: &str) -> Result<&str, SqlError> {
  let mut chars = name.chars();
  let valid = match chars.next() {
    Some(first) => {
      (first.is_ascii_alphabetic() || first == '_') && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    }
    None => false,
  };
  if valid {
    Ok(name)
  } else {
    Err(SqlError::InvalidIdentifier(name.to_string()))
  }
}

/// Single quoted SQL string literal
pub fn literal(value: &str) -> String {
  format!("'{}'", value.replace('\'', "''"))
}

/// One open connection; statements run in order
#[async_trait]
pub trait Session: Send {
  async fn execute(&mut self, statement: &str) -> Result<(), SqlError>;

  /// Runs a query returning a single text column
  async fn query_names(&mut self, query: &str, params: &[&str]) -> Result<Vec<String>, SqlError>;

  async fn close(self: Box<Self>) -> Result<(), SqlError>;
}

#[async_trait]
pub trait Connector: Send + Sync {
  async fn connect(&self, target: &ConnectionTarget) -> Result<Box<dyn Session>, SqlError>;
}

/// Opens real connections through sqlx
#[derive(Debug, Clone, Copy, Default)]
pub struct PgConnector;

#[async_trait]
impl Connector for PgConnector {
  async fn connect(&self, target: &ConnectionTarget) -> Result<Box<dyn Session>, SqlError> {
    debug!("Connecting to {}", target);
    let conn = PgConnection::connect_with(&target.connect_options()?).await?;
    Ok(Box::new(PgSession { conn }))
  }
}

struct PgSession {
  conn: PgConnection,
}

#[async_trait]
impl Session for PgSession {
  async fn execute(&mut self, statement: &str) -> Result<(), SqlError> {
    // simple query protocol, DDL can't be prepared with bind parameters
    (&mut self.conn).execute(statement).await?;
    Ok(())
  }

  async fn query_names(&mut self, query: &str, params: &[&str]) -> Result<Vec<String>, SqlError> {
    let mut q = sqlx::query_scalar::<_, String>(query);
    for param in params {
      q = q.bind(param.to_string());
    }
    Ok(q.fetch_all(&mut self.conn).await?)
  }

  async fn close(self: Box<Self>) -> Result<(), SqlError> {
    self.conn.close().await?;
    Ok(())
  }
}
