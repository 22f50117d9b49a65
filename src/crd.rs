use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const GROUP: &str = "postgresql.lunar.tech";

/// A value given inline or read from a Secret or ConfigMap key
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceVar {
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub value: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub value_from: Option<ResourceVarSource>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceVarSource {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub secret_key_ref: Option<KeySelector>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub config_map_key_ref: Option<KeySelector>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct KeySelector {
  pub name: String,
  pub key: String,
}

impl ResourceVar {
  pub fn from_value(value: impl Into<String>) -> Self {
    ResourceVar {
      value: value.into(),
      value_from: None,
    }
  }

  pub fn secret(name: impl Into<String>, key: impl Into<String>) -> Self {
    ResourceVar {
      value: String::new(),
      value_from: Some(ResourceVarSource {
        secret_key_ref: Some(KeySelector {
          name: name.into(),
          key: key.into(),
        }),
        config_map_key_ref: None,
      }),
    }
  }

  pub fn config_map(name: impl Into<String>, key: impl Into<String>) -> Self {
    ResourceVar {
      value: String::new(),
      value_from: Some(ResourceVarSource {
        secret_key_ref: None,
        config_map_key_ref: Some(KeySelector {
          name: name.into(),
          key: key.into(),
        }),
      }),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.value.is_empty()
      && self
        .value_from
        .as_ref()
        .map_or(true, |from| from.secret_key_ref.is_none() && from.config_map_key_ref.is_none())
  }
}

/// Database, owning role and schema on a PostgreSQL host
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
  group = "postgresql.lunar.tech",
  version = "v1alpha1",
  kind = "PostgreSQLDatabase",
  namespaced,
  status = "PostgreSQLDatabaseStatus",
  shortname = "pgdb"
)]
#[serde(rename_all = "camelCase")]
pub struct PostgreSQLDatabaseSpec {
  /// Name of the database and of its schema
  pub name: String,
  /// Owning role, defaults to the database name
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub user: Option<ResourceVar>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub password: Option<ResourceVar>,
  /// Database is owned by the manager role instead of `user`
  #[serde(default)]
  pub is_shared: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub host: Option<ResourceVar>,
  /// Name of a PostgreSQLHostCredentials resource in the same namespace
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub host_credentials: Option<String>,
  #[serde(default)]
  pub extensions: Vec<PostgreSQLDatabaseExtension>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct PostgreSQLDatabaseExtension {
  pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum DatabasePhase {
  Running,
  Failed,
  Invalid,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PostgreSQLDatabaseStatus {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub phase: Option<DatabasePhase>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub phase_updated: Option<DateTime<Utc>>,
  #[serde(default)]
  pub host: String,
  #[serde(default)]
  pub user: String,
  #[serde(default)]
  pub error: String,
}

/// Admin credentials for a PostgreSQL host
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
  group = "postgresql.lunar.tech",
  version = "v1alpha1",
  kind = "PostgreSQLHostCredentials",
  namespaced,
  shortname = "pghost"
)]
#[serde(rename_all = "camelCase")]
pub struct PostgreSQLHostCredentialsSpec {
  /// `hostname:port`
  pub host: ResourceVar,
  pub user: ResourceVar,
  pub password: ResourceVar,
  /// Space separated `key=value` driver parameters
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub params: Option<ResourceVar>,
}

/// Developer access to databases through IAM authentication
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
  group = "postgresql.lunar.tech",
  version = "v1alpha1",
  kind = "PostgreSQLUser",
  namespaced,
  shortname = "pguser"
)]
#[serde(rename_all = "camelCase")]
pub struct PostgreSQLUserSpec {
  /// Login name, `.` is replaced with `_` in PostgreSQL
  pub name: String,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub read: Vec<AccessSpec>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub write: Vec<WriteAccessSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AccessSpec {
  pub host: ResourceVar,
  /// Grant access to every database on the host
  #[serde(default)]
  pub all_databases: bool,
  #[serde(default)]
  pub database: ResourceVar,
  #[serde(default)]
  pub schema: ResourceVar,
  #[serde(default)]
  pub reason: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub start: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub stop: Option<DateTime<Utc>>,
}

impl AccessSpec {
  /// Whether `now` falls inside the optional start/stop window
  pub fn is_active(&self, now: DateTime<Utc>) -> bool {
    self.start.map_or(true, |start| start <= now) && self.stop.map_or(true, |stop| now < stop)
  }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WriteAccessSpec {
  #[serde(flatten)]
  pub access: AccessSpec,
  /// Also grant TRUNCATE, REFERENCES and TRIGGER
  #[serde(default)]
  pub extended: bool,
}

/// Password authenticated login role for services
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
  group = "postgresql.lunar.tech",
  version = "v1alpha1",
  kind = "PostgreSQLServiceUser",
  namespaced,
  shortname = "pgserviceuser"
)]
#[serde(rename_all = "camelCase")]
pub struct PostgreSQLServiceUserSpec {
  pub name: String,
  pub host: ResourceVar,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub password: Option<ResourceVar>,
  #[serde(default)]
  pub roles: Vec<ServiceUserRole>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceUserRole {
  pub role_name: String,
}
