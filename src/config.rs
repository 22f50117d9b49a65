use std::{sync::Arc, time::Duration};

use clap::{ArgAction, Parser};

use crate::{
  grants::{FeatureFlags, GrantConfig},
  hosts::HostCredentials,
  iam::{aws::AwsCredentials, SharderConfig},
  postgres::AdminCredentials,
};

/// Command line and environment configuration of the operator
#[derive(Parser, Debug)]
#[command(name = "operator", about = "Manages PostgreSQL databases, roles and IAM access")]
pub struct Config {
  /// Admin logins per host, `host=user:password[=params]`, comma separated
  #[arg(long, env = "HOST_CREDENTIALS", value_delimiter = ',', value_parser = parse_host_credentials)]
  pub host_credentials: Vec<(String, AdminCredentials)>,

  /// Roles granted to every managed user
  #[arg(long, env = "USER_ROLES", value_delimiter = ',', default_value = "rds_iam")]
  pub user_roles: Vec<String>,

  /// Prefix of the PostgreSQL role of every managed user
  #[arg(long, env = "USER_ROLE_PREFIX", default_value = "iam_developer_")]
  pub user_role_prefix: String,

  /// Shared role owning or administering every managed database
  #[arg(long, env = "MANAGER_ROLE_NAME", default_value = "postgresql_operator_manager")]
  pub manager_role_name: String,

  #[arg(long, env = "ALL_DATABASES_ENABLED_READ", action = ArgAction::Set, default_value_t = false)]
  pub all_databases_enabled_read: bool,

  #[arg(long, env = "ALL_DATABASES_ENABLED_WRITE", action = ArgAction::Set, default_value_t = false)]
  pub all_databases_enabled_write: bool,

  #[arg(long, env = "EXTENDED_WRITE_ENABLED", action = ArgAction::Set, default_value_t = false)]
  pub extended_write_enabled: bool,

  /// Base name of the IAM policy shard, policies are `<name>_<n>`
  #[arg(long, env = "AWS_POLICY_NAME", default_value = "postgres_access")]
  pub aws_policy_name: String,

  #[arg(long, env = "AWS_REGION", default_value = "eu-west-1")]
  pub aws_region: String,

  #[arg(long, env = "AWS_ACCOUNT_ID", default_value = "")]
  pub aws_account_id: String,

  #[arg(long, env = "AWS_PROFILE")]
  pub aws_profile: Option<String>,

  #[arg(long, env = "AWS_ACCESS_KEY_ID", hide_env_values = true)]
  pub aws_access_key_id: Option<String>,

  #[arg(long, env = "AWS_SECRET_ACCESS_KEY", hide_env_values = true)]
  pub aws_secret_access_key: Option<String>,

  /// IAM path the shard policies live under
  #[arg(long, env = "IAM_POLICY_PREFIX", default_value = "postgresql-operator")]
  pub iam_policy_prefix: String,

  /// Statements per IAM policy before a new one is created
  #[arg(long, env = "IAM_POLICY_STATEMENT_LIMIT", default_value_t = 30)]
  pub iam_policy_statement_limit: usize,

  /// IAM roles new shard policies are attached to, comma separated
  #[arg(long, env = "IAM_LOGIN_ROLES", value_delimiter = ',')]
  pub iam_login_roles: Vec<String>,

  /// Seconds between full resyncs of every resource
  #[arg(long, env = "RESYNC_PERIOD", default_value_t = 36000)]
  pub resync_period: u64,

  /// Seconds between background syncs of every PostgreSQLUser
  #[arg(long, env = "SYNC_INTERVAL", default_value_t = 300)]
  pub sync_interval: u64,

  /// Database admin connections are opened against
  #[arg(long, env = "ADMIN_DATABASE", default_value = "postgres")]
  pub admin_database: String,
}

/// Parses `host=user:password[=params]`
pub fn parse_host_credentials(entry: &str) -> Result<(String, AdminCredentials), String> {
  let malformed = || {
    let host = entry.split('=').next().unwrap_or_default();
    format!("host credentials for {:?} must be host=user:password[=params]", host)
  };
  let (host, login) = entry.trim().split_once('=').ok_or_else(malformed)?;
  let (user, rest) = login.split_once(':').ok_or_else(malformed)?;
  let (password, params) = rest.split_once('=').unwrap_or((rest, ""));
  if host.is_empty() || user.is_empty() {
    return Err(malformed());
  }
  Ok((
    host.to_string(),
    AdminCredentials {
      user: user.to_string(),
      password: password.to_string(),
      params: params.to_string(),
    },
  ))
}

impl Config {
  pub fn host_credentials(&self) -> Arc<HostCredentials> {
    Arc::new(self.host_credentials.iter().cloned().collect())
  }

  pub fn feature_flags(&self) -> FeatureFlags {
    FeatureFlags {
      all_databases_read: self.all_databases_enabled_read,
      all_databases_write: self.all_databases_enabled_write,
      extended_write: self.extended_write_enabled,
    }
  }

  pub fn grant_config(&self) -> GrantConfig {
    GrantConfig {
      static_roles: self.user_roles.iter().filter(|r| !r.is_empty()).cloned().collect(),
      role_prefix: self.user_role_prefix.clone(),
    }
  }

  pub fn sharder_config(&self) -> SharderConfig {
    SharderConfig {
      policy_base_name: self.aws_policy_name.clone(),
      path_prefix: self.iam_policy_prefix.clone(),
      region: self.aws_region.clone(),
      account_id: self.aws_account_id.clone(),
      role_prefix: self.user_role_prefix.clone(),
      statement_limit: self.iam_policy_statement_limit,
      login_roles: self.iam_login_roles.iter().filter(|r| !r.is_empty()).cloned().collect(),
    }
  }

  pub fn aws_credentials(&self) -> AwsCredentials {
    AwsCredentials {
      profile: self.aws_profile.clone(),
      access_key_id: self.aws_access_key_id.clone(),
      secret_access_key: self.aws_secret_access_key.clone(),
    }
  }

  pub fn resync_period(&self) -> Duration {
    Duration::from_secs(self.resync_period)
  }

  pub fn sync_interval(&self) -> Duration {
    Duration::from_secs(self.sync_interval)
  }
}
