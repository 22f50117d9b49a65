//! IAM policies allowing developers to `rds-db:connect` as their PostgreSQL
//! role. Statements are spread over a shard of policies of bounded size.

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod aws;

pub use aws::AwsPolicyStore;

pub const POLICY_VERSION: &str = "2012-10-17";
pub const CONNECT_ACTION: &str = "rds-db:connect";
const USER_ID_KEY: &str = "aws:userid";
const USER_DOMAIN: &str = "lunar.app";

#[derive(Debug, Error)]
pub enum IamError {
  #[error("aws iam: {0}")]
  Aws(#[from] Box<aws_sdk_iam::Error>),
  #[error("policy {policy} document: {source}")]
  Document {
    policy: String,
    #[source]
    source: serde_json::Error,
  },
  #[error("policy {policy} document is not url encoded: {message}")]
  Encoding { policy: String, message: String },
  #[error("policy {0}: response is missing {1}")]
  Incomplete(String, &'static str),
  #[error("no such entity: {0}")]
  NoSuchEntity(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PolicyDocument {
  pub version: String,
  pub statement: Vec<Statement>,
}

impl Default for PolicyDocument {
  fn default() -> Self {
    PolicyDocument {
      version: POLICY_VERSION.to_string(),
      statement: Vec::new(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Statement {
  pub effect: String,
  pub action: Vec<String>,
  pub resource: Vec<String>,
  pub condition: Condition,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Condition {
  pub string_like: BTreeMap<String, String>,
}

impl Statement {
  pub fn user_id(&self) -> Option<&str> {
    self.condition.string_like.get(USER_ID_KEY).map(String::as_str)
  }
}

/// A customer managed policy with its default version decoded
#[derive(Debug, Clone, PartialEq)]
pub struct ManagedPolicy {
  pub name: String,
  pub arn: String,
  pub version_id: String,
  pub document: PolicyDocument,
}

/// The IAM calls the sharder needs
#[async_trait]
pub trait IamPolicyStore: Send + Sync {
  async fn list_policies(&self, path_prefix: &str) -> Result<Vec<ManagedPolicy>, IamError>;

  async fn create_policy(&self, name: &str, path: &str, document: &PolicyDocument) -> Result<ManagedPolicy, IamError>;

  /// Creates a new default version and returns its id
  async fn create_policy_version(&self, arn: &str, document: &PolicyDocument) -> Result<String, IamError>;

  async fn delete_policy_version(&self, arn: &str, version_id: &str) -> Result<(), IamError>;

  /// Roles the policy is attached to
  async fn attached_roles(&self, arn: &str) -> Result<Vec<String>, IamError>;

  async fn attach_role_policy(&self, role: &str, arn: &str) -> Result<(), IamError>;

  async fn detach_role_policy(&self, role: &str, arn: &str) -> Result<(), IamError>;

  async fn delete_policy(&self, arn: &str) -> Result<(), IamError>;
}

#[derive(Debug, Clone)]
pub struct SharderConfig {
  /// Policies are named `{policy_base_name}_{n}`
  pub policy_base_name: String,
  pub path_prefix: String,
  pub region: String,
  pub account_id: String,
  /// Prefix of the PostgreSQL role names in resource ARNs
  pub role_prefix: String,
  pub statement_limit: usize,
  /// IAM roles every policy holding a statement is attached to
  pub login_roles: Vec<String>,
}

/// Normalises an IAM path to start and end with `/`
pub fn policy_path(prefix: &str) -> String {
  let trimmed = prefix.trim_matches('/');
  if trimmed.is_empty() {
    "/".to_string()
  } else {
    format!("/{}/", trimmed)
  }
}

pub struct Sharder {
  store: Arc<dyn IamPolicyStore>,
  config: SharderConfig,
}

impl Sharder {
  pub fn new(store: Arc<dyn IamPolicyStore>, config: SharderConfig) -> Self {
    Sharder { store, config }
  }

  fn user_id(username: &str) -> String {
    format!("*:{}@{}", username, USER_DOMAIN)
  }

  fn resource(&self, rolename: &str) -> String {
    format!(
      "arn:aws:rds-db:{}:{}:dbuser:*/{}{}",
      self.config.region, self.config.account_id, self.config.role_prefix, rolename
    )
  }

  pub fn statement(&self, username: &str, rolename: &str) -> Statement {
    Statement {
      effect: "Allow".to_string(),
      action: vec![CONNECT_ACTION.to_string()],
      resource: vec![self.resource(rolename)],
      condition: Condition {
        string_like: BTreeMap::from([(USER_ID_KEY.to_string(), Self::user_id(username))]),
      },
    }
  }

  async fn policies(&self) -> Result<Vec<ManagedPolicy>, IamError> {
    let mut policies = self.store.list_policies(&policy_path(&self.config.path_prefix)).await?;
    policies.sort_by_key(|p| (self.index(&p.name).unwrap_or(usize::MAX), p.name.clone()));
    Ok(policies)
  }

  fn index(&self, policy_name: &str) -> Option<usize> {
    policy_name
      .strip_prefix(&self.config.policy_base_name)?
      .strip_prefix('_')?
      .parse()
      .ok()
  }

  /// Makes sure exactly one statement lets `username` connect as `rolename`
  /// and that the policy holding it is attached to every login role
  pub async fn ensure_user(&self, username: &str, rolename: &str) -> Result<(), IamError> {
    let user_id = Self::user_id(username);
    let wanted = self.statement(username, rolename);
    let policies = self.policies().await?;

    let mut holder: Option<&ManagedPolicy> = None;
    for policy in &policies {
      let mut document = policy.document.clone();
      let mut changed = false;
      document.statement.retain_mut(|statement| {
        if statement.user_id() != Some(user_id.as_str()) {
          return true;
        }
        if holder.is_some() {
          // duplicate from an earlier run, the first occurrence is kept
          changed = true;
          return false;
        }
        holder = Some(policy);
        if statement.resource != wanted.resource {
          statement.resource = wanted.resource.clone();
          changed = true;
        }
        true
      });
      if changed {
        info!("Updating statement for {} in policy {}", username, policy.name);
        self.replace_document(policy, document).await?;
      }
    }
    if let Some(policy) = holder {
      debug!("IAM statement for {} is in policy {}", username, policy.name);
      return self.ensure_attached(&policy.name, &policy.arn).await;
    }

    if let Some(policy) = policies
      .iter()
      .find(|p| p.document.statement.len() < self.config.statement_limit)
    {
      let mut document = policy.document.clone();
      document.statement.push(wanted);
      info!("Adding {} to policy {}", username, policy.name);
      self.replace_document(policy, document).await?;
      return self.ensure_attached(&policy.name, &policy.arn).await;
    }

    let name = self.next_policy_name(&policies);
    let document = PolicyDocument {
      statement: vec![wanted],
      ..PolicyDocument::default()
    };
    info!("Creating policy {} for {}", name, username);
    let policy = self
      .store
      .create_policy(&name, &policy_path(&self.config.path_prefix), &document)
      .await?;
    self.ensure_attached(&policy.name, &policy.arn).await
  }

  async fn ensure_attached(&self, name: &str, arn: &str) -> Result<(), IamError> {
    let attached = self.store.attached_roles(arn).await?;
    for role in &self.config.login_roles {
      if attached.contains(role) {
        continue;
      }
      self.store.attach_role_policy(role, arn).await?;
      info!("Attached policy {} to role {}", name, role);
    }
    Ok(())
  }

  /// Drops every statement for `username`, deleting policies left empty
  pub async fn remove_user(&self, username: &str) -> Result<(), IamError> {
    let user_id = Self::user_id(username);
    for policy in self.policies().await? {
      let mut document = policy.document.clone();
      document.statement.retain(|s| s.user_id() != Some(user_id.as_str()));
      if document.statement.len() == policy.document.statement.len() {
        continue;
      }

      if document.statement.is_empty() {
        for role in self.store.attached_roles(&policy.arn).await? {
          match self.store.detach_role_policy(&role, &policy.arn).await {
            Ok(()) | Err(IamError::NoSuchEntity(_)) => {}
            Err(err) => return Err(err),
          }
        }
        self.store.delete_policy(&policy.arn).await?;
        info!("Deleted empty policy {} after removing {}", policy.name, username);
      } else {
        self.replace_document(&policy, document).await?;
        info!("Removed {} from policy {}", username, policy.name);
      }
    }
    Ok(())
  }

  /// IAM keeps at most five versions per policy, so the previous default goes away
  async fn replace_document(&self, policy: &ManagedPolicy, document: PolicyDocument) -> Result<(), IamError> {
    let version = self.store.create_policy_version(&policy.arn, &document).await?;
    self
      .store
      .delete_policy_version(&policy.arn, &policy.version_id)
      .await?;
    debug!("Policy {} is now at version {}", policy.name, version);
    Ok(())
  }

  fn next_policy_name(&self, policies: &[ManagedPolicy]) -> String {
    let taken: Vec<usize> = policies.iter().filter_map(|p| self.index(&p.name)).collect();
    let n = (0..).find(|n| !taken.contains(n)).unwrap_or(taken.len());
    format!("{}_{}", self.config.policy_base_name, n)
  }
}
