use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_iam::{
  config::Credentials,
  error::SdkError,
  types::{EntityType, Policy, PolicyScopeType},
  Client,
};
use log::debug;

use super::{IamError, IamPolicyStore, ManagedPolicy, PolicyDocument};

fn sdk<E, R>(err: SdkError<E, R>) -> IamError
where
  aws_sdk_iam::Error: From<SdkError<E, R>>,
{
  match aws_sdk_iam::Error::from(err) {
    aws_sdk_iam::Error::NoSuchEntityException(e) => IamError::NoSuchEntity(e.message().unwrap_or_default().to_string()),
    err => IamError::Aws(Box::new(err)),
  }
}

fn encode(policy: &str, document: &PolicyDocument) -> Result<String, IamError> {
  serde_json::to_string(document).map_err(|source| IamError::Document {
    policy: policy.to_string(),
    source,
  })
}

/// Decodes a policy version document, which IAM returns url encoded
pub fn decode(policy: &str, document: &str) -> Result<PolicyDocument, IamError> {
  let json = urlencoding::decode(document).map_err(|e| IamError::Encoding {
    policy: policy.to_string(),
    message: e.to_string(),
  })?;
  serde_json::from_str(&json).map_err(|source| IamError::Document {
    policy: policy.to_string(),
    source,
  })
}

/// Customer managed policies in AWS IAM
#[derive(Clone)]
pub struct AwsPolicyStore {
  client: Client,
}

/// How the IAM client authenticates
#[derive(Debug, Clone, Default)]
pub struct AwsCredentials {
  pub profile: Option<String>,
  pub access_key_id: Option<String>,
  pub secret_access_key: Option<String>,
}

impl AwsPolicyStore {
  pub fn new(client: Client) -> Self {
    AwsPolicyStore { client }
  }

  /// Static keys win over a named profile; without either the default chain is used
  pub async fn from_env(region: &str, credentials: &AwsCredentials) -> Self {
    let mut loader = aws_config::defaults(BehaviorVersion::latest()).region(Region::new(region.to_string()));
    match (&credentials.access_key_id, &credentials.secret_access_key) {
      (Some(id), Some(secret)) => {
        loader = loader.credentials_provider(Credentials::new(
          id.clone(),
          secret.clone(),
          None,
          None,
          "postgresql-operator",
        ));
      }
      _ => {
        if let Some(profile) = &credentials.profile {
          loader = loader.profile_name(profile);
        }
      }
    }
    AwsPolicyStore::new(Client::new(&loader.load().await))
  }

  async fn managed(&self, policy: &Policy) -> Result<ManagedPolicy, IamError> {
    let name = policy.policy_name().unwrap_or_default().to_string();
    let arn = policy
      .arn()
      .ok_or_else(|| IamError::Incomplete(name.clone(), "arn"))?
      .to_string();
    let version_id = policy
      .default_version_id()
      .ok_or_else(|| IamError::Incomplete(name.clone(), "default version"))?
      .to_string();

    let out = self
      .client
      .get_policy_version()
      .policy_arn(&arn)
      .version_id(&version_id)
      .send()
      .await
      .map_err(sdk)?;
    let document = out
      .policy_version()
      .and_then(|v| v.document())
      .ok_or_else(|| IamError::Incomplete(name.clone(), "document"))?;

    Ok(ManagedPolicy {
      document: decode(&name, document)?,
      name,
      arn,
      version_id,
    })
  }
}

#[async_trait]
impl IamPolicyStore for AwsPolicyStore {
  async fn list_policies(&self, path_prefix: &str) -> Result<Vec<ManagedPolicy>, IamError> {
    let mut policies = Vec::new();
    let mut marker: Option<String> = None;
    loop {
      let out = self
        .client
        .list_policies()
        .scope(PolicyScopeType::Local)
        .path_prefix(path_prefix)
        .set_marker(marker.take())
        .send()
        .await
        .map_err(sdk)?;
      for policy in out.policies() {
        policies.push(self.managed(policy).await?);
      }
      match out.marker() {
        Some(next) => marker = Some(next.to_string()),
        None => break,
      }
    }
    debug!("Listed {} policies under {}", policies.len(), path_prefix);
    Ok(policies)
  }

  async fn create_policy(&self, name: &str, path: &str, document: &PolicyDocument) -> Result<ManagedPolicy, IamError> {
    let out = self
      .client
      .create_policy()
      .policy_name(name)
      .path(path)
      .policy_document(encode(name, document)?)
      .send()
      .await
      .map_err(sdk)?;
    let policy = out
      .policy()
      .ok_or_else(|| IamError::Incomplete(name.to_string(), "policy"))?;

    Ok(ManagedPolicy {
      name: name.to_string(),
      arn: policy
        .arn()
        .ok_or_else(|| IamError::Incomplete(name.to_string(), "arn"))?
        .to_string(),
      version_id: policy.default_version_id().unwrap_or("v1").to_string(),
      document: document.clone(),
    })
  }

  async fn create_policy_version(&self, arn: &str, document: &PolicyDocument) -> Result<String, IamError> {
    let out = self
      .client
      .create_policy_version()
      .policy_arn(arn)
      .policy_document(encode(arn, document)?)
      .set_as_default(true)
      .send()
      .await
      .map_err(sdk)?;
    out
      .policy_version()
      .and_then(|v| v.version_id())
      .map(str::to_string)
      .ok_or_else(|| IamError::Incomplete(arn.to_string(), "version id"))
  }

  async fn delete_policy_version(&self, arn: &str, version_id: &str) -> Result<(), IamError> {
    self
      .client
      .delete_policy_version()
      .policy_arn(arn)
      .version_id(version_id)
      .send()
      .await
      .map_err(sdk)?;
    Ok(())
  }

  async fn attached_roles(&self, arn: &str) -> Result<Vec<String>, IamError> {
    let mut roles = Vec::new();
    let mut marker: Option<String> = None;
    loop {
      let out = self
        .client
        .list_entities_for_policy()
        .policy_arn(arn)
        .entity_filter(EntityType::Role)
        .set_marker(marker.take())
        .send()
        .await
        .map_err(sdk)?;
      roles.extend(out.policy_roles().iter().filter_map(|r| r.role_name()).map(str::to_string));
      match out.marker() {
        Some(next) if out.is_truncated() => marker = Some(next.to_string()),
        _ => break,
      }
    }
    Ok(roles)
  }

  async fn attach_role_policy(&self, role: &str, arn: &str) -> Result<(), IamError> {
    self
      .client
      .attach_role_policy()
      .role_name(role)
      .policy_arn(arn)
      .send()
      .await
      .map_err(sdk)?;
    Ok(())
  }

  async fn detach_role_policy(&self, role: &str, arn: &str) -> Result<(), IamError> {
    self
      .client
      .detach_role_policy()
      .role_name(role)
      .policy_arn(arn)
      .send()
      .await
      .map_err(sdk)?;
    Ok(())
  }

  async fn delete_policy(&self, arn: &str) -> Result<(), IamError> {
    self.client.delete_policy().policy_arn(arn).send().await.map_err(sdk)?;
    Ok(())
  }
}
