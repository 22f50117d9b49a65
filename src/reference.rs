use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::{Api, Client};
use thiserror::Error;

use crate::crd::ResourceVar;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReferenceError {
  #[error("no value")]
  NoValue,
  #[error("{kind} {namespace}/{name} not found")]
  NotFound {
    kind: &'static str,
    namespace: String,
    name: String,
  },
  #[error("key {key} not found in {kind} {namespace}/{name}")]
  UnknownKey {
    kind: &'static str,
    namespace: String,
    name: String,
    key: String,
  },
  #[error("read {kind} {namespace}/{name}: {message}")]
  Transient {
    kind: &'static str,
    namespace: String,
    name: String,
    message: String,
  },
}

/// Turns a [`ResourceVar`] into its plaintext value
#[async_trait]
pub trait Resolver: Send + Sync {
  async fn resolve(&self, reference: &ResourceVar, namespace: &str) -> Result<String, ReferenceError>;
}

/// Resolves references against Secrets and ConfigMaps in the cluster
#[derive(Clone)]
pub struct KubeResolver {
  client: Client,
}

impl KubeResolver {
  pub fn new(client: Client) -> Self {
    KubeResolver { client }
  }

  async fn secret(&self, namespace: &str, name: &str, key: &str) -> Result<String, ReferenceError> {
    let api = Api::<Secret>::namespaced(self.client.clone(), namespace);
    let secret = api
      .get_opt(name)
      .await
      .map_err(|e| api_failure("secret", namespace, name, e))?;
    secret_value(secret, namespace, name, key)
  }

  async fn config_map(&self, namespace: &str, name: &str, key: &str) -> Result<String, ReferenceError> {
    let api = Api::<ConfigMap>::namespaced(self.client.clone(), namespace);
    let cm = api
      .get_opt(name)
      .await
      .map_err(|e| api_failure("configmap", namespace, name, e))?;
    config_map_value(cm, namespace, name, key)
  }
}

/// Where the value of a reference comes from
#[derive(Debug, PartialEq, Eq)]
pub enum Lookup<'a> {
  Inline(&'a str),
  Secret { name: &'a str, key: &'a str },
  ConfigMap { name: &'a str, key: &'a str },
}

/// An inline value wins over `valueFrom`; neither is [`ReferenceError::NoValue`]
pub fn lookup(reference: &ResourceVar) -> Result<Lookup<'_>, ReferenceError> {
  if !reference.value.is_empty() {
    return Ok(Lookup::Inline(&reference.value));
  }
  let source = reference.value_from.as_ref().ok_or(ReferenceError::NoValue)?;
  if let Some(sel) = &source.secret_key_ref {
    return Ok(Lookup::Secret {
      name: &sel.name,
      key: &sel.key,
    });
  }
  if let Some(sel) = &source.config_map_key_ref {
    return Ok(Lookup::ConfigMap {
      name: &sel.name,
      key: &sel.key,
    });
  }
  Err(ReferenceError::NoValue)
}

pub fn secret_value(secret: Option<Secret>, namespace: &str, name: &str, key: &str) -> Result<String, ReferenceError> {
  let secret = secret.ok_or_else(|| not_found("secret", namespace, name))?;
  let bytes = secret
    .data
    .as_ref()
    .and_then(|data| data.get(key))
    .ok_or_else(|| unknown_key("secret", namespace, name, key))?;

  String::from_utf8(bytes.0.clone())
    .map_err(|e| transient("secret", namespace, name, format!("key {}: {}", key, e)))
}

pub fn config_map_value(cm: Option<ConfigMap>, namespace: &str, name: &str, key: &str) -> Result<String, ReferenceError> {
  cm.ok_or_else(|| not_found("configmap", namespace, name))?
    .data
    .as_ref()
    .and_then(|data| data.get(key))
    .cloned()
    .ok_or_else(|| unknown_key("configmap", namespace, name, key))
}

#[async_trait]
impl Resolver for KubeResolver {
  async fn resolve(&self, reference: &ResourceVar, namespace: &str) -> Result<String, ReferenceError> {
    match lookup(reference)? {
      Lookup::Inline(value) => Ok(value.to_string()),
      Lookup::Secret { name, key } => self.secret(namespace, name, key).await,
      Lookup::ConfigMap { name, key } => self.config_map(namespace, name, key).await,
    }
  }
}

fn api_failure(kind: &'static str, namespace: &str, name: &str, err: kube::Error) -> ReferenceError {
  transient(kind, namespace, name, err.to_string())
}

fn not_found(kind: &'static str, namespace: &str, name: &str) -> ReferenceError {
  ReferenceError::NotFound {
    kind,
    namespace: namespace.to_string(),
    name: name.to_string(),
  }
}

fn transient(kind: &'static str, namespace: &str, name: &str, message: String) -> ReferenceError {
  ReferenceError::Transient {
    kind,
    namespace: namespace.to_string(),
    name: name.to_string(),
    message,
  }
}

fn unknown_key(kind: &'static str, namespace: &str, name: &str, key: &str) -> ReferenceError {
  ReferenceError::UnknownKey {
    kind,
    namespace: namespace.to_string(),
    name: name.to_string(),
    key: key.to_string(),
  }
}
