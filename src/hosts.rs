use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use kube::{Api, Client};

use crate::{
  crd::{PostgreSQLHostCredentials, PostgreSQLHostCredentialsSpec, ResourceVar},
  postgres::AdminCredentials,
  reference::{ReferenceError, Resolver},
  Error, Result,
};

/// Admin credentials per `hostname:port`, fixed at startup
pub type HostCredentials = HashMap<String, AdminCredentials>;

/// Source of PostgreSQLHostCredentials resources
#[async_trait]
pub trait HostCredentialsStore: Send + Sync {
  async fn get(&self, namespace: &str, name: &str) -> Result<Option<PostgreSQLHostCredentialsSpec>>;
}

pub struct KubeHostCredentialsStore {
  client: Client,
}

impl KubeHostCredentialsStore {
  pub fn new(client: Client) -> Self {
    KubeHostCredentialsStore { client }
  }
}

#[async_trait]
impl HostCredentialsStore for KubeHostCredentialsStore {
  async fn get(&self, namespace: &str, name: &str) -> Result<Option<PostgreSQLHostCredentialsSpec>> {
    let api = Api::<PostgreSQLHostCredentials>::namespaced(self.client.clone(), namespace);
    Ok(api.get_opt(name).await?.map(|hc| hc.spec))
  }
}

/// Picks the host and admin login for a resource naming either a host or a
/// PostgreSQLHostCredentials resource
#[derive(Clone)]
pub struct HostSelector {
  credentials: Arc<HostCredentials>,
  store: Arc<dyn HostCredentialsStore>,
  resolver: Arc<dyn Resolver>,
}

enum Source<'a> {
  Host(&'a ResourceVar),
  Credentials(&'a str),
}

impl HostSelector {
  pub fn new(
    credentials: Arc<HostCredentials>,
    store: Arc<dyn HostCredentialsStore>,
    resolver: Arc<dyn Resolver>,
  ) -> Self {
    HostSelector {
      credentials,
      store,
      resolver,
    }
  }

  pub fn resolver(&self) -> &Arc<dyn Resolver> {
    &self.resolver
  }

  pub fn credentials(&self) -> &HostCredentials {
    &self.credentials
  }

  fn source<'a>(host: Option<&'a ResourceVar>, host_credentials: Option<&'a str>) -> Result<Source<'a>> {
    let host = host.filter(|h| !h.is_empty());
    let host_credentials = host_credentials.filter(|n| !n.is_empty());
    match (host, host_credentials) {
      (Some(host), None) => Ok(Source::Host(host)),
      (None, Some(name)) => Ok(Source::Credentials(name)),
      _ => Err(Error::invalid("must specify exactly one of host and hostCredentials")),
    }
  }

  /// Returns `(host, admin credentials)`
  pub async fn select(
    &self,
    namespace: &str,
    host: Option<&ResourceVar>,
    host_credentials: Option<&str>,
  ) -> Result<(String, AdminCredentials)> {
    match Self::source(host, host_credentials)? {
      Source::Host(host) => {
        let host = self.resolve(namespace, "host", host).await?;
        let admin = self.admin_for(&host)?;
        Ok((host, admin))
      }
      Source::Credentials(name) => {
        let spec = self.fetch(namespace, name).await?;
        let host = self.resolve(namespace, "host", &spec.host).await?;
        let user = self.resolve(namespace, "user", &spec.user).await?;
        let password = self.resolve(namespace, "password", &spec.password).await?;
        let params = match &spec.params {
          Some(params) => match self.resolver.resolve(params, namespace).await {
            Err(ReferenceError::NoValue) => String::new(),
            res => res.map_err(|e| Error::reference("params", e))?,
          },
          None => String::new(),
        };
        Ok((host, AdminCredentials { user, password, params }))
      }
    }
  }

  /// Resolves only the host, without requiring admin credentials for it
  pub async fn resolve_host(
    &self,
    namespace: &str,
    host: Option<&ResourceVar>,
    host_credentials: Option<&str>,
  ) -> Result<String> {
    match Self::source(host, host_credentials)? {
      Source::Host(host) => self.resolve(namespace, "host", host).await,
      Source::Credentials(name) => {
        let spec = self.fetch(namespace, name).await?;
        self.resolve(namespace, "host", &spec.host).await
      }
    }
  }

  /// Admin credentials configured at startup for `host`
  pub fn admin_for(&self, host: &str) -> Result<AdminCredentials> {
    self
      .credentials
      .get(host)
      .cloned()
      .ok_or_else(|| Error::invalid(format!("unknown credentials for host {}", host)))
  }

  async fn fetch(&self, namespace: &str, name: &str) -> Result<PostgreSQLHostCredentialsSpec> {
    self
      .store
      .get(namespace, name)
      .await?
      .ok_or_else(|| Error::invalid(format!("host credentials {}/{} not found", namespace, name)))
  }

  async fn resolve(&self, namespace: &str, field: &str, reference: &ResourceVar) -> Result<String> {
    self
      .resolver
      .resolve(reference, namespace)
      .await
      .map_err(|e| Error::reference(field, e))
  }
}
