//! In-memory stand-ins for PostgreSQL, IAM and the Kubernetes API.

use std::{
  collections::{BTreeMap, BTreeSet, HashMap},
  sync::{Arc, Mutex},
};

use async_trait::async_trait;

use crate::{
  crd::{PostgreSQLDatabaseSpec, PostgreSQLHostCredentialsSpec, ResourceVar},
  grants::DatabaseInventory,
  hosts::{HostCredentialsStore, HostSelector},
  iam::{IamError, IamPolicyStore, ManagedPolicy, PolicyDocument, Statement},
  postgres::{AdminCredentials, ConnectionTarget, Connector, Session, SqlError},
  reference::{lookup, Lookup, ReferenceError, Resolver},
  Result,
};

/// Observable catalog state of the fake server
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Catalog {
  roles: BTreeSet<String>,
  /// member -> roles it belongs to
  memberships: BTreeMap<String, BTreeSet<String>>,
  /// database -> owner
  databases: BTreeMap<String, String>,
  /// (database, schema) -> owner
  schemas: BTreeMap<(String, String), String>,
  extensions: BTreeSet<String>,
}

#[derive(Default)]
struct State {
  catalog: Catalog,
  statements: Vec<String>,
  connections: Vec<String>,
  failures: Vec<(String, String)>,
  reject_circular: bool,
}

/// A PostgreSQL server understanding just enough DDL to track roles,
/// memberships, databases, schemas and extensions
#[derive(Clone, Default)]
pub struct FakeCluster {
  state: Arc<Mutex<State>>,
}

impl FakeCluster {
  pub fn connector(&self) -> FakeConnector {
    FakeConnector { cluster: self.clone() }
  }

  pub fn session(&self, user: &str, database: &str) -> FakeSession {
    FakeSession {
      cluster: self.clone(),
      user: user.to_string(),
      database: database.to_string(),
    }
  }

  pub fn fail_on(&self, prefix: &str, code: &str) {
    self.state.lock().unwrap().failures.push((prefix.to_string(), code.to_string()));
  }

  pub fn reject_circular_grants(&self) {
    self.state.lock().unwrap().reject_circular = true;
  }

  pub fn add_role(&self, role: &str) {
    self.state.lock().unwrap().catalog.roles.insert(role.to_string());
  }

  pub fn add_membership(&self, member: &str, role: &str) {
    let mut state = self.state.lock().unwrap();
    state
      .catalog
      .memberships
      .entry(member.to_string())
      .or_default()
      .insert(role.to_string());
  }

  pub fn add_database(&self, name: &str, owner: &str) {
    let mut state = self.state.lock().unwrap();
    state.catalog.databases.insert(name.to_string(), owner.to_string());
  }

  pub fn add_extension(&self, name: &str) {
    self.state.lock().unwrap().catalog.extensions.insert(name.to_string());
  }

  pub fn has_role(&self, role: &str) -> bool {
    self.state.lock().unwrap().catalog.roles.contains(role)
  }

  pub fn memberships(&self, member: &str) -> Vec<String> {
    let state = self.state.lock().unwrap();
    state
      .catalog
      .memberships
      .get(member)
      .map(|roles| roles.iter().cloned().collect())
      .unwrap_or_default()
  }

  pub fn database_owner(&self, database: &str) -> Option<String> {
    self.state.lock().unwrap().catalog.databases.get(database).cloned()
  }

  pub fn schema_owner(&self, database: &str, schema: &str) -> Option<String> {
    let state = self.state.lock().unwrap();
    state
      .catalog
      .schemas
      .get(&(database.to_string(), schema.to_string()))
      .cloned()
  }

  pub fn statements(&self) -> Vec<String> {
    self.state.lock().unwrap().statements.clone()
  }

  pub fn connections(&self) -> Vec<String> {
    self.state.lock().unwrap().connections.clone()
  }

  pub fn snapshot(&self) -> Catalog {
    self.state.lock().unwrap().catalog.clone()
  }
}

fn db_error(code: &str, message: String) -> SqlError {
  SqlError::Database {
    code: code.to_string(),
    message,
  }
}

fn names(list: &str) -> Vec<String> {
  list.split(',').map(|r| r.trim().to_string()).collect()
}

pub struct FakeSession {
  cluster: FakeCluster,
  user: String,
  database: String,
}

#[async_trait]
impl Session for FakeSession {
  async fn execute(&mut self, statement: &str) -> Result<(), SqlError> {
    let mut guard = self.cluster.state.lock().unwrap();
    let state = &mut *guard;
    state.statements.push(statement.to_string());
    if let Some((_, code)) = state.failures.iter().find(|(p, _)| statement.starts_with(p.as_str())) {
      return Err(db_error(code, format!("{} failed", statement)));
    }
    let reject_circular = state.reject_circular;
    let catalog = &mut state.catalog;
    let words: Vec<&str> = statement.split_whitespace().collect();

    match words.as_slice() {
      ["CREATE", "ROLE", name, ..] => {
        if !catalog.roles.insert(name.to_string()) {
          return Err(db_error("42710", format!("role \"{}\" already exists", name)));
        }
        if let Some((_, roles)) = statement.split_once(" IN ROLE ") {
          for role in names(roles) {
            catalog.memberships.entry(name.to_string()).or_default().insert(role);
          }
        }
      }
      ["CREATE", "DATABASE", name] => {
        if catalog.databases.contains_key(*name) {
          return Err(db_error("42P04", format!("database \"{}\" already exists", name)));
        }
        catalog.databases.insert(name.to_string(), self.user.clone());
      }
      ["ALTER", "DATABASE", name, "OWNER", "TO", owner] => {
        catalog.databases.insert(name.to_string(), owner.to_string());
      }
      ["CREATE", "SCHEMA", name] => {
        let key = (self.database.clone(), name.to_string());
        if catalog.schemas.contains_key(&key) {
          return Err(db_error("42P06", format!("schema \"{}\" already exists", name)));
        }
        catalog.schemas.insert(key, self.user.clone());
      }
      ["CREATE", "EXTENSION", "IF", "NOT", "EXISTS", name, ..] => {
        catalog.extensions.insert(name.to_string());
      }
      ["GRANT", ..] if !statement.contains(" ON ") => {
        let (roles, member) = statement["GRANT ".len()..]
          .split_once(" TO ")
          .ok_or_else(|| db_error("42601", statement.to_string()))?;
        for role in names(roles) {
          if role == member {
            return Err(db_error("0LP01", format!("role \"{}\" is a member of role \"{}\"", member, role)));
          }
          let circular = catalog
            .memberships
            .get(&role)
            .map_or(false, |of| of.contains(member));
          if circular && reject_circular {
            return Err(db_error("0LP01", format!("role \"{}\" is a member of role \"{}\"", member, role)));
          }
          catalog.memberships.entry(member.to_string()).or_default().insert(role);
        }
      }
      ["REVOKE", role, "FROM", member] if !statement.contains(" ON ") => {
        if let Some(roles) = catalog.memberships.get_mut(*member) {
          roles.remove(*role);
        }
      }
      _ => {}
    }
    Ok(())
  }

  async fn query_names(&mut self, query: &str, params: &[&str]) -> Result<Vec<String>, SqlError> {
    let state = self.cluster.state.lock().unwrap();
    let catalog = &state.catalog;
    let rows = if query.contains("pg_auth_members") {
      catalog
        .memberships
        .get(params[0])
        .map(|roles| roles.iter().cloned().collect())
        .unwrap_or_default()
    } else if query.contains("pg_extension") {
      catalog.extensions.iter().cloned().collect()
    } else if query.contains("pg_database") {
      catalog.databases.get(params[0]).cloned().into_iter().collect()
    } else {
      Vec::new()
    };
    Ok(rows)
  }

  async fn close(self: Box<Self>) -> Result<(), SqlError> {
    Ok(())
  }
}

pub struct FakeConnector {
  cluster: FakeCluster,
}

#[async_trait]
impl Connector for FakeConnector {
  async fn connect(&self, target: &ConnectionTarget) -> Result<Box<dyn Session>, SqlError> {
    self.cluster.state.lock().unwrap().connections.push(target.to_string());
    Ok(Box::new(self.cluster.session(&target.user, &target.database)))
  }
}

/// Inline values plus Secret/ConfigMap keys keyed by `(namespace, name, key)`
#[derive(Default)]
pub struct FakeResolver {
  secrets: HashMap<(String, String, String), String>,
  config_maps: HashMap<(String, String, String), String>,
}

impl FakeResolver {
  pub fn with_secret(mut self, namespace: &str, name: &str, key: &str, value: &str) -> Self {
    self
      .secrets
      .insert((namespace.into(), name.into(), key.into()), value.into());
    self
  }

  pub fn with_config_map(mut self, namespace: &str, name: &str, key: &str, value: &str) -> Self {
    self
      .config_maps
      .insert((namespace.into(), name.into(), key.into()), value.into());
    self
  }

  fn lookup(
    values: &HashMap<(String, String, String), String>,
    kind: &'static str,
    namespace: &str,
    name: &str,
    key: &str,
  ) -> Result<String, ReferenceError> {
    if let Some(value) = values.get(&(namespace.into(), name.into(), key.into())) {
      return Ok(value.clone());
    }
    if values.keys().any(|(ns, n, _)| ns == namespace && n == name) {
      return Err(ReferenceError::UnknownKey {
        kind,
        namespace: namespace.into(),
        name: name.into(),
        key: key.into(),
      });
    }
    Err(ReferenceError::NotFound {
      kind,
      namespace: namespace.into(),
      name: name.into(),
    })
  }
}

#[async_trait]
impl Resolver for FakeResolver {
  async fn resolve(&self, reference: &ResourceVar, namespace: &str) -> Result<String, ReferenceError> {
    match lookup(reference)? {
      Lookup::Inline(value) => Ok(value.to_string()),
      Lookup::Secret { name, key } => Self::lookup(&self.secrets, "secret", namespace, name, key),
      Lookup::ConfigMap { name, key } => Self::lookup(&self.config_maps, "configmap", namespace, name, key),
    }
  }
}

/// A resolver whose secrets can be created while a test runs
#[derive(Clone, Default)]
pub struct SharedResolver {
  inner: Arc<Mutex<FakeResolver>>,
}

impl SharedResolver {
  pub fn add_secret(&self, namespace: &str, name: &str, key: &str, value: &str) {
    let mut inner = self.inner.lock().unwrap();
    let resolver = std::mem::take(&mut *inner);
    *inner = resolver.with_secret(namespace, name, key, value);
  }
}

#[async_trait]
impl Resolver for SharedResolver {
  async fn resolve(&self, reference: &ResourceVar, namespace: &str) -> Result<String, ReferenceError> {
    let (secrets, config_maps) = {
      let inner = self.inner.lock().unwrap();
      (inner.secrets.clone(), inner.config_maps.clone())
    };
    FakeResolver { secrets, config_maps }.resolve(reference, namespace).await
  }
}

#[derive(Default)]
pub struct FakeHostCredentialsStore {
  items: HashMap<(String, String), PostgreSQLHostCredentialsSpec>,
}

impl FakeHostCredentialsStore {
  pub fn with(mut self, namespace: &str, name: &str, spec: PostgreSQLHostCredentialsSpec) -> Self {
    self.items.insert((namespace.into(), name.into()), spec);
    self
  }
}

#[async_trait]
impl HostCredentialsStore for FakeHostCredentialsStore {
  async fn get(&self, namespace: &str, name: &str) -> Result<Option<PostgreSQLHostCredentialsSpec>> {
    Ok(self.items.get(&(namespace.into(), name.into())).cloned())
  }
}

#[derive(Default)]
pub struct FakeInventory {
  items: Vec<(String, PostgreSQLDatabaseSpec)>,
}

impl FakeInventory {
  pub fn with(mut self, namespace: &str, spec: PostgreSQLDatabaseSpec) -> Self {
    self.items.push((namespace.into(), spec));
    self
  }
}

#[async_trait]
impl DatabaseInventory for FakeInventory {
  async fn list(&self, namespace: &str) -> Result<Vec<PostgreSQLDatabaseSpec>> {
    Ok(
      self
        .items
        .iter()
        .filter(|(ns, _)| ns == namespace)
        .map(|(_, spec)| spec.clone())
        .collect(),
    )
  }
}

pub fn selector(
  credentials: &[(&str, AdminCredentials)],
  resolver: impl Resolver + 'static,
  store: FakeHostCredentialsStore,
) -> HostSelector {
  HostSelector::new(
    Arc::new(
      credentials
        .iter()
        .map(|(host, creds)| (host.to_string(), creds.clone()))
        .collect(),
    ),
    Arc::new(store),
    Arc::new(resolver),
  )
}

const MAX_VERSIONS: usize = 5;

struct StoredPolicy {
  name: String,
  versions: Vec<(String, PolicyDocument)>,
  default_version: String,
  next_version: usize,
  attached: BTreeSet<String>,
}

#[derive(Default)]
struct IamState {
  policies: BTreeMap<String, StoredPolicy>,
  mutations: usize,
  /// operations failing once with a service error
  failures: Vec<String>,
  /// detaches finding their attachment already gone
  raced_detaches: usize,
}

impl IamState {
  fn check(&mut self, operation: &str) -> Result<(), IamError> {
    match self.failures.iter().position(|op| op == operation) {
      Some(i) => {
        self.failures.remove(i);
        Err(IamError::Aws(Box::new(aws_sdk_iam::Error::ServiceFailureException(
          aws_sdk_iam::types::error::ServiceFailureException::builder()
            .message(format!("{} failed", operation))
            .build(),
        ))))
      }
      None => Ok(()),
    }
  }
}

/// IAM policies held in memory, enforcing the five version limit and
/// detach-before-delete
#[derive(Default)]
pub struct MemoryPolicyStore {
  state: Mutex<IamState>,
}

impl MemoryPolicyStore {
  fn arn(name: &str) -> String {
    format!("arn:aws:iam::123456789012:policy/{}", name)
  }

  /// Default document of every policy by name
  pub fn documents(&self) -> BTreeMap<String, PolicyDocument> {
    let state = self.state.lock().unwrap();
    state
      .policies
      .values()
      .map(|p| {
        let doc = p
          .versions
          .iter()
          .find(|(id, _)| id == &p.default_version)
          .map(|(_, d)| d.clone())
          .unwrap_or_default();
        (p.name.clone(), doc)
      })
      .collect()
  }

  pub fn attached(&self, name: &str) -> Vec<String> {
    let state = self.state.lock().unwrap();
    state
      .policies
      .get(&Self::arn(name))
      .map(|p| p.attached.iter().cloned().collect())
      .unwrap_or_default()
  }

  pub fn version_count(&self, name: &str) -> usize {
    let state = self.state.lock().unwrap();
    state.policies.get(&Self::arn(name)).map_or(0, |p| p.versions.len())
  }

  pub fn mutations(&self) -> usize {
    self.state.lock().unwrap().mutations
  }

  /// The next call of `operation` fails with a service error
  pub fn fail_next(&self, operation: &str) {
    self.state.lock().unwrap().failures.push(operation.to_string());
  }

  /// The next detach finds the role detached by someone else
  pub fn race_next_detach(&self) {
    self.state.lock().unwrap().raced_detaches += 1;
  }

  /// Appends to the default version without going through the versioning calls
  pub fn push_statement(&self, name: &str, statement: Statement) {
    let mut state = self.state.lock().unwrap();
    let policy = state.policies.get_mut(&Self::arn(name)).expect("policy exists");
    let default = policy.default_version.clone();
    let (_, document) = policy
      .versions
      .iter_mut()
      .find(|(id, _)| *id == default)
      .expect("default version exists");
    document.statement.push(statement);
  }
}

#[async_trait]
impl IamPolicyStore for MemoryPolicyStore {
  async fn list_policies(&self, _path_prefix: &str) -> Result<Vec<ManagedPolicy>, IamError> {
    let state = self.state.lock().unwrap();
    Ok(
      state
        .policies
        .iter()
        .map(|(arn, p)| ManagedPolicy {
          name: p.name.clone(),
          arn: arn.clone(),
          version_id: p.default_version.clone(),
          document: p
            .versions
            .iter()
            .find(|(id, _)| id == &p.default_version)
            .map(|(_, d)| d.clone())
            .unwrap_or_default(),
        })
        .collect(),
    )
  }

  async fn create_policy(&self, name: &str, _path: &str, document: &PolicyDocument) -> Result<ManagedPolicy, IamError> {
    let mut state = self.state.lock().unwrap();
    state.mutations += 1;
    let arn = Self::arn(name);
    assert!(!state.policies.contains_key(&arn), "policy {} already exists", name);
    state.policies.insert(
      arn.clone(),
      StoredPolicy {
        name: name.to_string(),
        versions: vec![("v1".to_string(), document.clone())],
        default_version: "v1".to_string(),
        next_version: 2,
        attached: BTreeSet::new(),
      },
    );
    Ok(ManagedPolicy {
      name: name.to_string(),
      arn,
      version_id: "v1".to_string(),
      document: document.clone(),
    })
  }

  async fn create_policy_version(&self, arn: &str, document: &PolicyDocument) -> Result<String, IamError> {
    let mut state = self.state.lock().unwrap();
    state.mutations += 1;
    let policy = state.policies.get_mut(arn).expect("policy exists");
    assert!(policy.versions.len() < MAX_VERSIONS, "version limit exceeded on {}", arn);
    let id = format!("v{}", policy.next_version);
    policy.next_version += 1;
    policy.versions.push((id.clone(), document.clone()));
    policy.default_version = id.clone();
    Ok(id)
  }

  async fn delete_policy_version(&self, arn: &str, version_id: &str) -> Result<(), IamError> {
    let mut state = self.state.lock().unwrap();
    state.mutations += 1;
    let policy = state.policies.get_mut(arn).expect("policy exists");
    assert_ne!(policy.default_version, version_id, "default version can not be deleted");
    policy.versions.retain(|(id, _)| id != version_id);
    Ok(())
  }

  async fn attached_roles(&self, arn: &str) -> Result<Vec<String>, IamError> {
    let state = self.state.lock().unwrap();
    Ok(
      state
        .policies
        .get(arn)
        .map(|p| p.attached.iter().cloned().collect())
        .unwrap_or_default(),
    )
  }

  async fn attach_role_policy(&self, role: &str, arn: &str) -> Result<(), IamError> {
    let mut state = self.state.lock().unwrap();
    state.check("attach_role_policy")?;
    state.mutations += 1;
    state
      .policies
      .get_mut(arn)
      .expect("policy exists")
      .attached
      .insert(role.to_string());
    Ok(())
  }

  async fn detach_role_policy(&self, role: &str, arn: &str) -> Result<(), IamError> {
    let mut state = self.state.lock().unwrap();
    state.check("detach_role_policy")?;
    let policy = state.policies.get_mut(arn).expect("policy exists");
    let removed = policy.attached.remove(role);
    if state.raced_detaches > 0 {
      state.raced_detaches -= 1;
      return Err(IamError::NoSuchEntity(format!("role {} is not attached", role)));
    }
    state.mutations += 1;
    if removed {
      Ok(())
    } else {
      Err(IamError::NoSuchEntity(format!("role {} is not attached", role)))
    }
  }

  async fn delete_policy(&self, arn: &str) -> Result<(), IamError> {
    let mut state = self.state.lock().unwrap();
    state.mutations += 1;
    let policy = state.policies.remove(arn).expect("policy exists");
    assert!(policy.attached.is_empty(), "policy {} is still attached", policy.name);
    Ok(())
  }
}
