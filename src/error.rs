use thiserror::Error;

use crate::{iam::IamError, postgres::SqlError, reference::ReferenceError};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// How a failed reconcile should be treated by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorKind {
  /// The resource must change before another attempt can succeed
  Invalid,
  /// A dependency may show up shortly
  Transient,
  /// SQL, IAM or Kubernetes API failure
  Operational,
}

#[derive(Debug, Error)]
pub enum Error {
  #[error("{0}")]
  Invalid(String),
  #[error("resolve {field} reference: {source}")]
  Reference {
    field: String,
    #[source]
    source: ReferenceError,
  },
  #[error(transparent)]
  Sql(#[from] SqlError),
  #[error(transparent)]
  Iam(#[from] IamError),
  #[error("kube api: {0}")]
  Kube(#[from] kube::Error),
  #[error("{}", join(.0))]
  Multiple(Vec<Error>),
}

fn join(errors: &[Error]) -> String {
  errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

impl Error {
  pub fn invalid(message: impl Into<String>) -> Self {
    Error::Invalid(message.into())
  }

  pub fn reference(field: impl Into<String>, source: ReferenceError) -> Self {
    Error::Reference {
      field: field.into(),
      source,
    }
  }

  pub fn kind(&self) -> ErrorKind {
    match self {
      Error::Invalid(_) => ErrorKind::Invalid,
      Error::Reference { source, .. } => match source {
        ReferenceError::NoValue => ErrorKind::Invalid,
        _ => ErrorKind::Transient,
      },
      Error::Sql(SqlError::InvalidIdentifier(_)) | Error::Sql(SqlError::InvalidHost(_)) => ErrorKind::Invalid,
      Error::Sql(_) | Error::Iam(_) | Error::Kube(_) => ErrorKind::Operational,
      // the most retryable kind wins so a single bad field never stops retries for the rest
      Error::Multiple(errors) => errors.iter().map(Error::kind).max().unwrap_or(ErrorKind::Invalid),
    }
  }

  /// Folds a list of errors into one, `None` when the list is empty
  pub fn combine(mut errors: Vec<Error>) -> Option<Error> {
    match errors.len() {
      0 => None,
      1 => errors.pop(),
      _ => Some(Error::Multiple(
        errors
          .into_iter()
          .flat_map(|e| match e {
            Error::Multiple(inner) => inner,
            e => vec![e],
          })
          .collect(),
      )),
    }
  }
}
