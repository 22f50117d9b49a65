pub mod config;
pub mod crd;
pub mod error;
pub mod grants;
pub mod hosts;
pub mod iam;
pub mod postgres;
pub mod reconcile;
pub mod reference;
pub mod resync;

#[cfg(test)]
pub(crate) mod testing;

pub use crd::*;
pub use error::{Error, ErrorKind, Result};
