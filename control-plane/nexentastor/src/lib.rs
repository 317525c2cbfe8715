//! The NexentaStor appliance as seen by the CSI driver.
//!
//! The driver only talks to an appliance through the [`Provider`] trait, which is implemented
//! by the [`rest::RestProvider`] for real appliances and, with the `mock` feature, by an
//! in-memory appliance used in tests.

pub mod error;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
mod provider;
pub mod resolver;
pub mod rest;
pub mod types;

pub use error::NefError;
pub use provider::Provider;
pub use resolver::{Connector, Resolver, ResolverArgs, RestConnector};
pub use types::*;
