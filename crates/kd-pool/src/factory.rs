//! DispatcherFactory - lifecycle hooks the pool delegates to
//!
//! The pool performs no I/O of its own. Everything that touches the outside
//! world (opening connections, health checks, teardown) lives behind this trait.

use std::fmt;
use std::hash::Hash;

use async_trait::async_trait;

use crate::error::FactoryError;

/// Creates and manages dispatchers for endpoint keys.
///
/// Every dispatcher is bound to the key it was created for; the pool always
/// passes that same key back to the other hooks.
///
/// The key's `Display` output appears in logs, errors, stats and metric
/// labels, so it must not reveal credentials.
#[async_trait]
pub trait DispatcherFactory: Send + Sync + 'static {
    type Key: Eq + Hash + Clone + fmt::Debug + fmt::Display + Send + Sync + 'static;
    type Dispatcher: Send + Sync + 'static;

    /// Build a new dispatcher for `key`
    async fn create(&self, key: &Self::Key) -> Result<Self::Dispatcher, FactoryError>;

    /// Prepare an idle or fresh dispatcher for a borrower.
    /// An error marks the dispatcher invalid; the pool destroys it.
    async fn activate(
        &self,
        _key: &Self::Key,
        _dispatcher: &mut Self::Dispatcher,
    ) -> Result<(), FactoryError> {
        Ok(())
    }

    /// Reset a returned dispatcher before it goes idle
    async fn passivate(
        &self,
        _key: &Self::Key,
        _dispatcher: &mut Self::Dispatcher,
    ) -> Result<(), FactoryError> {
        Ok(())
    }

    /// Release the dispatcher's underlying handles. Errors are logged by the pool.
    async fn destroy(&self, key: &Self::Key, dispatcher: Self::Dispatcher) -> Result<(), FactoryError>;

    /// Whether the dispatcher is still usable
    async fn validate(&self, _key: &Self::Key, _dispatcher: &Self::Dispatcher) -> bool {
        true
    }
}
