pub mod postgres;
pub mod providers;

pub use providers::{BundleProvider, DataItemProvider};

/// The full persistent state store (C1): every data item and bundle table,
/// behind the two provider traits. Implemented for Postgres
/// ([`postgres::PgStateStore`]); worker tests substitute
/// [`crate::test_support::fakes::InMemoryStateStore`], an in-memory fake
/// implementing the same two traits.
pub trait StateStore: DataItemProvider + BundleProvider {}
impl<T: DataItemProvider + BundleProvider> StateStore for T {}
