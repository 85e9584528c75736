use std::fmt::Debug;

use futures_util::future::BoxFuture;

use crate::error::FetchError;
use crate::models::EntityId;

/// Fetches the authoritative state of one entity.
///
/// The returned future is `'static` so callers can spawn it or wrap it in a
/// timeout without borrowing the fetcher.
pub trait EntityFetcher: Send + Sync + 'static {
    /// The fetched record.
    type Payload: Clone + PartialEq + Debug + Send + Sync + 'static;

    /// Fetches `entity_id`.
    fn fetch(&self, entity_id: &EntityId) -> BoxFuture<'static, Result<Self::Payload, FetchError>>;
}
