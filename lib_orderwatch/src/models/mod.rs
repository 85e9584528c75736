//! # Domain Models
//!
//! - **`entity`**: `EntityId` (opaque subject id) and `FetchStamp` (fetch issue
//!   order used by the reconciler's stale-write check).
//! - **`order`**: the order record returned by `GetOrderById`.
//! - **`event`**: the `AssignOrder` hub event payload.

/// Entity identifiers and fetch stamps.
pub mod entity;
/// Hub event payloads.
pub mod event;
/// The order record.
pub mod order;

pub use entity::{EntityId, FetchStamp};
pub use event::{AssignOrderEvent, ASSIGN_ORDER};
pub use order::{Customer, DeliveryPerson, Order, OrderItem, OrderStatus};
