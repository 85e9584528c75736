use serde_json::Value;

use super::entity::EntityId;

/// Hub method invoked by the backend when an order's assignment changes.
pub const ASSIGN_ORDER: &str = "AssignOrder";

/// Parsed `AssignOrder(orderId, isAssigned?)` arguments.
///
/// Older backends only send the order id; the flag is then `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignOrderEvent {
    /// The order the event is about.
    pub order_id: EntityId,
    /// Assignment state carried by the push, when the backend sends it.
    pub is_assigned: Option<bool>,
}

impl AssignOrderEvent {
    /// Parses invocation arguments. Returns `None` without a usable order id.
    pub fn from_args(args: &[Value]) -> Option<Self> {
        let order_id = args.first().and_then(EntityId::from_json)?;
        let is_assigned = args.get(1).and_then(Value::as_bool);
        Some(Self {
            order_id,
            is_assigned,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_id_only_and_id_with_flag() {
        let bare = AssignOrderEvent::from_args(&[json!(42)]).unwrap();
        assert_eq!(bare.order_id.as_str(), "42");
        assert_eq!(bare.is_assigned, None);

        let full = AssignOrderEvent::from_args(&[json!("42"), json!(true)]).unwrap();
        assert_eq!(full.order_id, bare.order_id);
        assert_eq!(full.is_assigned, Some(true));
    }

    #[test]
    fn missing_id_is_rejected() {
        assert!(AssignOrderEvent::from_args(&[]).is_none());
        assert!(AssignOrderEvent::from_args(&[json!(null), json!(true)]).is_none());
    }
}
