use lib_orderwatch::{EntityFetcher, EntityView, Order, WatchHandle};
use tokio_util::sync::CancellationToken;

/// Logs every change of one watched order until the watch closes or
/// `shutdown` fires. Dropping the handle on return closes the watch.
pub async fn present<F>(mut handle: WatchHandle<F>, shutdown: CancellationToken)
where
    F: EntityFetcher<Payload = Order>,
{
    let mut last = handle.view();
    log::info!("{}", describe(&last));

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            next = handle.changed() => match next {
                Some(view) => {
                    if view.payload.is_some() && view.condition_holds != last.condition_holds && !view.condition_holds {
                        log::info!("Order {} no longer needs polling", view.entity_id);
                    }
                    if view.offline && !last.offline {
                        log::warn!("Hub offline, order {} is kept fresh by polling only", view.entity_id);
                    }
                    if view.error.is_some() && view.error != last.error {
                        log::warn!("{}", describe(&view));
                    } else if view.version != last.version || view.payload.is_none() {
                        log::info!("{}", describe(&view));
                    } else {
                        log::debug!("{}", describe(&view));
                    }
                    last = view;
                }
                None => break,
            },
        }
    }
    log::debug!("Stopped presenting order {}", handle.entity_id());
}

/// One-line summary of a view.
pub fn describe(view: &EntityView<Order>) -> String {
    let Some(order) = &view.payload else {
        return match &view.error {
            Some(err) => format!("Order {}: not loaded ({})", view.entity_id, err),
            None => format!("Order {}: loading", view.entity_id),
        };
    };

    let status = order
        .order_status
        .as_ref()
        .and_then(|s| s.name.as_deref())
        .unwrap_or("unknown status");
    let assignment = match (order.is_assigned, order.delivery_name()) {
        (true, Some(name)) => format!("assigned to {}", name),
        (true, None) => "assigned".to_string(),
        (false, _) => "awaiting assignment".to_string(),
    };

    let mut line = format!("Order {} [{}] {} (v{})", view.entity_id, status, assignment, view.version);
    if let Some(total) = order.total_price {
        line.push_str(&format!(", total {:.2}", total));
    }
    if view.is_loading {
        line.push_str(", refreshing");
    }
    if let Some(err) = &view.error {
        line.push_str(&format!(", last refresh failed: {}", err));
    }
    if view.offline {
        line.push_str(", hub offline");
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_orderwatch::{EntityId, FetchError, WatchError};
    use lib_orderwatch::models::{DeliveryPerson, OrderStatus};

    fn view(payload: Option<Order>) -> EntityView<Order> {
        EntityView {
            entity_id: EntityId::from(42u64),
            payload,
            is_loading: false,
            error: None,
            version: 1,
            condition_holds: true,
            offline: false,
        }
    }

    #[test]
    fn describes_unloaded_views() {
        assert_eq!(describe(&view(None)), "Order 42: loading");

        let mut failed = view(None);
        failed.error = Some(WatchError::Fetch(FetchError::NotFound("42".into())));
        assert_eq!(describe(&failed), "Order 42: not loaded (Fetch failed: Entity 42 not found)");
    }

    #[test]
    fn describes_assignment() {
        let order = Order {
            id: 42,
            is_assigned: true,
            total_price: Some(12.5),
            order_status: Some(OrderStatus { id: Some(2), name: Some("Preparing".into()) }),
            delivery: Some(DeliveryPerson {
                id: Some(9),
                first_name: Some("Sam".into()),
                last_name: Some("Reed".into()),
            }),
            ..Default::default()
        };
        assert_eq!(
            describe(&view(Some(order))),
            "Order 42 [Preparing] assigned to Sam Reed (v1), total 12.50"
        );
    }

    #[test]
    fn flags_offline_views() {
        let mut offline = view(Some(Order { id: 42, ..Default::default() }));
        offline.offline = true;
        assert_eq!(
            describe(&offline),
            "Order 42 [unknown status] awaiting assignment (v1), hub offline"
        );
    }

    #[test]
    fn keeps_payload_when_refresh_fails() {
        let mut stale = view(Some(Order { id: 42, ..Default::default() }));
        stale.error = Some(WatchError::Fetch(FetchError::Network("HTTP 502".into())));
        assert_eq!(
            describe(&stale),
            "Order 42 [unknown status] awaiting assignment (v1), last refresh failed: Fetch failed: Network error: HTTP 502"
        );
    }
}
