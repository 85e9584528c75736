//! # Order Record
//!
//! Mirror of the JSON returned by `GET /api/Order/GetOrderById/{id}`. The
//! backend omits or nulls most fields depending on the order's stage, so
//! nearly everything is optional.

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};

use super::entity::EntityId;

/// An order as seen by the staff dashboard.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    /// Backend order id.
    pub id: i64,
    /// Whether a delivery person has been assigned.
    #[serde(default)]
    pub is_assigned: bool,
    /// Raw order timestamp as sent by the backend.
    #[serde(default)]
    pub order_date: Option<String>,
    /// Order total.
    #[serde(default)]
    pub total_price: Option<f64>,
    /// Free-text location note entered by the customer.
    #[serde(default)]
    pub note: Option<String>,
    /// Delivery latitude.
    #[serde(default)]
    pub latitude: Option<f64>,
    /// Delivery longitude.
    #[serde(default)]
    pub longitude: Option<f64>,
    /// Who placed the order.
    #[serde(default)]
    pub customer: Option<Customer>,
    /// Current workflow status.
    #[serde(default)]
    pub order_status: Option<OrderStatus>,
    /// The assigned delivery person, once there is one.
    #[serde(default)]
    pub delivery: Option<DeliveryPerson>,
    /// Candidates offered for assignment.
    #[serde(default)]
    pub nearest_deliveries: Option<Vec<DeliveryPerson>>,
    /// Line items.
    #[serde(default)]
    pub order_items: Option<Vec<OrderItem>>,
}

/// Customer contact details.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Email address.
    #[serde(default)]
    pub email: Option<String>,
    /// Phone number.
    #[serde(default)]
    pub phone_number: Option<String>,
}

/// Workflow status of an order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderStatus {
    /// Status id.
    #[serde(default)]
    pub id: Option<i64>,
    /// Human readable status.
    #[serde(default)]
    pub name: Option<String>,
}

/// A delivery person.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryPerson {
    /// Delivery person id.
    #[serde(default)]
    pub id: Option<i64>,
    /// First name.
    #[serde(default)]
    pub first_name: Option<String>,
    /// Last name.
    #[serde(default)]
    pub last_name: Option<String>,
}

impl DeliveryPerson {
    /// "First Last", skipping missing parts.
    pub fn full_name(&self) -> Option<String> {
        let parts: Vec<&str> = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .filter(|p| !p.trim().is_empty())
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(" "))
        }
    }
}

/// One line of an order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    /// Product id.
    #[serde(default)]
    pub product_id: Option<i64>,
    /// Product name.
    #[serde(default)]
    pub product_name: Option<String>,
    /// Price per unit.
    #[serde(default)]
    pub unit_price: Option<f64>,
    /// Quantity ordered.
    #[serde(default)]
    pub quantity: Option<u32>,
    /// `unit_price * quantity` as computed by the backend.
    #[serde(default)]
    pub sub_total_price: Option<f64>,
    /// Product image. The backend spells the field `iamgeUrl`.
    #[serde(default, rename = "iamgeUrl", alias = "imageUrl")]
    pub image_url: Option<String>,
}

impl Order {
    /// The order id as a watch subject.
    pub fn entity_id(&self) -> EntityId {
        EntityId::from(self.id)
    }

    /// Still waiting for a delivery person.
    pub fn awaiting_assignment(&self) -> bool {
        !self.is_assigned
    }

    /// Name of the assigned delivery person, if any.
    pub fn delivery_name(&self) -> Option<String> {
        self.delivery.as_ref().and_then(DeliveryPerson::full_name)
    }

    /// Parses `order_date`. Accepts RFC 3339 and the zone-less ISO form the
    /// backend usually sends.
    pub fn placed_at(&self) -> Option<NaiveDateTime> {
        let raw = self.order_date.as_deref()?.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Some(dt.naive_utc());
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").ok()
    }
}
