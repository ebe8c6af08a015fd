use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Backend order identifier.
pub type OrderId = i64;
/// Backend driver identifier.
pub type DriverId = i64;

/// Lifecycle status of an order, as the backend spells it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Assigned,
    PickedUp,
    InTransit,
    Delivered,
    Failed,
    Returned,
    Cancelled,
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderStatus::Pending => write!(f, "pending"),
            OrderStatus::Assigned => write!(f, "assigned"),
            OrderStatus::PickedUp => write!(f, "picked_up"),
            OrderStatus::InTransit => write!(f, "in_transit"),
            OrderStatus::Delivered => write!(f, "delivered"),
            OrderStatus::Failed => write!(f, "failed"),
            OrderStatus::Returned => write!(f, "returned"),
            OrderStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "pending" => Ok(OrderStatus::Pending),
            "assigned" => Ok(OrderStatus::Assigned),
            "picked_up" => Ok(OrderStatus::PickedUp),
            "in_transit" => Ok(OrderStatus::InTransit),
            "delivered" => Ok(OrderStatus::Delivered),
            "failed" => Ok(OrderStatus::Failed),
            "returned" => Ok(OrderStatus::Returned),
            "cancelled" => Ok(OrderStatus::Cancelled),
            _ => Err(format!(
                "Invalid order status '{}'. Valid options: pending, assigned, picked_up, in_transit, delivered, failed, returned, cancelled",
                s
            )),
        }
    }
}
