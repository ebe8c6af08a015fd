//! Typed calls against the courier backend REST API.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::models::{ActionPayload, DeliveryProof, LocationSample, OrderId, OrderStatus, PendingAction};
use crate::transport::{ErrorClass, Request, Response, Transport, TransportError, TransportResult};

#[derive(Debug, Serialize)]
struct StatusBody<'a> {
    status: OrderStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    notes: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    proof: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct ReturnBody<'a> {
    reason: &'a str,
}

#[derive(Debug, Serialize)]
struct BatchBody<'a> {
    order_ids: &'a [OrderId],
    #[serde(skip_serializing_if = "Option::is_none")]
    proofs: Option<&'a [DeliveryProof]>,
}

#[derive(Debug, Serialize)]
struct LocationBody {
    driver_id: i64,
    latitude: f64,
    longitude: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    accuracy: Option<f64>,
    timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    speed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    heading: Option<f64>,
}

#[derive(Debug, Serialize)]
struct AvailabilityBody {
    is_available: bool,
}

/// An order as returned by `GET /orders/{id}`.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderView {
    pub id: OrderId,
    pub status: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Server timestamps returned by a mutation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MutationAck {
    pub updated_at: Option<DateTime<Utc>>,
    pub orders: Vec<(OrderId, DateTime<Utc>)>,
}

impl MutationAck {
    /// Reads `updated_at` and `orders[].updated_at` from a response. Missing or
    /// malformed fields are ignored.
    pub fn parse(response: &Response) -> Self {
        if response.is_empty() {
            return Self::default();
        }
        let Ok(value) = response.json::<Value>() else {
            tracing::debug!("mutation response is not JSON, no snapshot recorded");
            return Self::default();
        };

        let orders = value
            .get("orders")
            .and_then(Value::as_array)
            .map(|orders| {
                orders
                    .iter()
                    .filter_map(|order| {
                        let id = order.get("id")?.as_i64()?;
                        let ts = parse_timestamp(order.get("updated_at")?)?;
                        Some((id, ts))
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            updated_at: value.get("updated_at").and_then(parse_timestamp),
            orders,
        }
    }

    /// New `updated_at` per touched order. Per-order entries take precedence
    /// over the top-level timestamp.
    pub fn stamps(&self, touched: &[OrderId]) -> Vec<(OrderId, DateTime<Utc>)> {
        let mut stamps = self.orders.clone();
        if let Some(ts) = self.updated_at {
            for &order_id in touched {
                if !stamps.iter().any(|(id, _)| *id == order_id) {
                    stamps.push((order_id, ts));
                }
            }
        }
        stamps
    }
}

/// Result of the live order lookup that feeds conflict detection.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderLookup {
    /// The order exists. The timestamp is absent when the server omitted it.
    Found(Option<DateTime<Utc>>),
    NotFound,
    Failed(TransportError),
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let raw = value.as_str()?;
    match DateTime::parse_from_rfc3339(raw) {
        Ok(ts) => Some(ts.with_timezone(&Utc)),
        Err(e) => {
            tracing::warn!(value = raw, error = %e, "ignoring malformed updated_at");
            None
        }
    }
}

/// Endpoint mapping for orders, locations and driver status.
#[derive(Debug, Clone)]
pub struct OrderApi {
    transport: Arc<Transport>,
}

impl OrderApi {
    pub fn new(transport: Arc<Transport>) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// `GET /orders/{id}`.
    pub async fn fetch_order(&self, order_id: OrderId) -> TransportResult<OrderView> {
        let response = self
            .transport
            .send(&Request::get(format!("/orders/{}", order_id)))
            .await?;
        let value: Value = response.json()?;

        Ok(OrderView {
            id: value.get("id").and_then(Value::as_i64).unwrap_or(order_id),
            status: value
                .get("status")
                .and_then(Value::as_str)
                .map(str::to_string),
            updated_at: value.get("updated_at").and_then(parse_timestamp),
        })
    }

    /// Live lookup for conflict detection.
    pub async fn lookup(&self, order_id: OrderId) -> OrderLookup {
        match self.fetch_order(order_id).await {
            Ok(order) => OrderLookup::Found(order.updated_at),
            Err(err) if err.class() == ErrorClass::NotFound => OrderLookup::NotFound,
            Err(TransportError::Decode(message)) => {
                tracing::warn!(order_id, %message, "order lookup returned an unreadable body");
                OrderLookup::Found(None)
            }
            Err(err) => OrderLookup::Failed(err),
        }
    }

    /// Builds the request that delivers a queued action.
    pub fn request_for(&self, action: &PendingAction) -> TransportResult<Request> {
        match &action.payload {
            ActionPayload::StatusUpdate { status, notes } => {
                Request::patch(format!("/orders/{}/status", action.order_id)).with_json(
                    &StatusBody {
                        status: *status,
                        notes: notes.as_deref(),
                        proof: None,
                    },
                )
            }
            ActionPayload::DeliveryComplete { notes, proof } => {
                Request::patch(format!("/orders/{}/status", action.order_id)).with_json(
                    &StatusBody {
                        status: OrderStatus::Delivered,
                        notes: notes.as_deref(),
                        proof: proof.as_deref(),
                    },
                )
            }
            ActionPayload::Rejection { reason } => {
                Request::post(format!("/orders/{}/return", action.order_id))
                    .with_json(&ReturnBody { reason })
            }
            ActionPayload::BatchPickup { order_ids } => {
                Request::post("/orders/batch-pickup").with_json(&BatchBody {
                    order_ids,
                    proofs: None,
                })
            }
            ActionPayload::BatchDelivery { order_ids, proofs } => {
                Request::post("/orders/batch-delivery").with_json(&BatchBody {
                    order_ids,
                    proofs: proofs.as_deref(),
                })
            }
        }
    }

    /// Sends a queued action and returns the server's timestamps.
    pub async fn submit(&self, action: &PendingAction) -> TransportResult<MutationAck> {
        let request = self.request_for(action)?;
        let response = self.transport.send(&request).await?;
        Ok(MutationAck::parse(&response))
    }

    /// `POST /drivers/location` for a single sample.
    pub async fn upload_location(&self, sample: &LocationSample) -> TransportResult<()> {
        let request = Request::post("/drivers/location").with_json(&LocationBody {
            driver_id: sample.driver_id,
            latitude: sample.latitude,
            longitude: sample.longitude,
            accuracy: sample.accuracy_meters,
            timestamp: sample.captured_at,
            speed: sample.speed_mps,
            heading: sample.heading_deg,
        })?;
        self.transport.send(&request).await?;
        Ok(())
    }

    /// `PATCH /drivers/me/status`. Returns the availability the server
    /// acknowledged, falling back to the requested value.
    pub async fn set_availability(&self, available: bool) -> TransportResult<bool> {
        let request = Request::patch("/drivers/me/status").with_json(&AvailabilityBody {
            is_available: available,
        })?;
        let response = self.transport.send(&request).await?;
        let acknowledged = response
            .json::<Value>()
            .ok()
            .and_then(|v| v.get("is_available").and_then(Value::as_bool))
            .unwrap_or(available);
        Ok(acknowledged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Reply, TestContext};
    use reqwest::Method;
    use serde_json::json;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn response(body: &str) -> Response {
        Response {
            status: 200,
            body: body.to_string(),
        }
    }

    #[test]
    fn test_ack_parses_top_level_timestamp() {
        let ack = MutationAck::parse(&response(r#"{"updated_at":"2026-10-18T10:00:00Z"}"#));
        assert_eq!(ack.updated_at, Some(ts("2026-10-18T10:00:00Z")));
        assert_eq!(ack.stamps(&[7]), vec![(7, ts("2026-10-18T10:00:00Z"))]);
    }

    #[test]
    fn test_ack_prefers_per_order_timestamps() {
        let ack = MutationAck::parse(&response(
            r#"{"updated_at":"2026-10-18T10:00:00Z","orders":[{"id":2,"updated_at":"2026-10-18T11:00:00Z"}]}"#,
        ));
        let stamps = ack.stamps(&[1, 2]);
        assert!(stamps.contains(&(2, ts("2026-10-18T11:00:00Z"))));
        assert!(stamps.contains(&(1, ts("2026-10-18T10:00:00Z"))));
        assert_eq!(stamps.len(), 2);
    }

    #[test]
    fn test_ack_tolerates_missing_fields() {
        assert_eq!(MutationAck::parse(&response("")), MutationAck::default());
        assert_eq!(MutationAck::parse(&response("ok")), MutationAck::default());
        let ack = MutationAck::parse(&response(r#"{"updated_at":"not a date"}"#));
        assert!(ack.stamps(&[1]).is_empty());
    }

    #[tokio::test]
    async fn test_request_mapping() {
        let ctx = TestContext::new().await;
        let api = OrderApi::new(ctx.transport.clone());

        let deliver = PendingAction::new(
            9,
            ActionPayload::DeliveryComplete {
                notes: Some("left at door".to_string()),
                proof: Some("https://cdn.example.com/p/9.jpg".to_string()),
            },
        );
        let request = api.request_for(&deliver).unwrap();
        assert_eq!(request.method(), &Method::PATCH);
        assert_eq!(request.path(), "/orders/9/status");
        assert_eq!(
            request.body(),
            Some(&json!({
                "status": "delivered",
                "notes": "left at door",
                "proof": "https://cdn.example.com/p/9.jpg"
            }))
        );

        let reject = PendingAction::new(
            3,
            ActionPayload::Rejection {
                reason: "customer absent".to_string(),
            },
        );
        let request = api.request_for(&reject).unwrap();
        assert_eq!(request.method(), &Method::POST);
        assert_eq!(request.path(), "/orders/3/return");

        let batch = PendingAction::batch(ActionPayload::BatchPickup {
            order_ids: vec![1, 2],
        })
        .unwrap();
        let request = api.request_for(&batch).unwrap();
        assert_eq!(request.path(), "/orders/batch-pickup");
        assert_eq!(request.body(), Some(&json!({ "order_ids": [1, 2] })));
    }

    #[tokio::test]
    async fn test_lookup_outcomes() {
        let ctx = TestContext::new().await;
        let api = OrderApi::new(ctx.transport.clone());

        ctx.backend.set_order(1, Some(ts("2026-10-18T10:00:00Z")));
        assert_eq!(
            api.lookup(1).await,
            OrderLookup::Found(Some(ts("2026-10-18T10:00:00Z")))
        );

        ctx.backend.remove_order(2);
        assert_eq!(api.lookup(2).await, OrderLookup::NotFound);

        ctx.backend.script("GET /orders/3", vec![Reply::status(503)]);
        assert!(matches!(api.lookup(3).await, OrderLookup::Failed(_)));
    }

    #[tokio::test]
    async fn test_upload_location_body() {
        let ctx = TestContext::new().await;
        let api = OrderApi::new(ctx.transport.clone());
        let sample = LocationSample::new(42, 52.5, 13.4)
            .with_accuracy(3.0)
            .with_captured_at(ts("2026-10-18T10:00:00Z"));

        api.upload_location(&sample).await.unwrap();

        let requests = ctx.backend.requests();
        let body = &requests.last().unwrap().body;
        assert_eq!(body["driver_id"], 42);
        assert_eq!(body["accuracy"], 3.0);
        assert_eq!(body["timestamp"], "2026-10-18T10:00:00Z");
        assert!(body.get("speed").is_none());
    }

    #[tokio::test]
    async fn test_set_availability() {
        let ctx = TestContext::new().await;
        let api = OrderApi::new(ctx.transport.clone());
        assert!(api.set_availability(true).await.unwrap());
        assert_eq!(ctx.backend.hits("PATCH /drivers/me/status"), 1);
    }
}
