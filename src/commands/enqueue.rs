use chrono::{DateTime, Utc};
use clap::{Args, Subcommand};
use courier_core::{ActionPayload, DeliveryProof, OrderId, OrderStatus, PendingAction, SyncService};

/// Queue an order mutation for delivery to the backend
#[derive(Args)]
pub struct EnqueueCommand {
    #[command(subcommand)]
    pub command: EnqueueSubcommand,
}

#[derive(Subcommand)]
pub enum EnqueueSubcommand {
    /// Change an order's status
    Status {
        /// Order ID
        #[arg(long)]
        order: OrderId,

        /// New status (e.g. picked_up, in_transit)
        #[arg(long)]
        status: OrderStatus,

        /// Free-form notes
        #[arg(long)]
        notes: Option<String>,

        /// Server updated_at the change was based on (RFC 3339)
        #[arg(long, value_parser = parse_timestamp)]
        snapshot: Option<DateTime<Utc>>,
    },

    /// Mark an order delivered
    Deliver {
        /// Order ID
        #[arg(long)]
        order: OrderId,

        /// Free-form notes
        #[arg(long)]
        notes: Option<String>,

        /// Proof-of-delivery URL
        #[arg(long)]
        proof: Option<String>,

        /// Server updated_at the change was based on (RFC 3339)
        #[arg(long, value_parser = parse_timestamp)]
        snapshot: Option<DateTime<Utc>>,
    },

    /// Return an order
    Reject {
        /// Order ID
        #[arg(long)]
        order: OrderId,

        /// Why the order is being returned
        #[arg(long)]
        reason: String,
    },

    /// Pick up several orders at once
    BatchPickup {
        /// Comma-separated order IDs
        #[arg(long, value_delimiter = ',', required = true)]
        orders: Vec<OrderId>,
    },

    /// Deliver several orders at once
    BatchDelivery {
        /// Comma-separated order IDs
        #[arg(long, value_delimiter = ',', required = true)]
        orders: Vec<OrderId>,

        /// Proof per order as ORDER=URL (can be repeated)
        #[arg(long = "proof", value_parser = parse_proof)]
        proofs: Vec<DeliveryProof>,
    },
}

impl EnqueueCommand {
    pub async fn run(&self, service: &SyncService) -> Result<(), Box<dyn std::error::Error>> {
        let action = self.build()?;
        let action = service.enqueue(action).await?;
        println!("Queued {} ({})", action, action.id);
        Ok(())
    }

    fn build(&self) -> Result<PendingAction, Box<dyn std::error::Error>> {
        let action = match &self.command {
            EnqueueSubcommand::Status {
                order,
                status,
                notes,
                snapshot,
            } => with_snapshot(
                PendingAction::new(
                    *order,
                    ActionPayload::StatusUpdate {
                        status: *status,
                        notes: notes.clone(),
                    },
                ),
                *snapshot,
            ),
            EnqueueSubcommand::Deliver {
                order,
                notes,
                proof,
                snapshot,
            } => with_snapshot(
                PendingAction::new(
                    *order,
                    ActionPayload::DeliveryComplete {
                        notes: notes.clone(),
                        proof: proof.clone(),
                    },
                ),
                *snapshot,
            ),
            EnqueueSubcommand::Reject { order, reason } => PendingAction::new(
                *order,
                ActionPayload::Rejection {
                    reason: reason.clone(),
                },
            ),
            EnqueueSubcommand::BatchPickup { orders } => {
                PendingAction::batch(ActionPayload::BatchPickup {
                    order_ids: orders.clone(),
                })?
            }
            EnqueueSubcommand::BatchDelivery { orders, proofs } => {
                PendingAction::batch(ActionPayload::BatchDelivery {
                    order_ids: orders.clone(),
                    proofs: if proofs.is_empty() {
                        None
                    } else {
                        Some(proofs.clone())
                    },
                })?
            }
        };
        Ok(action)
    }
}

fn with_snapshot(action: PendingAction, snapshot: Option<DateTime<Utc>>) -> PendingAction {
    match snapshot {
        Some(updated_at) => action.with_snapshot(updated_at),
        None => action,
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| format!("Invalid timestamp '{}': {}", s, e))
}

fn parse_proof(s: &str) -> Result<DeliveryProof, String> {
    let (order, url) = s
        .split_once('=')
        .ok_or_else(|| format!("Invalid proof '{}'. Expected ORDER=URL", s))?;
    let order_id = order
        .trim()
        .parse()
        .map_err(|_| format!("Invalid order ID '{}' in proof", order))?;
    Ok(DeliveryProof {
        order_id,
        url: url.trim().to_string(),
    })
}
