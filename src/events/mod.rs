use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

/// Domain events emitted by the checkout pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    OrderCreated {
        order_id: Uuid,
        user_id: Uuid,
        total: Decimal,
    },
    OrderCompleted(Uuid),
    CartCleared {
        user_id: Uuid,
        items: usize,
    },
    PaymentCaptured {
        order_id: Uuid,
        transaction_id: String,
        attempts: u32,
    },
    PaymentFailed {
        order_id: Uuid,
        reason: String,
    },
    NotificationFailed {
        order_id: Uuid,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Events are informational; a closed channel must not fail the request that raised them.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!("{}", e);
        }
    }
}

/// Drains the event channel, logging each event.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::OrderCreated {
                order_id,
                user_id,
                total,
            } => info!(%order_id, %user_id, %total, "order created"),
            Event::OrderCompleted(order_id) => info!(%order_id, "order completed"),
            Event::CartCleared { user_id, items } => info!(%user_id, items, "cart cleared"),
            Event::PaymentCaptured {
                order_id,
                transaction_id,
                attempts,
            } => info!(%order_id, %transaction_id, attempts, "payment captured"),
            Event::PaymentFailed { order_id, reason } => {
                warn!(%order_id, %reason, "payment failed")
            }
            Event::NotificationFailed { order_id, reason } => {
                warn!(%order_id, %reason, "order notification failed")
            }
        }
    }

    info!("Event channel closed; processing loop finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_delivers_in_order() {
        let (tx, mut rx) = mpsc::channel(4);
        let sender = EventSender::new(tx);
        let order_id = Uuid::new_v4();

        sender.send(Event::OrderCompleted(order_id)).await.unwrap();
        sender
            .send_or_log(Event::PaymentFailed {
                order_id,
                reason: "declined".into(),
            })
            .await;

        assert_eq!(rx.recv().await, Some(Event::OrderCompleted(order_id)));
        assert!(matches!(rx.recv().await, Some(Event::PaymentFailed { .. })));
    }

    #[tokio::test]
    async fn closed_channel_is_reported_not_panicking() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sender = EventSender::new(tx);
        assert!(sender.send(Event::OrderCompleted(Uuid::nil())).await.is_err());
        sender.send_or_log(Event::OrderCompleted(Uuid::nil())).await;
    }
}
