use tokio::sync::mpsc;

use crate::store::RowStatus;

pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Per-row progress notification emitted as rows change status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowEvent {
    pub row_id: i64,
    pub status: RowStatus,
    pub dest: Option<String>,
    pub error: Option<String>,
}

impl RowEvent {
    pub fn status(row_id: i64, status: RowStatus) -> Self {
        Self {
            row_id,
            status,
            dest: None,
            error: None,
        }
    }
}

/// Non-blocking event fan-out. A full or closed channel drops the event
/// with a debug log; progress reporting must never stall a worker.
#[derive(Debug, Clone, Default)]
pub struct EventSender {
    tx: Option<mpsc::Sender<RowEvent>>,
}

impl EventSender {
    pub fn new(tx: mpsc::Sender<RowEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn channel() -> (Self, mpsc::Receiver<RowEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        (Self::new(tx), rx)
    }

    pub fn send(&self, event: RowEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        if let Err(err) = tx.try_send(event) {
            tracing::debug!(error = %err, "row event dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn full_channel_drops_instead_of_blocking() {
        let (tx, mut rx) = mpsc::channel(1);
        let sender = EventSender::new(tx);
        sender.send(RowEvent::status(1, RowStatus::InProgress));
        sender.send(RowEvent::status(2, RowStatus::InProgress)); // dropped
        assert_eq!(rx.recv().await.unwrap().row_id, 1);
        assert!(rx.try_recv().is_err());
    }
}
