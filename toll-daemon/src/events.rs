use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::{Stream, wrappers::BroadcastStream};
use tracing::trace;

/// Balance update published after every ledger credit or debit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletEvent {
    pub wallet_id: String,
    pub balance_sats: i64,
    pub balance_usd_cents: i64,
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<WalletEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            tx: broadcast::channel(capacity).0,
        }
    }

    pub fn publish_balance(&self, wallet_id: String, balance_sats: i64, balance_usd_cents: i64) {
        trace!(?wallet_id, ?balance_sats, ?balance_usd_cents, "Balance event");

        self.tx
            .send(WalletEvent {
                wallet_id,
                balance_sats,
                balance_usd_cents,
            })
            .ok();
    }

    pub fn subscribe(
        &self,
        wallet_id: String,
    ) -> impl Stream<Item = Result<WalletEvent, String>> + Send + 'static + use<> {
        BroadcastStream::new(self.tx.subscribe()).filter_map(move |r| filter(wallet_id.clone(), r))
    }
}

async fn filter(
    wallet_id: String,
    result: Result<WalletEvent, BroadcastStreamRecvError>,
) -> Option<Result<WalletEvent, String>> {
    match result {
        Ok(event) => {
            if event.wallet_id == wallet_id {
                Some(Ok(event))
            } else {
                None
            }
        }
        Err(e) => Some(Err(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_only_see_their_wallet() {
        let bus = EventBus::new(16);

        let mut stream = Box::pin(bus.subscribe("wal_a".to_string()));

        bus.publish_balance("wal_b".to_string(), 1, 0);

        bus.publish_balance("wal_a".to_string(), 42, 7);

        let event = stream.next().await.unwrap().unwrap();

        assert_eq!(event.wallet_id, "wal_a");

        assert_eq!(event.balance_sats, 42);

        assert_eq!(event.balance_usd_cents, 7);
    }
}
