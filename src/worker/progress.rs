use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::net::registry::Outbox;
use crate::protocol::{FunctionMessage, Target};

/// Periodically sends the latest progress value to the coordinator.
///
/// Adapters may report progress as often as they like; values written
/// between two ticks collapse into one `progress` call, and nothing is sent
/// when the value has not changed.
pub struct ProgressFlusher {
    name: String,
    interval: Duration,
}

impl ProgressFlusher {
    pub fn new(name: impl Into<String>, interval: Duration) -> Self {
        Self {
            name: name.into(),
            interval,
        }
    }

    pub async fn run(
        &self,
        mut progress: watch::Receiver<f64>,
        outbox: Outbox,
        token: CancellationToken,
    ) -> Result<()> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }

            match progress.has_changed() {
                Ok(true) => {}
                Ok(false) => continue,
                // Sender dropped with the worker context.
                Err(_) => return Ok(()),
            }
            let value = *progress.borrow_and_update();
            let message = FunctionMessage::new(Target::Server, self.name.clone(), "progress")
                .kwarg("progress", value);
            if outbox.send(message.into()).is_err() {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Message;
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn only_latest_value_is_flushed() {
        let (tx, rx) = watch::channel(0.0);
        let (outbox, mut sent) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let flusher = ProgressFlusher::new("render01", Duration::from_millis(100));
        let handle = {
            let token = token.clone();
            tokio::spawn(async move { flusher.run(rx, outbox, token).await })
        };

        tx.send_replace(10.0);
        tx.send_replace(20.0);
        tx.send_replace(30.0);
        tokio::time::sleep(Duration::from_millis(150)).await;

        let Some(Message::Function(call)) = sent.recv().await else {
            panic!("expected a progress call");
        };
        assert_eq!(call.function, "progress");
        assert_eq!(call.kwargs["progress"], 30.0);

        // Unchanged value is not resent.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(sent.try_recv().is_err());

        token.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stops_when_sender_dropped() {
        let (tx, rx) = watch::channel(0.0);
        let (outbox, _sent) = mpsc::unbounded_channel();
        drop(tx);
        let flusher = ProgressFlusher::new("render01", Duration::from_millis(100));
        flusher
            .run(rx, outbox, CancellationToken::new())
            .await
            .unwrap();
    }
}
