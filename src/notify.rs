use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Downstream signal that an owner's stored corpus gained articles. The
/// vectorization collaborator consumes these to recompute embeddings.
#[derive(Clone)]
pub struct CorpusEvents {
    tx: mpsc::UnboundedSender<i64>,
}

impl CorpusEvents {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<i64>) {
        let (tx, rx) = mpsc::unbounded_channel();

        (Self { tx }, rx)
    }

    /// Best-effort send: a missing listener is logged and ignored, since
    /// the ingestion job that produced the event has already succeeded.
    pub fn corpus_changed(&self, owner_id: i64) {
        if self.tx.send(owner_id).is_err() {
            debug!(owner_id, "No corpus-change listener; dropping the event");
        }
    }
}

/// Drains corpus-change events until shutdown. This is where the external
/// embedding consumer plugs in; on its own it only records the events.
pub async fn drain(
    mut events: mpsc::UnboundedReceiver<i64>,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            event = events.recv() => {
                match event {
                    Some(owner_id) => info!(owner_id, "Owner corpus changed"),
                    None => break,
                }
            }
        }
    }

    Ok(())
}
