//! Ordered transaction subscription
//!
//! A subscription replays the log from a cursor (a transaction hash, or the
//! beginning) and then follows new commits by polling. Items arrive in log
//! order with no gaps; dropping the receiver cancels the feed.

use crate::{
    crypto,
    error::Result,
    storage::StorageEngine,
    types::ByteString,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const CHANNEL_CAPACITY: usize = 64;

/// Stream encoded transactions starting strictly after `from`
///
/// `from == None` replays the whole log first. A storage error terminates
/// the stream after yielding the error.
pub fn transaction_stream(
    storage: Arc<dyn StorageEngine>,
    from: Option<ByteString>,
    poll_interval: Duration,
) -> ReceiverStream<Result<ByteString>> {
    let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);

    tokio::spawn(async move {
        let mut cursor = from;
        loop {
            let batch = match storage.get_transactions(cursor.as_ref()).await {
                Ok(batch) => batch,
                Err(err) => {
                    tracing::error!(error = %err, "Transaction stream poll failed");
                    let _ = sender.send(Err(err)).await;
                    return;
                }
            };

            for raw in batch {
                cursor = Some(crypto::hash(&raw));
                if sender.send(Ok(raw)).await.is_err() {
                    // Receiver dropped; stop polling.
                    return;
                }
            }

            tokio::time::sleep(poll_interval).await;
        }
    });

    ReceiverStream::new(receiver)
}
