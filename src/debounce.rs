//! Quiescence-window coalescing
//!
//! Bursts of upserts produce bursts of change events. Subscribers run their
//! refresh once per quiet period instead of once per event: every arriving
//! item pushes the deadline back by `window`, and when the deadline passes the
//! callback gets the whole batch.
//!
//! ```text
//! events:   x  x x   x                 x
//! deadline: ├──────────────┤ (reset on each x)
//! refresh:                    ▲ (batch of 4)          ▲ (batch of 1)
//! ```

use std::future::Future;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::trace;

/// Default quiet period before a refresh runs
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(2);

/// Spawn a task that calls `on_quiet` with each coalesced batch.
///
/// The task ends when `events` ends; a batch still waiting for its quiet
/// period at that point is delivered first.
pub fn spawn_debounced<S, T, F, Fut>(events: S, window: Duration, mut on_quiet: F) -> JoinHandle<()>
where
    S: Stream<Item = T> + Send + 'static,
    T: Send + 'static,
    F: FnMut(Vec<T>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut events = Box::pin(events);

        loop {
            let Some(first) = events.next().await else {
                break;
            };

            let mut batch = vec![first];
            let mut ended = false;
            let quiet = tokio::time::sleep(window);
            tokio::pin!(quiet);

            loop {
                tokio::select! {
                    item = events.next() => match item {
                        Some(item) => {
                            batch.push(item);
                            quiet.as_mut().reset(Instant::now() + window);
                        }
                        None => {
                            ended = true;
                            break;
                        }
                    },
                    _ = &mut quiet => break,
                }
            }

            trace!(coalesced = batch.len(), "Debounce window elapsed");
            on_quiet(batch).await;

            if ended {
                break;
            }
        }
    })
}
