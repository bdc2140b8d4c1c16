use std::collections::VecDeque;

use futures::future::BoxFuture;
use futures::stream::{BoxStream, FuturesUnordered};
use futures::StreamExt;
use tokio::sync::mpsc;

/// One in-flight "produce the next event" step. Ownership of the stream
/// rides through the future so it can be re-armed on completion.
type PullFuture<T> = BoxFuture<'static, (Option<T>, BoxStream<'static, T>)>;

fn pull_next<T: Send + 'static>(mut stream: BoxStream<'static, T>) -> PullFuture<T> {
    Box::pin(async move {
        let item = stream.next().await;
        (item, stream)
    })
}

/// Merge independent lazy event sequences into one, in completion order,
/// never running more than `cap` "produce next event" steps at once.
///
/// Each input sequence's internal order is preserved; nothing is
/// guaranteed across sequences. This is the only concurrency-bounding
/// mechanism for tool execution and knows nothing about tools or
/// messages.
pub fn merge_bounded<T: Send + 'static>(
    sources: Vec<BoxStream<'static, T>>,
    cap: usize,
) -> BoxStream<'static, T> {
    let cap = cap.max(1);
    let (tx, rx) = mpsc::channel::<T>(1);

    tokio::spawn(async move {
        let mut waiting: VecDeque<BoxStream<'static, T>> = sources.into();
        let mut in_flight: FuturesUnordered<PullFuture<T>> = FuturesUnordered::new();

        while in_flight.len() < cap {
            let Some(stream) = waiting.pop_front() else {
                break;
            };
            in_flight.push(pull_next(stream));
        }

        while let Some((item, stream)) = in_flight.next().await {
            match item {
                Some(event) => {
                    // Re-arm the same sequence before emitting so its next
                    // pull competes with the rest.
                    in_flight.push(pull_next(stream));
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
                None => {
                    if let Some(next) = waiting.pop_front() {
                        in_flight.push(pull_next(next));
                    }
                }
            }
        }
    });

    Box::pin(futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (event, rx))
    }))
}
