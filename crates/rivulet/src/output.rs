use crate::error::PipelineError;
use futures::Stream;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// One worker outcome travelling through the output channel.
///
/// `Skip` marks an index whose error was suppressed, aggregated, or
/// dropped, so the ordered cursor can move past the hole.
pub(crate) enum Completion<R> {
    Value { index: usize, value: R },
    Skip { index: usize },
}

/// Reorders completions into source-index order.
///
/// Entries are parked keyed by index; `pop_ready` releases the contiguous
/// run starting at the cursor. The consumer keeps draining the channel
/// while the next-expected index is outstanding, so parking is bounded by
/// `channel_capacity` plus the concurrency cap and the next-expected index
/// is always accepted.
pub(crate) struct ReorderBuffer<R> {
    next: usize,
    parked: BTreeMap<usize, Option<R>>,
}

impl<R> ReorderBuffer<R> {
    pub(crate) fn new() -> Self {
        Self {
            next: 0,
            parked: BTreeMap::new(),
        }
    }

    pub(crate) fn accept(&mut self, completion: Completion<R>) {
        match completion {
            Completion::Value { index, value } => {
                self.parked.insert(index, Some(value));
            }
            Completion::Skip { index } => {
                self.parked.insert(index, None);
            }
        }
    }

    /// Releases the next in-order value, advancing past skip markers.
    pub(crate) fn pop_ready(&mut self) -> Option<R> {
        loop {
            match self.parked.remove(&self.next) {
                Some(Some(value)) => {
                    self.next += 1;
                    return Some(value);
                }
                Some(None) => {
                    self.next += 1;
                }
                None => return None,
            }
        }
    }
}

/// Lazy result stream of one engine invocation.
///
/// Yields one `Ok` per successful item (in completion or source order,
/// per configuration). After the last item, a failed invocation yields a
/// single terminal `Err`. Dropping the stream cancels the engine; workers
/// and the driver wind down in the background.
pub struct TransformStream<R, E> {
    rx: mpsc::Receiver<Completion<R>>,
    reorder: Option<ReorderBuffer<R>>,
    driver: Option<JoinHandle<Result<(), PipelineError<E>>>>,
    guard: CancellationToken,
    done: bool,
}

impl<R, E> TransformStream<R, E> {
    pub(crate) fn new(
        rx: mpsc::Receiver<Completion<R>>,
        ordered: bool,
        driver: JoinHandle<Result<(), PipelineError<E>>>,
        guard: CancellationToken,
    ) -> Self {
        Self {
            rx,
            reorder: ordered.then(ReorderBuffer::new),
            driver: Some(driver),
            guard,
            done: false,
        }
    }
}

impl<R, E> Stream for TransformStream<R, E> {
    type Item = Result<R, PipelineError<E>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if this.done {
                return Poll::Ready(None);
            }
            if let Some(buffer) = &mut this.reorder {
                if let Some(value) = buffer.pop_ready() {
                    return Poll::Ready(Some(Ok(value)));
                }
            }
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(completion)) => match &mut this.reorder {
                    Some(buffer) => buffer.accept(completion),
                    None => match completion {
                        Completion::Value { value, .. } => return Poll::Ready(Some(Ok(value))),
                        Completion::Skip { .. } => continue,
                    },
                },
                Poll::Ready(None) => {
                    // all workers finished; the driver's result is terminal
                    let Some(handle) = this.driver.as_mut() else {
                        this.done = true;
                        continue;
                    };
                    match Pin::new(handle).poll(cx) {
                        Poll::Ready(outcome) => {
                            this.driver = None;
                            this.done = true;
                            match outcome {
                                Ok(Ok(())) => return Poll::Ready(None),
                                Ok(Err(error)) => return Poll::Ready(Some(Err(error))),
                                Err(_join_error) => {
                                    return Poll::Ready(Some(Err(PipelineError::Cancelled)));
                                }
                            }
                        }
                        Poll::Pending => return Poll::Pending,
                    }
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<R, E> Drop for TransformStream<R, E> {
    fn drop(&mut self) {
        self.guard.cancel();
    }
}
