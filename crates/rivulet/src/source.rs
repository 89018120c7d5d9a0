use crate::error::SourceError;
use futures::stream::{BoxStream, StreamExt};

/// Uniform pull interface over a finite input sequence.
///
/// Wraps an eager iterator, an async stream, or a fallible async stream.
/// The dispatcher pulls items one at a time; backpressure comes from the
/// downstream bounded channel, so a lazy source is only advanced as fast as
/// results are consumed.
pub struct ParallelSource<T> {
    kind: SourceKind<T>,
}

enum SourceKind<T> {
    Iter(Box<dyn Iterator<Item = T> + Send>),
    Stream(BoxStream<'static, T>),
    TryStream(BoxStream<'static, Result<T, SourceError>>),
}

impl<T: Send + 'static> ParallelSource<T> {
    /// Wraps a finite synchronous sequence.
    pub fn from_iter<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        Self {
            kind: SourceKind::Iter(Box::new(iter.into_iter())),
        }
    }

    /// Wraps a finite asynchronous sequence.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: futures::Stream<Item = T> + Send + 'static,
    {
        Self {
            kind: SourceKind::Stream(stream.boxed()),
        }
    }

    /// Wraps a finite asynchronous sequence whose items may fail to
    /// produce. The first error is terminal for the whole invocation.
    pub fn from_try_stream<S, E>(stream: S) -> Self
    where
        S: futures::Stream<Item = Result<T, E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            kind: SourceKind::TryStream(
                stream.map(|r| r.map_err(|e| Box::new(e) as SourceError)).boxed(),
            ),
        }
    }

    /// Pulls the next item. `Ok(None)` means the source is exhausted.
    pub(crate) async fn next(&mut self) -> Result<Option<T>, SourceError> {
        match &mut self.kind {
            SourceKind::Iter(iter) => Ok(iter.next()),
            SourceKind::Stream(stream) => Ok(stream.next().await),
            SourceKind::TryStream(stream) => stream.next().await.transpose(),
        }
    }
}

impl<T: Send + 'static> From<Vec<T>> for ParallelSource<T> {
    fn from(items: Vec<T>) -> Self {
        Self::from_iter(items)
    }
}
