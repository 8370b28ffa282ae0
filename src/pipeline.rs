//! Pipeline composition.
//!
//! Presents an ordered list of single-input/single-output stages as
//! one logical duplex unit: one input sender, one output receiver,
//! one error slot. Stages run as their own tasks connected by bounded
//! channels, so backpressure holds end to end: a send into the
//! composite blocks until the first stage has room, and output only
//! appears once the last stage produced it. Dropping the input sender
//! propagates a close through every stage in order; the composite's
//! output ends only after the last stage finishes. The first interior
//! error wins and is surfaced exactly once.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::Error;

/// Default bounded-buffer capacity between stages.
pub const STAGE_BUFFER: usize = 64;

/// In-band marker telling downstream stages to abandon buffered state
/// and tear down without committing anything. The error that caused
/// the abort travels separately through the error slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Abort;

/// Write half of a stage's error slot. Cloned into every stage; only
/// the first raised error is kept.
#[derive(Clone)]
pub struct ErrorSink {
    tx: mpsc::Sender<Error>,
}

impl ErrorSink {
    /// Reports a fatal stage error. Later errors lose the race and are
    /// logged rather than surfaced.
    pub fn raise(&self, err: Error) {
        if let Err(mpsc::error::TrySendError::Full(err)) = self.tx.try_send(err) {
            tracing::debug!(error = %err, "suppressing error raised after the first");
        }
    }
}

/// Builds a linear chain of stages. The type parameters track the
/// composite's input and current tail output types.
pub struct PipelineBuilder<I, O> {
    input: mpsc::Sender<I>,
    tail: mpsc::Receiver<O>,
    err_tx: mpsc::Sender<Error>,
    err_rx: mpsc::Receiver<Error>,
    tasks: Vec<JoinHandle<()>>,
    capacity: usize,
}

impl<I: Send + 'static> PipelineBuilder<I, I> {
    pub fn new() -> PipelineBuilder<I, I> {
        Self::with_capacity(STAGE_BUFFER)
    }

    pub fn with_capacity(capacity: usize) -> PipelineBuilder<I, I> {
        let (input, tail) = mpsc::channel(capacity.max(1));
        let (err_tx, err_rx) = mpsc::channel(1);
        PipelineBuilder {
            input,
            tail,
            err_tx,
            err_rx,
            tasks: Vec::new(),
            capacity: capacity.max(1),
        }
    }
}

impl<I: Send + 'static> Default for PipelineBuilder<I, I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I, O> PipelineBuilder<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Appends a stage. The stage owns its receiver and sender and
    /// runs until its input closes; dropping the sender closes the
    /// next stage in turn.
    pub fn stage<N, F, Fut>(self, stage: F) -> PipelineBuilder<I, N>
    where
        N: Send + 'static,
        F: FnOnce(mpsc::Receiver<O>, mpsc::Sender<N>, ErrorSink) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let PipelineBuilder {
            input,
            tail,
            err_tx,
            err_rx,
            mut tasks,
            capacity,
        } = self;
        let (tx, rx) = mpsc::channel(capacity);
        let sink = ErrorSink {
            tx: err_tx.clone(),
        };
        tasks.push(tokio::spawn(stage(tail, tx, sink)));
        PipelineBuilder {
            input,
            tail: rx,
            err_tx,
            err_rx,
            tasks,
            capacity,
        }
    }

    /// One-to-one transform stage.
    pub fn map<N, F>(self, mut f: F) -> PipelineBuilder<I, N>
    where
        N: Send + 'static,
        F: FnMut(O) -> N + Send + 'static,
    {
        self.stage(move |mut rx, tx, _err| async move {
            while let Some(item) = rx.recv().await {
                if tx.send(f(item)).await.is_err() {
                    break;
                }
            }
        })
    }

    /// Filtering transform stage; `None` drops the item.
    pub fn filter_map<N, F>(self, mut f: F) -> PipelineBuilder<I, N>
    where
        N: Send + 'static,
        F: FnMut(O) -> Option<N> + Send + 'static,
    {
        self.stage(move |mut rx, tx, _err| async move {
            while let Some(item) = rx.recv().await {
                if let Some(mapped) = f(item) {
                    if tx.send(mapped).await.is_err() {
                        break;
                    }
                }
            }
        })
    }

    pub fn build(self) -> (mpsc::Sender<I>, PipelineOutput<O>) {
        let PipelineBuilder {
            input,
            tail,
            err_rx,
            tasks,
            ..
        } = self;
        (
            input,
            PipelineOutput {
                tail,
                err_rx,
                tasks,
            },
        )
    }
}

/// Read half of a composed pipeline.
pub struct PipelineOutput<O> {
    tail: mpsc::Receiver<O>,
    err_rx: mpsc::Receiver<Error>,
    tasks: Vec<JoinHandle<()>>,
}

impl<O> PipelineOutput<O> {
    /// Next output item; `None` once every stage has completed and
    /// buffered items are drained.
    pub async fn recv(&mut self) -> Option<O> {
        self.tail.recv().await
    }

    /// Drains any remaining output and reports the surfaced error, if
    /// a stage raised one.
    pub async fn finish(mut self) -> Result<(), Error> {
        while self.tail.recv().await.is_some() {}
        for task in self.tasks.drain(..) {
            // A stage panic is a programming error, not data-driven.
            if let Err(e) = task.await {
                if e.is_panic() {
                    std::panic::resume_unwind(e.into_panic());
                }
            }
        }
        match self.err_rx.try_recv() {
            Ok(err) => Err(err),
            Err(_) => Ok(()),
        }
    }

    /// Collects all remaining output, then checks the error slot.
    pub async fn collect(mut self) -> Result<Vec<O>, Error> {
        let mut items = Vec::new();
        while let Some(item) = self.recv().await {
            items.push(item);
        }
        self.finish().await?;
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SourceError;
    use std::time::Duration;

    #[tokio::test]
    async fn items_pass_through_in_order() {
        let (tx, out) = PipelineBuilder::<i32, i32>::new()
            .map(|n| n * 2)
            .filter_map(|n| if n % 4 == 0 { Some(n) } else { None })
            .build();
        for n in 1..=8 {
            tx.send(n).await.unwrap();
        }
        drop(tx);
        assert_eq!(out.collect().await.unwrap(), vec![4, 8, 12, 16]);
    }

    #[tokio::test]
    async fn paused_consumer_still_sees_every_item() {
        let (tx, mut out) = PipelineBuilder::<i32, i32>::with_capacity(2)
            .map(|n| n + 1)
            .build();
        let feeder = tokio::spawn(async move {
            for n in 0..32 {
                tx.send(n).await.unwrap();
            }
        });
        // Pause mid-stream while the bounded buffers fill up.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut seen = Vec::new();
        while let Some(n) = out.recv().await {
            seen.push(n);
            if seen.len() == 5 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
        feeder.await.unwrap();
        assert_eq!(seen, (1..=32).collect::<Vec<_>>());
        out.finish().await.unwrap();
    }

    #[tokio::test]
    async fn first_error_wins_and_is_surfaced_once() {
        let (tx, out) = PipelineBuilder::<i32, i32>::new()
            .stage(|mut rx: mpsc::Receiver<i32>, tx: mpsc::Sender<i32>, err: ErrorSink| async move {
                while let Some(item) = rx.recv().await {
                    if item < 0 {
                        err.raise(Error::Source(SourceError::Io(std::io::Error::other(
                            format!("bad item {}", item),
                        ))));
                        continue;
                    }
                    if tx.send(item).await.is_err() {
                        break;
                    }
                }
            })
            .build();
        for n in [1, -1, 2, -2] {
            tx.send(n).await.unwrap();
        }
        drop(tx);
        let err = out.collect().await.unwrap_err();
        assert!(err.to_string().contains("bad item -1"));
    }

    #[tokio::test]
    async fn close_propagates_through_every_stage() {
        let (tx, out) = PipelineBuilder::<i32, i32>::new()
            .map(|n| n)
            .map(|n| n)
            .map(|n| n)
            .build();
        drop(tx);
        assert!(out.collect().await.unwrap().is_empty());
    }
}
