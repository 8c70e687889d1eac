//! Progress event bus: one producer task, one consumer loop, one tagged channel.
//!
//! The channel holds a single slot, so a producer suspends until the consumer has
//! taken the previous event. Terminal events (`Done`/`Error`) can only be sent by
//! consuming the [`Emitter`], which makes writing after termination impossible.

use std::fmt::Display;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{MdaiError, MdaiResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// A new step started; renderers show it as the title.
    Task(String),
    Message(String),
    Debug(String),
    /// Terminal: the run failed. Carries the rendered error chain.
    Error(String),
    /// Terminal: the run completed.
    Done,
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool { matches!(self, ProgressEvent::Error(_) | ProgressEvent::Done) }
}

/// Sink used by components that report progress but don't own a run.
#[async_trait::async_trait]
pub trait Progress: Send + Sync {
    async fn message(&self, text: &str);
    async fn debug(&self, text: &str);
}

/// Build a connected emitter/stream pair.
pub fn channel() -> (Emitter, EventStream) {
    let (tx, rx) = mpsc::channel(1);
    let cancel = CancellationToken::new();
    (Emitter { tx, cancel: cancel.clone() }, EventStream { rx, cancel })
}

/// Producer half. Not `Clone`: exactly one writer per run.
#[derive(Debug)]
pub struct Emitter {
    tx: mpsc::Sender<ProgressEvent>,
    cancel: CancellationToken,
}

impl Emitter {
    async fn send(&self, ev: ProgressEvent) {
        // consumer gone: same as a stop request
        if self.tx.send(ev).await.is_err() {
            self.cancel.cancel();
        }
    }

    pub async fn task(&self, name: impl Into<String>) {
        let name = name.into();
        debug!(task = %name, "task");
        self.send(ProgressEvent::Task(name)).await;
    }

    pub fn is_cancelled(&self) -> bool { self.cancel.is_cancelled() }

    /// Step boundary: bail out if the consumer asked us to stop.
    pub fn checkpoint(&self) -> MdaiResult<()> {
        if self.is_cancelled() { Err(MdaiError::Cancelled) } else { Ok(()) }
    }

    pub async fn done(self) { self.send(ProgressEvent::Done).await; }

    pub async fn fail(self, err: impl Display) {
        let text = format!("{:#}", err);
        error!(error = %text, "run failed");
        self.send(ProgressEvent::Error(text)).await;
    }

    /// Run `work` on its own task and finish the stream with exactly one terminal event.
    /// The join handle yields the same outcome for programmatic callers.
    pub fn spawn_run<T, F>(self, work: F) -> JoinHandle<anyhow::Result<T>>
    where
        T: Send + 'static,
        F: for<'a> FnOnce(&'a Emitter) -> BoxFuture<'a, anyhow::Result<T>> + Send + 'static,
    {
        tokio::spawn(async move {
            let res = work(&self).await;
            match &res {
                Ok(_) => self.done().await,
                Err(e) if self.is_cancelled() => info!(error = %e, "run stopped after cancellation"),
                Err(e) => self.fail(e).await,
            }
            res
        })
    }
}

#[async_trait::async_trait]
impl Progress for Emitter {
    async fn message(&self, text: &str) { self.send(ProgressEvent::Message(text.to_string())).await; }
    async fn debug(&self, text: &str) { self.send(ProgressEvent::Debug(text.to_string())).await; }
}

/// Consumer half.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::Receiver<ProgressEvent>,
    cancel: CancellationToken,
}

impl EventStream {
    /// Next event in emission order; `None` once the producer is gone.
    pub async fn recv(&mut self) -> Option<ProgressEvent> { self.rx.recv().await }

    /// Ask the producer to stop at its next step boundary.
    pub fn cancel(&self) { self.cancel.cancel(); }

    pub fn is_cancelled(&self) -> bool { self.cancel.is_cancelled() }

    /// Drain everything until the stream ends. Test and plain-log helper.
    pub async fn collect(mut self) -> Vec<ProgressEvent> {
        let mut out = Vec::new();
        while let Some(ev) = self.recv().await { out.push(ev); }
        out
    }
}

/// Tracing-backed sink for single-shot commands without a presentation loop.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogProgress;

#[async_trait::async_trait]
impl Progress for LogProgress {
    async fn message(&self, text: &str) { info!("{}", text); }
    async fn debug(&self, text: &str) { debug!("{}", text); }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[tokio::test]
    async fn events_arrive_in_order_and_end_with_done() {
        let (em, stream) = channel();
        let h = em.spawn_run(|em| async move {
            em.task("step").await;
            em.message("hello").await;
            em.debug("detail").await;
            Ok(7)
        }.boxed());
        let evs = stream.collect().await;
        assert_eq!(evs, vec![
            ProgressEvent::Task("step".into()),
            ProgressEvent::Message("hello".into()),
            ProgressEvent::Debug("detail".into()),
            ProgressEvent::Done,
        ]);
        assert_eq!(h.await.unwrap().unwrap(), 7);
    }

    #[tokio::test]
    async fn failure_emits_single_error_and_returns_it() {
        let (em, stream) = channel();
        let h = em.spawn_run(|em| async move {
            em.message("before").await;
            Err::<(), _>(anyhow::anyhow!("chart exploded").context("installing x"))
        }.boxed());
        let evs = stream.collect().await;
        assert_eq!(evs.len(), 2);
        assert_eq!(evs[1], ProgressEvent::Error("installing x: chart exploded".into()));
        let err = h.await.unwrap().unwrap_err();
        assert_eq!(format!("{:#}", err), "installing x: chart exploded");
    }

    #[tokio::test]
    async fn cancel_reaches_producer() {
        let (em, mut stream) = channel();
        let h = em.spawn_run::<(), _>(|em| async move {
            em.task("first").await;
            loop {
                if let Err(e) = em.checkpoint() { return Err(anyhow::Error::new(e)); }
                em.message("tick").await;
            }
        }.boxed());
        assert_eq!(stream.recv().await, Some(ProgressEvent::Task("first".into())));
        stream.cancel();
        drop(stream);
        let err = h.await.unwrap().unwrap_err();
        assert!(matches!(err.downcast_ref::<MdaiError>(), Some(MdaiError::Cancelled)), "err={:#}", err);
    }
}
