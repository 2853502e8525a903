//! Event Pipeline: wraps one agent run and frames its activity as an ordered,
//! cancellable stream of [`ToolEvent`]s.
//!
//! Runs move `Idle -> Running -> {Completed | Errored | Cancelled}`. Completed
//! and errored runs end with exactly one terminal event; a cancelled run stops
//! writing as soon as cancellation is observed.

use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use super::translation::{complete_payload, error_payload, init_payload, translate_agent_event};
use super::types::{EventType, ToolEvent};
use crate::agent::{AgentEvent, EventObserver};
use crate::sessions::{RunGuard, SessionContext};
use crate::types::{Error, PipelineConfig, Result, RunId, SessionId};

/// Client side of a run. Dropping it cancels the run.
#[derive(Debug)]
pub struct EventStream {
    session_id: SessionId,
    run_id: RunId,
    rx: mpsc::Receiver<ToolEvent>,
    _cancel_on_drop: DropGuard,
}

impl EventStream {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }
}

impl Stream for EventStream {
    type Item = ToolEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<ToolEvent>> {
        self.rx.poll_recv(cx)
    }
}

/// Stamps sequence numbers and writes events in order. The counter lock is
/// held across the channel send so sequence order equals delivery order.
#[derive(Debug)]
pub struct EventSink {
    session_id: SessionId,
    tx: mpsc::Sender<ToolEvent>,
    cancel: CancellationToken,
    next_sequence: Mutex<u64>,
}

impl EventSink {
    pub fn new(
        session_id: SessionId,
        tx: mpsc::Sender<ToolEvent>,
        cancel: CancellationToken,
        first_sequence: u64,
    ) -> Self {
        Self {
            session_id,
            tx,
            cancel,
            next_sequence: Mutex::new(first_sequence),
        }
    }

    pub async fn write(&self, event_type: EventType, payload: Value) -> Result<u64> {
        let mut next = self.next_sequence.lock().await;
        if self.cancel.is_cancelled() {
            return Err(Error::cancelled("event stream closed"));
        }
        let sequence = *next;
        let event = ToolEvent {
            event_type,
            session_id: self.session_id.clone(),
            sequence,
            payload,
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Error::cancelled("event stream closed")),
            sent = self.tx.send(event) => {
                if sent.is_err() {
                    // receiver gone: the client disconnected
                    self.cancel.cancel();
                    return Err(Error::cancelled("client disconnected"));
                }
            }
        }
        *next += 1;
        Ok(sequence)
    }

    /// Sequence number the next write would use.
    pub async fn next_sequence(&self) -> u64 {
        *self.next_sequence.lock().await
    }
}

#[async_trait]
impl EventObserver for EventSink {
    async fn emit(&self, event: AgentEvent) -> Result<()> {
        let (event_type, payload) = translate_agent_event(event);
        self.write(event_type, payload).await.map(|_| ())
    }
}

#[derive(Debug, Clone)]
pub struct EventPipeline {
    config: PipelineConfig,
}

impl EventPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    /// Begin a run over the session's context.
    ///
    /// Fails with `Busy` when the session already has an active run. The
    /// returned stream is lazy, finite and not restartable.
    pub fn start(&self, session: &Arc<SessionContext>, input: impl Into<String>) -> Result<EventStream> {
        let guard = session.begin_run()?;
        let cancel = guard.cancel_token().clone();
        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        let run_id = RunId::new();
        let session_id = session.id().clone();

        tokio::spawn(drive(
            guard,
            run_id.clone(),
            input.into(),
            tx,
            self.config.cancel_grace,
        ));

        Ok(EventStream {
            session_id,
            run_id,
            rx,
            _cancel_on_drop: cancel.drop_guard(),
        })
    }
}

async fn drive(
    mut guard: RunGuard,
    run_id: RunId,
    input: String,
    tx: mpsc::Sender<ToolEvent>,
    grace: Duration,
) {
    let session = Arc::clone(guard.session());
    let cancel = guard.cancel_token().clone();
    let overlay = session.overlay();
    let first = guard.next_sequence;
    let sink = EventSink::new(session.id().clone(), tx, cancel.clone(), first);
    info!(session_id = %session.id(), run_id = %run_id, "run started");

    let outcome = match sink.write(EventType::Init, init_payload(&run_id, &input)).await {
        Err(e) => Err(e),
        Ok(_) => {
            let state = &mut *guard;
            let run = state.agent.run(&mut state.history, &overlay, &input, &sink, &cancel);
            tokio::pin!(run);
            tokio::select! {
                result = &mut run => result,
                // cancellation reaches remote calls through the token; past the
                // grace period the run is dropped where it stands
                _ = async {
                    cancel.cancelled().await;
                    tokio::time::sleep(grace).await;
                } => {
                    warn!(session_id = %session.id(), run_id = %run_id, "run ignored cancellation; dropping it");
                    Err(Error::cancelled("grace period elapsed"))
                }
            }
        }
    };

    match outcome {
        Ok(summary) => {
            if sink
                .write(EventType::Complete, complete_payload(&run_id, summary.iterations))
                .await
                .is_ok()
            {
                info!(session_id = %session.id(), run_id = %run_id, iterations = summary.iterations, "run completed");
            }
        }
        Err(_) if cancel.is_cancelled() => {
            info!(session_id = %session.id(), run_id = %run_id, "run cancelled");
        }
        Err(e) => {
            debug!(session_id = %session.id(), run_id = %run_id, code = e.code(), error = %e, "run failed");
            if sink.write(EventType::Error, error_payload(&run_id, &e)).await.is_ok() {
                warn!(session_id = %session.id(), run_id = %run_id, code = e.code(), "run errored");
            }
        }
    }
    guard.next_sequence = sink.next_sequence().await;
}
