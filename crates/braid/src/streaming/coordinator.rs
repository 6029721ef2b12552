use super::event::StreamEvent;
use crate::{
    channel::{ChannelEntry, ResultReceiver},
    disconnect::DisconnectMonitor,
    error::{Error, ErrorCategory, Result},
    response::{Usage, create_response},
    types::StepRecord,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Aggregator states.
///
/// `Running` and `Draining` loop until the stream either completes (`Done`)
/// or fails (`Aborted`). Completion is only declared after two separate
/// observations of an empty channel, the second one in `Draining`.
#[derive(Debug)]
enum State {
    Running,
    Draining,
    Done,
    Aborted(Error),
}

/// Summary of a completed stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamSummary {
    /// Fragments delivered to the caller, excluding the end-of-stream marker.
    pub fragments: usize,
    /// Usage of the last record observed.
    pub usage: Usage,
}

/// Single consumer of a request's result channel in streaming mode.
///
/// Converts each record into a [`StreamEvent::Fragment`] as soon as it
/// arrives, tracks which workers have finished, and ends the stream with
/// either [`StreamEvent::Done`] or exactly one [`StreamEvent::Error`].
pub(crate) struct StreamingAggregator {
    request_id: Arc<str>,
    model: Arc<str>,
    rx: ResultReceiver,
    events: mpsc::Sender<StreamEvent>,
    monitor: DisconnectMonitor,
    abort: CancellationToken,
    shutdown: CancellationToken,
    finished: Vec<bool>,
    remaining: usize,
    summary: StreamSummary,
}

impl StreamingAggregator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        request_id: Arc<str>,
        model: Arc<str>,
        n: usize,
        rx: ResultReceiver,
        events: mpsc::Sender<StreamEvent>,
        monitor: DisconnectMonitor,
        abort: CancellationToken,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            request_id,
            model,
            rx,
            events,
            monitor,
            abort,
            shutdown,
            finished: vec![false; n],
            remaining: n,
            summary: StreamSummary::default(),
        }
    }

    /// Drains the result channel until the stream completes or aborts.
    ///
    /// # Errors
    ///
    /// Returns the cause of an abort: the first generation failure observed,
    /// [`Error::ClientDisconnected`], [`Error::ServiceShutdown`],
    /// [`Error::Aborted`] when the request was cancelled by id, or
    /// [`Error::ChannelError`] if every worker went away without finishing
    /// while the request was still live.
    pub async fn run(mut self) -> Result<StreamSummary> {
        let mut state = State::Running;

        loop {
            state = match state {
                State::Running => self.step().await,
                State::Draining => {
                    // A worker may have pushed between the emptiness check
                    // that got us here and now.
                    if self.rx.is_empty() {
                        State::Done
                    } else {
                        State::Running
                    }
                }
                State::Done => return Ok(self.finish().await),
                State::Aborted(err) => return Err(self.abort_with(err).await),
            };
        }
    }

    async fn step(&mut self) -> State {
        if self.abort.is_cancelled() {
            return self.interrupted();
        }

        let monitor = &self.monitor;
        let abort = &self.abort;
        let entry = tokio::select! {
            biased;
            entry = self.rx.pop() => Some(entry),
            () = monitor.fired() => None,
            () = abort.cancelled() => None,
        };

        let Some(entry) = entry else {
            return self.interrupted();
        };

        match entry {
            Some(ChannelEntry::Record(record)) => self.deliver(record).await,
            Some(ChannelEntry::Failed(err)) => State::Aborted(err),
            Some(ChannelEntry::Exhausted { index }) => {
                self.mark_finished(index);
                self.next_state()
            }
            // Workers drop their senders once they observe cancellation.
            None if self.abort.is_cancelled() => self.interrupted(),
            None => State::Aborted(Error::ChannelError {
                context: format!(
                    "{} of {} workers exited without finishing",
                    self.remaining,
                    self.finished.len()
                ),
            }),
        }
    }

    async fn deliver(&mut self, record: StepRecord) -> State {
        let index = record.index;
        if self.finished.get(index).copied().unwrap_or(true) {
            tracing::warn!("Dropping record for choice {index}, which already finished");
            return self.next_state();
        }

        let terminal = record.is_terminal();
        let fragment = create_response(
            &self.request_id,
            &self.model,
            core::slice::from_ref(&record),
        );

        if self
            .events
            .send(StreamEvent::Fragment(fragment))
            .await
            .is_err()
        {
            // The receiving end only goes away with the client.
            self.monitor.fire();
            return self.interrupted();
        }

        self.summary.fragments += 1;
        self.summary.usage = Usage::new(record.prompt_tokens, record.generated_tokens);

        if terminal {
            self.mark_finished(index);
        }

        self.next_state()
    }

    fn mark_finished(&mut self, index: usize) {
        match self.finished.get_mut(index) {
            Some(done) if !*done => {
                *done = true;
                self.remaining -= 1;
                tracing::trace!(
                    "Choice {index} finished, {} remaining, {} queued",
                    self.remaining,
                    self.rx.len()
                );
            }
            Some(_) => {}
            None => tracing::warn!("Ignoring completion of unknown choice {index}"),
        }
    }

    fn next_state(&self) -> State {
        if self.remaining == 0 && self.rx.is_empty() {
            State::Draining
        } else {
            State::Running
        }
    }

    /// Handles a cancelled abort token: a client disconnect when the monitor
    /// fired, a service shutdown when the shutdown token is cancelled, and an
    /// abort by id otherwise.
    fn interrupted(&mut self) -> State {
        let cause = if self.monitor.is_fired() {
            Error::ClientDisconnected
        } else if self.shutdown.is_cancelled() {
            Error::ServiceShutdown
        } else {
            Error::Aborted
        };
        self.abort.cancel();

        // Entries queued before the interruption are discarded, but a
        // generation failure among them is still the reported cause.
        while let Some(entry) = self.rx.try_pop() {
            if let ChannelEntry::Failed(err) = entry {
                return State::Aborted(err);
            }
        }

        State::Aborted(cause)
    }

    async fn finish(self) -> StreamSummary {
        if self.events.send(StreamEvent::Done).await.is_err() {
            tracing::debug!("Client left before the end-of-stream marker");
        }

        tracing::info!(
            "Finished streaming completion request {}",
            self.request_id
        );
        self.summary
    }

    async fn abort_with(self, err: Error) -> Error {
        self.abort.cancel();

        match err.category() {
            ErrorCategory::ClientDisconnected => {
                tracing::debug!("Streaming completion {} aborted", self.request_id);
            }
            ErrorCategory::ServiceUnavailable => {
                tracing::warn!("Completion {} aborted: {err}", self.request_id);
            }
            _ => tracing::error!(
                "Completion {} aborted: {err}. Please check the server console.",
                self.request_id
            ),
        }

        // Best effort: the receiver is usually gone after a disconnect.
        if let Err(_e) = self.events.send(StreamEvent::Error(err.report())).await {
            tracing::debug!("Failed to forward abort to client");
        }

        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::{ResultSender, result_channel},
        engine::EngineError,
    };
    use core::time::Duration;

    struct Setup {
        aggregator: StreamingAggregator,
        tx: ResultSender,
        events: mpsc::Receiver<StreamEvent>,
        abort: CancellationToken,
        shutdown: CancellationToken,
        _client: mpsc::Receiver<()>,
    }

    fn setup(n: usize) -> Setup {
        let (tx, rx) = result_channel();
        let (events_tx, events) = mpsc::channel(16);
        let (client_tx, client) = mpsc::channel(1);
        let shutdown = CancellationToken::new();
        let abort = shutdown.child_token();
        let monitor = DisconnectMonitor::spawn(
            "req".into(),
            client_tx,
            Duration::from_secs(60),
            abort.clone(),
        );

        let aggregator = StreamingAggregator::new(
            "req".into(),
            "model".into(),
            n,
            rx,
            events_tx,
            monitor,
            abort.clone(),
            shutdown.clone(),
        );

        Setup {
            aggregator,
            tx,
            events,
            abort,
            shutdown,
            _client: client,
        }
    }

    fn record(index: usize, record: StepRecord) -> ChannelEntry {
        ChannelEntry::Record(StepRecord { index, ..record })
    }

    fn drain(events: &mut mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn queued_failure_wins_over_disconnect() {
        let Setup {
            aggregator,
            tx,
            mut events,
            _client,
            ..
        } = setup(2);

        assert!(tx.push(record(0, StepRecord::chunk("hi", 1))));
        assert!(tx.push(ChannelEntry::Failed(Error::Generation {
            index: 1,
            source: EngineError::new("device lost"),
        })));
        assert!(aggregator.monitor.fire());

        let outcome = aggregator.run().await;

        assert!(matches!(outcome, Err(Error::Generation { index: 1, .. })));
        assert!(matches!(
            drain(&mut events).as_slice(),
            [StreamEvent::Error(report)] if report.category == ErrorCategory::GenerationFailure
        ));
    }

    #[tokio::test]
    async fn late_entries_are_consumed_before_done() {
        let Setup {
            aggregator,
            tx,
            mut events,
            _client,
            ..
        } = setup(2);

        assert!(tx.push(record(0, StepRecord::finish("a", "stop", 1, 1))));
        assert!(tx.push(record(1, StepRecord::finish("b", "stop", 1, 1))));
        // Both choices are done, but these are still queued.
        assert!(tx.push(record(0, StepRecord::chunk("late", 2))));
        assert!(tx.push(ChannelEntry::Exhausted { index: 1 }));

        let summary = aggregator.run().await.unwrap();

        assert_eq!(summary.fragments, 2);
        let events = drain(&mut events);
        assert_eq!(events.len(), 3);
        assert_eq!(events[2], StreamEvent::Done);
    }

    #[tokio::test]
    async fn closed_channel_after_shutdown_reports_shutdown() {
        let Setup {
            aggregator,
            tx,
            mut events,
            shutdown,
            _client,
            ..
        } = setup(2);

        let running = tokio::spawn(aggregator.run());
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Workers exit on cancellation and drop their senders right away.
        shutdown.cancel();
        drop(tx);

        assert!(matches!(running.await.unwrap(), Err(Error::ServiceShutdown)));
        assert!(matches!(
            drain(&mut events).as_slice(),
            [StreamEvent::Error(report)] if report.category == ErrorCategory::ServiceUnavailable
        ));
    }

    #[tokio::test]
    async fn closed_channel_after_abort_reports_abort() {
        let Setup {
            aggregator,
            tx,
            abort,
            _client,
            ..
        } = setup(1);

        let running = tokio::spawn(aggregator.run());
        tokio::time::sleep(Duration::from_millis(20)).await;

        abort.cancel();
        drop(tx);

        assert!(matches!(running.await.unwrap(), Err(Error::Aborted)));
    }

    #[tokio::test]
    async fn closed_channel_while_live_is_a_channel_error() {
        let Setup {
            aggregator,
            tx,
            _client,
            ..
        } = setup(3);
        drop(tx);

        match aggregator.run().await {
            Err(Error::ChannelError { context }) => {
                assert_eq!(context, "3 of 3 workers exited without finishing");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
