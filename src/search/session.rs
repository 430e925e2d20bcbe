//! Search Session
//!
//! The orchestrating state machine for one live search. A session owns the
//! transport channel, the filter controller, the stats aggregator, the
//! entry demultiplexer, and the progress tracker; it routes every inbound
//! frame to its component and exposes the five output streams plus the
//! filter-mutation entry point.
//!
//! ## Lifecycle
//!
//! `Connecting → Active → (Refiltering ⇄ Active) → Completed | Failed`,
//! with `Disposed` reachable from any live state via [`SearchSession::dispose`].
//!
//! ## Ordering
//!
//! A single driver task owns the inbound receiver and the command receiver,
//! so frames are processed in strict arrival order. Refilter requests are
//! serialized: at most one unacknowledged refilter frame is ever in flight,
//! and later mutations queue behind it.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};

use crate::config::ClientConfig;

use super::entries::{EntryBatch, EntryDemux};
use super::error::{SearchError, SearchResult};
use super::filter::{FilterController, FilterDiff, FilterUpdate, SearchFilter, TimeRange};
use super::frames::{ErrorCode, RequestFrame, ServerFrame};
use super::progress::ProgressTracker;
use super::stats::{FrequencyHistogram, SearchStats, StatsAggregator};
use super::stream::{OutputChannel, OutputStream};
use super::transport::{TransportEvent, TransportFactory, WsTransportFactory};

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Channel opening, subscribe not yet acknowledged
    Connecting,
    /// Subscribed; frames are flowing
    Active,
    /// A refilter request is awaiting acknowledgment
    Refiltering,
    /// The search finished; all streams completed
    Completed,
    /// The session terminated with an error
    Failed,
    /// The caller disposed the session
    Disposed,
}

/// Options for [`SearchClient::subscribe`]
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Initial filter; defaults are applied to unspecified fields
    pub filter: Option<FilterUpdate>,
    /// Arbitrary metadata echoed back in stats emissions
    pub metadata: Option<serde_json::Value>,
}

impl SubscribeOptions {
    /// Set the initial filter
    pub fn with_filter(mut self, filter: FilterUpdate) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Attach caller metadata
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Entry point for opening live search subscriptions
pub struct SearchClient {
    factory: Arc<dyn TransportFactory>,
    config: ClientConfig,
}

impl SearchClient {
    /// Create a client using the WebSocket transport from configuration
    pub fn new(config: ClientConfig) -> Self {
        let factory = Arc::new(WsTransportFactory::from_config(&config));
        Self { factory, config }
    }

    /// Create a client with a caller-provided transport factory
    pub fn with_factory(config: ClientConfig, factory: Arc<dyn TransportFactory>) -> Self {
        Self { factory, config }
    }

    /// Open a live search subscription.
    ///
    /// Connects a fresh transport channel, sends the subscribe request, and
    /// waits for the backend acknowledgment. Fails with
    /// [`SearchError::Connection`] if the channel cannot be established and
    /// [`SearchError::QuerySyntax`] if the backend rejects the query.
    pub async fn subscribe(
        &self,
        query: impl Into<String>,
        range: TimeRange,
        options: SubscribeOptions,
    ) -> SearchResult<SearchSession> {
        let query = query.into();
        let controller = FilterController::new(range, options.filter)?;
        let mut channel = self.factory.connect().await?;

        channel
            .outbound
            .send(RequestFrame::Subscribe {
                query: query.clone(),
                range,
                filter: *controller.current(),
                metadata: options.metadata,
            })
            .await
            .map_err(|_| SearchError::connection("transport closed before subscribe"))?;

        // Wait for the acknowledgment; data frames arriving early are kept
        // and routed once the driver starts
        let mut pending = Vec::new();
        let (search_id, effective_query) = loop {
            match channel.inbound.recv().await {
                Some(TransportEvent::Frame(ServerFrame::Ack {
                    search_id,
                    effective_query,
                })) => break (search_id, effective_query.unwrap_or_else(|| query.clone())),
                Some(TransportEvent::Frame(ServerFrame::Error { code, message })) => {
                    return Err(match code {
                        ErrorCode::QuerySyntax => SearchError::QuerySyntax { message },
                        _ => SearchError::connection(message),
                    });
                }
                Some(TransportEvent::Frame(frame)) => pending.push(frame),
                Some(TransportEvent::Malformed { detail }) => {
                    tracing::warn!(%detail, "dropping malformed frame before acknowledgment");
                }
                Some(TransportEvent::Lost { reason }) => {
                    return Err(SearchError::connection(reason));
                }
                None => return Err(SearchError::connection("transport closed")),
            }
        };

        tracing::info!(
            search_id = %search_id,
            query = %query,
            effective_query = %effective_query,
            "search subscription acknowledged"
        );

        let outputs = Arc::new(Outputs::new(self.config.search.stream_capacity));
        let (state_tx, state_rx) = watch::channel(SessionState::Active);
        let (filter_tx, filter_rx) = watch::channel(*controller.current());
        let (command_tx, command_rx) = mpsc::channel(16);

        let driver = Driver {
            search_id: search_id.clone(),
            outbound: channel.outbound,
            controller,
            aggregator: StatsAggregator::new(range),
            demux: EntryDemux::new(),
            progress: ProgressTracker::new(),
            outputs: Arc::clone(&outputs),
            state: state_tx,
            filter_watch: filter_tx,
            in_flight: None,
            queued: VecDeque::new(),
            entries_finished: false,
            stats_finished: false,
            malformed_count: 0,
            malformed_threshold: self.config.search.malformed_frame_threshold,
        };
        tokio::spawn(driver.run(channel.inbound, command_rx, pending));

        Ok(SearchSession {
            search_id,
            query,
            effective_query,
            commands: command_tx,
            state: state_rx,
            filter: filter_rx,
            outputs,
        })
    }
}

/// Handle to one live search subscription
#[derive(Debug)]
pub struct SearchSession {
    search_id: String,
    query: String,
    effective_query: String,
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<SessionState>,
    filter: watch::Receiver<SearchFilter>,
    outputs: Arc<Outputs>,
}

impl SearchSession {
    /// Backend-assigned search identifier
    pub fn search_id(&self) -> &str {
        &self.search_id
    }

    /// Literal user query
    pub fn query(&self) -> &str {
        &self.query
    }

    /// Query after server-side macro expansion
    pub fn effective_query(&self) -> &str {
        &self.effective_query
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Filter currently in effect
    pub fn filter(&self) -> SearchFilter {
        *self.filter.borrow()
    }

    /// Entry batches in backend-delivery order. Terminates when the search
    /// completes or the session is disposed; a `set_filter` changing
    /// `entries_offset` reopens delivery within the same stream.
    pub fn entries(&self) -> OutputStream<EntryBatch> {
        self.outputs.entries.subscribe()
    }

    /// Monotonic completion percentage, terminal emission 100
    pub fn progress(&self) -> OutputStream<u8> {
        self.outputs.progress.subscribe()
    }

    /// Running pipeline statistics, one emission per backend update
    pub fn stats(&self) -> OutputStream<SearchStats> {
        self.outputs.stats.subscribe()
    }

    /// Histogram over the full search range at the overview granularity
    pub fn stats_overview(&self) -> OutputStream<FrequencyHistogram> {
        self.outputs.overview.subscribe()
    }

    /// Histogram over the current zoom window at the zoom granularity
    pub fn stats_zoom(&self) -> OutputStream<FrequencyHistogram> {
        self.outputs.zoom.subscribe()
    }

    /// Merge a partial filter update into the session's filter.
    ///
    /// Returns the merged filter once it is in effect. Changes to the date
    /// range or entry page are acknowledged by the backend before they
    /// commit; granularity-only changes re-bucket locally and return
    /// immediately. A rejected update surfaces only here — the previous
    /// filter stays in effect and every stream keeps flowing.
    pub async fn set_filter(&self, update: FilterUpdate) -> SearchResult<SearchFilter> {
        let (respond, result) = oneshot::channel();
        self.commands
            .send(Command::SetFilter { update, respond })
            .await
            .map_err(|_| SearchError::Closed)?;
        result.await.map_err(|_| SearchError::Closed)?
    }

    /// Cancel the search and complete all output streams. Idempotent.
    pub async fn dispose(&self) {
        let (respond, done) = oneshot::channel();
        if self
            .commands
            .send(Command::Dispose { respond })
            .await
            .is_ok()
        {
            let _ = done.await;
        }
    }
}

/// Caller mutations, serialized through the driver
#[derive(Debug)]
enum Command {
    SetFilter {
        update: FilterUpdate,
        respond: oneshot::Sender<SearchResult<SearchFilter>>,
    },
    Dispose {
        respond: oneshot::Sender<()>,
    },
}

/// The five output channels
#[derive(Debug)]
struct Outputs {
    entries: OutputChannel<EntryBatch>,
    progress: OutputChannel<u8>,
    stats: OutputChannel<SearchStats>,
    overview: OutputChannel<FrequencyHistogram>,
    zoom: OutputChannel<FrequencyHistogram>,
}

impl Outputs {
    fn new(capacity: usize) -> Self {
        Self {
            entries: OutputChannel::new(capacity),
            progress: OutputChannel::new(capacity),
            stats: OutputChannel::new(capacity),
            overview: OutputChannel::new(capacity),
            zoom: OutputChannel::new(capacity),
        }
    }

    fn complete_all(&self) {
        self.entries.complete();
        self.progress.complete();
        self.stats.complete();
        self.overview.complete();
        self.zoom.complete();
    }

    fn fail_all(&self, err: &SearchError) {
        self.entries.fail(err.clone());
        self.progress.fail(err.clone());
        self.stats.fail(err.clone());
        self.overview.fail(err.clone());
        self.zoom.fail(err.clone());
    }

    fn receiver_total(&self) -> usize {
        self.entries.receiver_count()
            + self.progress.receiver_count()
            + self.stats.receiver_count()
            + self.overview.receiver_count()
            + self.zoom.receiver_count()
    }
}

/// A refilter awaiting backend acknowledgment. Nothing commits until the
/// ack arrives, so a rejection leaves the previous filter in effect.
#[derive(Debug)]
struct InFlightRefilter {
    merged: SearchFilter,
    diff: FilterDiff,
    respond: oneshot::Sender<SearchResult<SearchFilter>>,
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// The session driver: single task owning all routing and re-request logic
struct Driver {
    search_id: String,
    outbound: mpsc::Sender<RequestFrame>,
    controller: FilterController,
    aggregator: StatsAggregator,
    demux: EntryDemux,
    progress: ProgressTracker,
    outputs: Arc<Outputs>,
    state: watch::Sender<SessionState>,
    filter_watch: watch::Sender<SearchFilter>,
    in_flight: Option<InFlightRefilter>,
    queued: VecDeque<(FilterUpdate, oneshot::Sender<SearchResult<SearchFilter>>)>,
    entries_finished: bool,
    stats_finished: bool,
    malformed_count: u32,
    malformed_threshold: u32,
}

impl Driver {
    async fn run(
        mut self,
        mut inbound: mpsc::Receiver<TransportEvent>,
        mut commands: mpsc::Receiver<Command>,
        pending: Vec<ServerFrame>,
    ) {
        // Frames that arrived between subscribe and acknowledgment
        for frame in pending {
            if self.handle_frame(frame).await == Flow::Stop {
                return;
            }
        }

        let mut commands_closed = false;
        loop {
            tokio::select! {
                command = commands.recv(), if !commands_closed => {
                    match command {
                        Some(command) => {
                            if self.handle_command(command).await == Flow::Stop {
                                return;
                            }
                        }
                        None => {
                            // Session handle dropped without dispose. Keep
                            // driving while any stream observer remains.
                            commands_closed = true;
                            if self.outputs.receiver_total() == 0 {
                                self.cancel_abandoned().await;
                                return;
                            }
                        }
                    }
                }
                event = inbound.recv() => {
                    let flow = match event {
                        Some(TransportEvent::Frame(frame)) => self.handle_frame(frame).await,
                        Some(TransportEvent::Malformed { detail }) => self.handle_malformed(detail),
                        Some(TransportEvent::Lost { reason }) => self.fail(reason),
                        None => self.fail("transport closed"),
                    };
                    if flow == Flow::Stop {
                        return;
                    }
                    if commands_closed && self.outputs.receiver_total() == 0 {
                        self.cancel_abandoned().await;
                        return;
                    }
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Command) -> Flow {
        match command {
            Command::SetFilter { update, respond } => {
                if self.in_flight.is_some() {
                    // Predecessor still pending: queue, never send two
                    // unacknowledged refilter frames
                    self.queued.push_back((update, respond));
                    Flow::Continue
                } else {
                    self.process_mutation(update, respond).await
                }
            }
            Command::Dispose { respond } => {
                let _ = self
                    .outbound
                    .send(RequestFrame::Cancel {
                        search_id: self.search_id.clone(),
                    })
                    .await;
                self.outputs.complete_all();
                self.resolve_pending(&SearchError::Closed);
                self.set_state(SessionState::Disposed);
                tracing::info!(search_id = %self.search_id, "search session disposed");
                let _ = respond.send(());
                Flow::Stop
            }
        }
    }

    async fn process_mutation(
        &mut self,
        update: FilterUpdate,
        respond: oneshot::Sender<SearchResult<SearchFilter>>,
    ) -> Flow {
        let (merged, diff) = match self.controller.preview(&update) {
            Ok(result) => result,
            Err(e) => {
                let _ = respond.send(Err(e));
                return Flow::Continue;
            }
        };

        if !diff.any() {
            let _ = respond.send(Ok(merged));
            return Flow::Continue;
        }

        if diff.needs_refilter() {
            let frame = RequestFrame::Refilter {
                search_id: self.search_id.clone(),
                filter: merged,
            };
            if self.outbound.send(frame).await.is_err() {
                let _ = respond.send(Err(SearchError::connection("transport closed")));
                return self.fail("transport closed while refiltering");
            }
            tracing::debug!(search_id = %self.search_id, "refilter request sent");
            self.in_flight = Some(InFlightRefilter {
                merged,
                diff,
                respond,
            });
            self.set_state(SessionState::Refiltering);
        } else {
            // Granularity-only change: re-bucket locally, nothing to send
            self.controller.commit(merged);
            self.filter_watch.send_replace(merged);
            self.emit_rebuckets(&diff, &merged);
            let _ = respond.send(Ok(merged));
        }
        Flow::Continue
    }

    async fn handle_frame(&mut self, frame: ServerFrame) -> Flow {
        match frame {
            ServerFrame::EntryBatch { entries, finished } => {
                let batch = self.demux.ingest(entries, finished);
                self.outputs.entries.emit(batch);
                if self.demux.is_finished() {
                    self.entries_finished = true;
                    return self.check_completion();
                }
                Flow::Continue
            }
            ServerFrame::StatsUpdate {
                pipeline,
                query,
                effective_query,
                min_zoom_window,
                metadata,
                frequency,
                finished,
            } => {
                self.aggregator.ingest_samples(&frequency);
                let filter = *self.controller.current();

                self.outputs.stats.emit(SearchStats {
                    pipeline,
                    query,
                    effective_query,
                    metadata,
                    min_zoom_window,
                    finished,
                    filter,
                });
                self.outputs
                    .overview
                    .emit(self.aggregator.overview(filter.overview_granularity));
                self.outputs.zoom.emit(self.aggregator.zoom(&filter));

                if finished {
                    self.stats_finished = true;
                    return self.check_completion();
                }
                Flow::Continue
            }
            ServerFrame::Progress { value } => {
                if let Some(value) = self.progress.observe(value) {
                    self.outputs.progress.emit(value);
                }
                Flow::Continue
            }
            ServerFrame::Ack { .. } => self.handle_refilter_ack().await,
            ServerFrame::Error { code, message } => match code {
                ErrorCode::FilterRejected => self.handle_refilter_rejected(message).await,
                _ => self.fail(message),
            },
        }
    }

    /// Commit the acknowledged refilter and its deferred side effects
    async fn handle_refilter_ack(&mut self) -> Flow {
        let Some(inflight) = self.in_flight.take() else {
            tracing::warn!(search_id = %self.search_id, "unexpected acknowledgment frame");
            return Flow::Continue;
        };

        self.controller.commit(inflight.merged);
        self.filter_watch.send_replace(inflight.merged);
        if inflight.diff.entries_offset {
            // The entry sequence restarts for the new page
            self.demux.reopen();
            self.entries_finished = false;
        }
        self.emit_rebuckets(&inflight.diff, &inflight.merged);
        let _ = inflight.respond.send(Ok(inflight.merged));
        self.set_state(SessionState::Active);

        self.drain_queue().await
    }

    async fn handle_refilter_rejected(&mut self, message: String) -> Flow {
        let Some(inflight) = self.in_flight.take() else {
            tracing::warn!(
                search_id = %self.search_id,
                %message,
                "filter rejection with no refilter in flight"
            );
            return Flow::Continue;
        };

        // Nothing was committed: the previous filter stays in effect
        tracing::warn!(search_id = %self.search_id, %message, "refilter rejected by backend");
        let _ = inflight.respond.send(Err(SearchError::FilterRejected { message }));
        self.set_state(SessionState::Active);

        self.drain_queue().await
    }

    /// Process queued mutations until one goes in flight or the queue drains
    async fn drain_queue(&mut self) -> Flow {
        while self.in_flight.is_none() {
            let Some((update, respond)) = self.queued.pop_front() else {
                break;
            };
            if self.process_mutation(update, respond).await == Flow::Stop {
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    /// Re-emit the histograms affected by a committed filter change.
    /// Changing one granularity never perturbs the other histogram.
    fn emit_rebuckets(&self, diff: &FilterDiff, filter: &SearchFilter) {
        if diff.date_range || diff.zoom_granularity {
            self.outputs.zoom.emit(self.aggregator.zoom(filter));
        }
        if diff.overview_granularity {
            self.outputs
                .overview
                .emit(self.aggregator.overview(filter.overview_granularity));
        }
    }

    fn handle_malformed(&mut self, detail: String) -> Flow {
        self.malformed_count += 1;
        tracing::warn!(
            search_id = %self.search_id,
            %detail,
            count = self.malformed_count,
            "dropping malformed frame"
        );
        if self.malformed_count > self.malformed_threshold {
            return self.fail("malformed frame threshold exceeded");
        }
        Flow::Continue
    }

    fn check_completion(&mut self) -> Flow {
        if !(self.entries_finished && self.stats_finished) {
            return Flow::Continue;
        }
        // Terminal progress is guaranteed before the session completes
        if let Some(value) = self.progress.finalize() {
            self.outputs.progress.emit(value);
        }
        self.outputs.complete_all();
        self.resolve_pending(&SearchError::Closed);
        self.set_state(SessionState::Completed);
        tracing::info!(search_id = %self.search_id, "search completed");
        Flow::Stop
    }

    fn fail(&mut self, reason: impl Into<String>) -> Flow {
        let err = SearchError::connection(reason);
        tracing::error!(search_id = %self.search_id, error = %err, "search session failed");
        self.outputs.fail_all(&err);
        self.resolve_pending(&err);
        self.set_state(SessionState::Failed);
        Flow::Stop
    }

    /// Cancel a search whose handle and observers are all gone
    async fn cancel_abandoned(&mut self) {
        tracing::debug!(search_id = %self.search_id, "no observers remain, cancelling search");
        let _ = self
            .outbound
            .send(RequestFrame::Cancel {
                search_id: self.search_id.clone(),
            })
            .await;
        self.set_state(SessionState::Disposed);
    }

    fn resolve_pending(&mut self, err: &SearchError) {
        if let Some(inflight) = self.in_flight.take() {
            let _ = inflight.respond.send(Err(err.clone()));
        }
        for (_, respond) in self.queued.drain(..) {
            let _ = respond.send(Err(err.clone()));
        }
    }

    fn set_state(&self, state: SessionState) {
        self.state.send_replace(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::frames::{EnumeratedValue, FrequencySample, ModuleStats, SearchEntry};
    use crate::search::transport::TransportChannel;
    use async_trait::async_trait;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::time::{sleep, timeout, Duration as TokioDuration};

    /// Hands out a single pre-wired channel; a second connect is refused
    struct MockFactory {
        channel: Mutex<Option<TransportChannel>>,
    }

    #[async_trait]
    impl TransportFactory for MockFactory {
        async fn connect(&self) -> SearchResult<TransportChannel> {
            self.channel
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| SearchError::connection("connection refused"))
        }
    }

    /// Scripted backend side of the mock transport
    struct Backend {
        requests: mpsc::Receiver<RequestFrame>,
        events: mpsc::Sender<TransportEvent>,
    }

    impl Backend {
        async fn send(&self, frame: ServerFrame) {
            let _ = self.events.send(TransportEvent::Frame(frame)).await;
        }

        async fn send_event(&self, event: TransportEvent) {
            let _ = self.events.send(event).await;
        }

        async fn recv(&mut self) -> RequestFrame {
            timeout(TokioDuration::from_secs(5), self.requests.recv())
                .await
                .expect("timed out waiting for a request frame")
                .expect("transport closed")
        }

        fn try_recv(&mut self) -> Option<RequestFrame> {
            self.requests.try_recv().ok()
        }
    }

    fn mock_client_with_config(config: ClientConfig) -> (SearchClient, Backend) {
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        let factory = Arc::new(MockFactory {
            channel: Mutex::new(Some(TransportChannel {
                outbound: outbound_tx,
                inbound: inbound_rx,
            })),
        });
        (
            SearchClient::with_factory(config, factory),
            Backend {
                requests: outbound_rx,
                events: inbound_tx,
            },
        )
    }

    fn mock_client() -> (SearchClient, Backend) {
        mock_client_with_config(ClientConfig::default())
    }

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2010, 1, 1, 0, 0, 0).unwrap()
    }

    /// Range spanning `minutes` one-minute-spaced entries
    fn minute_range(minutes: i64) -> TimeRange {
        TimeRange::new(base(), base() + Duration::minutes(minutes - 1)).unwrap()
    }

    fn minute_samples(count: i64) -> Vec<FrequencySample> {
        (0..count)
            .map(|i| FrequencySample {
                timestamp: base() + Duration::minutes(i),
                count: 1,
            })
            .collect()
    }

    fn ack(search_id: &str, effective: Option<&str>) -> ServerFrame {
        ServerFrame::Ack {
            search_id: search_id.to_string(),
            effective_query: effective.map(str::to_string),
        }
    }

    fn module(name: &str, input: u64, output: u64) -> ModuleStats {
        ModuleStats {
            module: name.to_string(),
            input_entries: input,
            output_entries: output,
        }
    }

    /// Stats frame the way the backend builds one: the minimum zoom window
    /// comes from the aggregation window literally present in the query
    fn stats_frame(
        query: &str,
        effective: &str,
        pipeline: Vec<ModuleStats>,
        samples: Vec<FrequencySample>,
        metadata: serde_json::Value,
        finished: bool,
    ) -> ServerFrame {
        let min_zoom_window = crate::query::inspect_query(query)
            .ok()
            .and_then(|p| p.aggregation_window_secs)
            .unwrap_or(1);
        ServerFrame::StatsUpdate {
            pipeline,
            query: query.to_string(),
            effective_query: effective.to_string(),
            min_zoom_window,
            metadata,
            frequency: samples,
            finished,
        }
    }

    fn text_entry(payload: &str, values: Vec<(&str, &str)>) -> SearchEntry {
        SearchEntry::Text {
            data: BASE64.encode(payload),
            values: values
                .into_iter()
                .map(|(name, value)| EnumeratedValue {
                    name: name.to_string(),
                    value: value.to_string(),
                })
                .collect(),
        }
    }

    fn raw_entry(payload: &str) -> SearchEntry {
        SearchEntry::Raw {
            data: BASE64.encode(payload),
        }
    }

    /// Complete the subscribe handshake: the mock backend acknowledges with
    /// search ID `s-1` and the macro-expanded query
    async fn subscribe(
        client: &SearchClient,
        backend: Backend,
        query: &str,
        range: TimeRange,
        options: SubscribeOptions,
    ) -> (SearchSession, Backend) {
        let handshake = tokio::spawn(async move {
            let mut backend = backend;
            let frame = backend.recv().await;
            let effective = match &frame {
                RequestFrame::Subscribe { query, .. } => query.replace("$EXPAND", "value"),
                other => panic!("expected subscribe, got {:?}", other),
            };
            backend.send(ack("s-1", Some(&effective))).await;
            backend
        });
        let session = client.subscribe(query, range, options).await.unwrap();
        (session, handshake.await.unwrap())
    }

    #[tokio::test]
    async fn test_subscribe_acknowledged() {
        let (client, backend) = mock_client();
        let (session, _backend) = subscribe(
            &client,
            backend,
            "tag=web json $EXPAND | count",
            minute_range(100),
            SubscribeOptions::default(),
        )
        .await;

        assert_eq!(session.search_id(), "s-1");
        assert_eq!(session.query(), "tag=web json $EXPAND | count");
        assert_eq!(session.effective_query(), "tag=web json value | count");
        assert_eq!(session.state(), SessionState::Active);
        // Defaults applied to the initial filter
        assert_eq!(session.filter().zoom_granularity, 90);
        assert_eq!(session.filter().date_range, minute_range(100));
    }

    #[tokio::test]
    async fn test_subscribe_sends_merged_initial_filter() {
        let (client, mut backend) = mock_client();
        let range = minute_range(1000);

        let handshake = tokio::spawn(async move {
            let frame = backend.recv().await;
            match &frame {
                RequestFrame::Subscribe {
                    filter, metadata, ..
                } => {
                    assert_eq!(filter.entries_offset.count, 1000);
                    assert_eq!(filter.zoom_granularity, 90);
                    assert_eq!(metadata, &Some(json!({"test": "abc"})));
                }
                other => panic!("expected subscribe, got {:?}", other),
            }
            backend.send(ack("s-1", None)).await;
            backend
        });

        let options = SubscribeOptions::default()
            .with_filter(FilterUpdate::default().entries_offset(0, 1000))
            .with_metadata(json!({"test": "abc"}));
        let session = client.subscribe("tag=t", range, options).await.unwrap();
        handshake.await.unwrap();

        assert_eq!(session.filter().entries_offset.count, 1000);
        // Missing effective query falls back to the literal query
        assert_eq!(session.effective_query(), "tag=t");
    }

    #[tokio::test]
    async fn test_subscribe_query_syntax_rejection() {
        let (client, mut backend) = mock_client();

        let script = tokio::spawn(async move {
            backend.recv().await;
            backend
                .send(ServerFrame::Error {
                    code: ErrorCode::QuerySyntax,
                    message: "unknown module: nope".to_string(),
                })
                .await;
        });

        let err = client
            .subscribe("tag=t nope", minute_range(10), SubscribeOptions::default())
            .await
            .unwrap_err();
        script.await.unwrap();

        match err {
            SearchError::QuerySyntax { message } => assert!(message.contains("nope")),
            other => panic!("expected query syntax error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_subscribe_connection_refused() {
        let factory = Arc::new(MockFactory {
            channel: Mutex::new(None),
        });
        let client = SearchClient::with_factory(ClientConfig::default(), factory);

        let err = client
            .subscribe("tag=t", minute_range(10), SubscribeOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SearchError::Connection { .. }));
    }

    #[tokio::test]
    async fn test_subscribe_rejects_invalid_initial_filter() {
        let (client, _backend) = mock_client();
        let options =
            SubscribeOptions::default().with_filter(FilterUpdate::default().zoom_granularity(0));

        let err = client
            .subscribe("tag=t", minute_range(10), options)
            .await
            .unwrap_err();
        assert!(matches!(err, SearchError::FilterRejected { .. }));
    }

    #[tokio::test]
    async fn test_count_query_scenario() {
        // 1000 one-minute-spaced entries piped through `json | count`:
        // one output entry whose payload decodes to "count 1000"
        let (client, backend) = mock_client();
        let query = "tag=T json $EXPAND | count";
        let effective = "tag=T json value | count";
        let range = minute_range(1000);
        let metadata = json!({"test": "abc"});

        let (session, backend) = subscribe(
            &client,
            backend,
            query,
            range,
            SubscribeOptions::default().with_metadata(metadata.clone()),
        )
        .await;

        let mut entries = session.entries();
        let mut progress = session.progress();
        let mut stats = session.stats();
        let mut overview = session.stats_overview();
        let mut zoom = session.stats_zoom();

        backend.send(ServerFrame::Progress { value: 0 }).await;
        backend
            .send(stats_frame(
                query,
                effective,
                vec![module("json", 1000, 1000), module("count", 1000, 1)],
                minute_samples(1000),
                metadata.clone(),
                true,
            ))
            .await;
        backend.send(ServerFrame::Progress { value: 100 }).await;
        backend
            .send(ServerFrame::EntryBatch {
                entries: vec![text_entry("count 1000", vec![("count", "1000")])],
                finished: true,
            })
            .await;

        // Stats: two pipeline stages, each fed all 1000 entries
        let final_stats = stats.recv().await.unwrap().unwrap();
        assert_eq!(final_stats.pipeline.len(), 2);
        assert_eq!(final_stats.pipeline[0].module, "json");
        assert_eq!(final_stats.pipeline[0].input_entries, 1000);
        assert_eq!(final_stats.pipeline[0].output_entries, 1000);
        assert_eq!(final_stats.pipeline[1].module, "count");
        assert_eq!(final_stats.pipeline[1].input_entries, 1000);
        assert_eq!(final_stats.pipeline[1].output_entries, 1);
        assert_eq!(final_stats.metadata, metadata);
        assert_eq!(final_stats.query, query);
        assert_eq!(final_stats.effective_query, effective);
        assert!(final_stats.finished);

        // Entries: exactly one, decoding to the literal count
        let batch = entries.recv().await.unwrap().unwrap();
        assert!(batch.finished);
        assert_eq!(batch.entries.len(), 1);
        assert_eq!(batch.entries[0].decoded_data().unwrap(), b"count 1000");
        assert_eq!(batch.entries[0].values()[0].name, "count");
        assert_eq!(entries.recv().await.unwrap(), None);

        // Progress: starts at 0, ends at exactly 100
        let values = progress.collect().await.unwrap();
        assert_eq!(values.first(), Some(&0));
        assert_eq!(values.last(), Some(&100));

        // Histogram sums both equal the ingested total
        assert_eq!(overview.recv().await.unwrap().unwrap().total(), 1000);
        assert_eq!(zoom.recv().await.unwrap().unwrap().total(), 1000);

        assert_eq!(session.state(), SessionState::Completed);
    }

    #[tokio::test]
    async fn test_ninety_minute_window_scenario() {
        // 90 entries over a 90 minute window at default granularity:
        // both histograms hold exactly one entry per bucket
        let (client, backend) = mock_client();
        let range = minute_range(90);
        let (session, backend) =
            subscribe(&client, backend, "tag=T", range, SubscribeOptions::default()).await;

        let mut entries = session.entries();
        let mut overview = session.stats_overview();
        let mut zoom = session.stats_zoom();

        backend
            .send(stats_frame(
                "tag=T",
                "tag=T",
                vec![],
                minute_samples(90),
                serde_json::Value::Null,
                true,
            ))
            .await;
        let batch_entries: Vec<SearchEntry> = (0..90)
            .map(|i| raw_entry(&format!("entry {}", 89 - i)))
            .collect();
        backend
            .send(ServerFrame::EntryBatch {
                entries: batch_entries,
                finished: true,
            })
            .await;

        let batch = entries.recv().await.unwrap().unwrap();
        assert_eq!(batch.entries.len(), 90);

        let overview_hist = overview.recv().await.unwrap().unwrap();
        assert_eq!(overview_hist.buckets.len(), 90);
        assert_eq!(overview_hist.total(), 90);
        assert!(overview_hist.buckets.iter().all(|b| b.count == 1));

        let zoom_hist = zoom.recv().await.unwrap().unwrap();
        assert_eq!(zoom_hist.buckets.len(), 90);
        assert_eq!(zoom_hist.total(), 90);
        assert!(zoom_hist.buckets.iter().all(|b| b.count == 1));
    }

    #[tokio::test]
    async fn test_zoom_narrowing_scenario() {
        // Narrowing the zoom window by 500 of 1000 minutes drops the zoom
        // sum to 500 while the overview sum stays 1000
        let (client, backend) = mock_client();
        let range = minute_range(1000);
        let (session, mut backend) = subscribe(
            &client,
            backend,
            "tag=T",
            range,
            SubscribeOptions::default()
                .with_filter(FilterUpdate::default().entries_offset(0, 1000)),
        )
        .await;

        let mut overview = session.stats_overview();
        let mut zoom = session.stats_zoom();

        backend
            .send(stats_frame(
                "tag=T",
                "tag=T",
                vec![],
                minute_samples(1000),
                serde_json::Value::Null,
                false,
            ))
            .await;

        assert_eq!(overview.recv().await.unwrap().unwrap().total(), 1000);
        let zoom_hist = zoom.recv().await.unwrap().unwrap();
        assert_eq!(zoom_hist.total(), 1000);
        assert_eq!(zoom_hist.buckets.len(), 90);

        // Narrow the window by 500 minutes with a new zoom granularity
        let narrowed = TimeRange::new(base(), base() + Duration::minutes(499)).unwrap();
        let update = FilterUpdate::default()
            .date_range(narrowed)
            .zoom_granularity(133);

        let (result, _) = tokio::join!(session.set_filter(update), async {
            let frame = backend.recv().await;
            match &frame {
                RequestFrame::Refilter { search_id, filter } => {
                    assert_eq!(search_id, "s-1");
                    // Full merged filter, not a diff
                    assert_eq!(filter.date_range, narrowed);
                    assert_eq!(filter.zoom_granularity, 133);
                    assert_eq!(filter.entries_offset.count, 1000);
                }
                other => panic!("expected refilter, got {:?}", other),
            }
            backend.send(ack("s-1", None)).await;
        });
        let merged = result.unwrap();
        assert_eq!(session.filter(), merged);
        assert_eq!(session.state(), SessionState::Active);

        // Committed refilter re-buckets the zoom histogram locally
        let zoom_hist = zoom.recv().await.unwrap().unwrap();
        assert_eq!(zoom_hist.buckets.len(), 133);
        assert_eq!(zoom_hist.total(), 500);
        assert_eq!(zoom_hist.filter, Some(merged));

        // Backend re-streams scoped stats; replacement keeps sums exact
        backend
            .send(stats_frame(
                "tag=T",
                "tag=T",
                vec![],
                minute_samples(500),
                serde_json::Value::Null,
                false,
            ))
            .await;
        assert_eq!(overview.recv().await.unwrap().unwrap().total(), 1000);
        let zoom_hist = zoom.recv().await.unwrap().unwrap();
        assert_eq!(zoom_hist.total(), 500);
        assert_eq!(zoom_hist.buckets.len(), 133);
    }

    #[tokio::test]
    async fn test_granularity_only_change_stays_local() {
        let (client, backend) = mock_client();
        let (session, mut backend) = subscribe(
            &client,
            backend,
            "tag=T",
            minute_range(1000),
            SubscribeOptions::default(),
        )
        .await;

        let mut overview = session.stats_overview();
        let mut zoom = session.stats_zoom();

        backend
            .send(stats_frame(
                "tag=T",
                "tag=T",
                vec![],
                minute_samples(1000),
                serde_json::Value::Null,
                false,
            ))
            .await;
        assert_eq!(overview.recv().await.unwrap().unwrap().buckets.len(), 90);
        assert_eq!(zoom.recv().await.unwrap().unwrap().buckets.len(), 90);

        // Zoom granularity: re-buckets the zoom histogram only
        let merged = session
            .set_filter(FilterUpdate::default().zoom_granularity(30))
            .await
            .unwrap();
        assert_eq!(merged.zoom_granularity, 30);

        let zoom_hist = zoom.recv().await.unwrap().unwrap();
        assert_eq!(zoom_hist.buckets.len(), 30);
        assert_eq!(zoom_hist.total(), 1000);

        // Overview granularity: re-buckets the overview only
        session
            .set_filter(FilterUpdate::default().overview_granularity(40))
            .await
            .unwrap();
        let overview_hist = overview.recv().await.unwrap().unwrap();
        assert_eq!(overview_hist.buckets.len(), 40);
        assert_eq!(overview_hist.total(), 1000);

        // Neither change produced a backend request
        assert!(backend.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_refilter_requests_are_serialized() {
        let (client, backend) = mock_client();
        let (session, mut backend) = subscribe(
            &client,
            backend,
            "tag=T",
            minute_range(1000),
            SubscribeOptions::default(),
        )
        .await;

        let first = session.set_filter(FilterUpdate::default().entries_offset(100, 100));
        let second = async {
            // Let the first mutation reach the driver before the second
            sleep(TokioDuration::from_millis(10)).await;
            session.set_filter(FilterUpdate::default().entries_offset(200, 100)).await
        };
        let script = async {
            let frame = backend.recv().await;
            match &frame {
                RequestFrame::Refilter { filter, .. } => {
                    assert_eq!(filter.entries_offset.index, 100);
                }
                other => panic!("expected refilter, got {:?}", other),
            }
            assert_eq!(session.state(), SessionState::Refiltering);

            // The queued mutation must not be sent before the first ack
            sleep(TokioDuration::from_millis(50)).await;
            assert!(backend.try_recv().is_none());

            backend.send(ack("s-1", None)).await;

            let frame = backend.recv().await;
            match &frame {
                RequestFrame::Refilter { filter, .. } => {
                    assert_eq!(filter.entries_offset.index, 200);
                }
                other => panic!("expected refilter, got {:?}", other),
            }
            backend.send(ack("s-1", None)).await;
        };

        let (first, second, _) = tokio::join!(first, second, script);
        assert_eq!(first.unwrap().entries_offset.index, 100);
        assert_eq!(second.unwrap().entries_offset.index, 200);
        assert_eq!(session.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_rejected_refilter_keeps_previous_filter() {
        let (client, backend) = mock_client();
        let range = minute_range(1000);
        let (session, mut backend) =
            subscribe(&client, backend, "tag=T", range, SubscribeOptions::default()).await;
        let before = session.filter();

        let narrowed = TimeRange::new(base(), base() + Duration::minutes(10)).unwrap();
        let (result, _) = tokio::join!(
            session.set_filter(FilterUpdate::default().date_range(narrowed)),
            async {
                backend.recv().await;
                backend
                    .send(ServerFrame::Error {
                        code: ErrorCode::FilterRejected,
                        message: "window below minimum zoom".to_string(),
                    })
                    .await;
            }
        );

        match result {
            Err(SearchError::FilterRejected { message }) => {
                assert!(message.contains("minimum zoom"));
            }
            other => panic!("expected filter rejection, got {:?}", other),
        }

        // Previous filter still in effect, session still active
        assert_eq!(session.filter(), before);
        assert_eq!(session.state(), SessionState::Active);

        // Later mutations still work
        let merged = session
            .set_filter(FilterUpdate::default().zoom_granularity(45))
            .await
            .unwrap();
        assert_eq!(merged.zoom_granularity, 45);
    }

    #[tokio::test]
    async fn test_locally_invalid_update_rejected_without_request() {
        let (client, backend) = mock_client();
        let (session, mut backend) = subscribe(
            &client,
            backend,
            "tag=T",
            minute_range(100),
            SubscribeOptions::default(),
        )
        .await;

        let err = session
            .set_filter(FilterUpdate::default().entries_offset(0, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, SearchError::FilterRejected { .. }));
        assert!(backend.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_entries_offset_change_reopens_entry_delivery() {
        let (client, backend) = mock_client();
        let (session, mut backend) = subscribe(
            &client,
            backend,
            "tag=T",
            minute_range(1000),
            SubscribeOptions::default(),
        )
        .await;

        let mut entries = session.entries();

        // First page closes
        backend
            .send(ServerFrame::EntryBatch {
                entries: (0..100).map(|i| raw_entry(&format!("e{}", i))).collect(),
                finished: true,
            })
            .await;
        let batch = entries.recv().await.unwrap().unwrap();
        assert!(batch.finished);
        // Stats path still open, so the session is not complete
        assert_eq!(session.state(), SessionState::Active);

        // Page forward: delivery reopens
        let (result, _) = tokio::join!(
            session.set_filter(FilterUpdate::default().entries_offset(100, 100)),
            async {
                let frame = backend.recv().await;
                assert!(matches!(frame, RequestFrame::Refilter { .. }));
                backend.send(ack("s-1", None)).await;
            }
        );
        result.unwrap();

        backend
            .send(ServerFrame::EntryBatch {
                entries: (100..200).map(|i| raw_entry(&format!("e{}", i))).collect(),
                finished: true,
            })
            .await;
        let batch = entries.recv().await.unwrap().unwrap();
        assert_eq!(batch.entries.len(), 100);
        assert!(batch.finished);

        // Both paths finished: the search completes
        backend
            .send(stats_frame(
                "tag=T",
                "tag=T",
                vec![],
                vec![],
                serde_json::Value::Null,
                true,
            ))
            .await;
        assert_eq!(entries.recv().await.unwrap(), None);
        assert_eq!(session.state(), SessionState::Completed);
    }

    #[tokio::test]
    async fn test_transport_loss_fails_all_streams() {
        let (client, backend) = mock_client();
        let (session, backend) = subscribe(
            &client,
            backend,
            "tag=T",
            minute_range(100),
            SubscribeOptions::default(),
        )
        .await;

        let mut entries = session.entries();
        let mut progress = session.progress();

        backend
            .send_event(TransportEvent::Lost {
                reason: "socket reset".to_string(),
            })
            .await;

        let err = entries.recv().await.unwrap_err();
        assert!(matches!(err, SearchError::Connection { .. }));
        let err = progress.recv().await.unwrap_err();
        assert!(matches!(err, SearchError::Connection { .. }));
        assert_eq!(session.state(), SessionState::Failed);

        // Mutations after failure report the session closed
        let err = session
            .set_filter(FilterUpdate::default().zoom_granularity(10))
            .await
            .unwrap_err();
        assert_eq!(err, SearchError::Closed);
    }

    #[tokio::test]
    async fn test_dispose_cancels_and_completes_streams() {
        let (client, backend) = mock_client();
        let (session, mut backend) = subscribe(
            &client,
            backend,
            "tag=T",
            minute_range(100),
            SubscribeOptions::default(),
        )
        .await;

        let mut entries = session.entries();
        let mut stats = session.stats();

        session.dispose().await;

        match backend.recv().await {
            RequestFrame::Cancel { search_id } => assert_eq!(search_id, "s-1"),
            other => panic!("expected cancel, got {:?}", other),
        }

        // Streams complete, not error
        assert_eq!(entries.recv().await.unwrap(), None);
        assert!(stats.recv().await.unwrap().is_none());
        assert_eq!(session.state(), SessionState::Disposed);

        // Idempotent
        session.dispose().await;
        let err = session
            .set_filter(FilterUpdate::default().zoom_granularity(10))
            .await
            .unwrap_err();
        assert_eq!(err, SearchError::Closed);
    }

    #[tokio::test]
    async fn test_malformed_frames_tolerated_until_threshold() {
        let mut config = ClientConfig::default();
        config.search.malformed_frame_threshold = 2;
        let (client, backend) = mock_client_with_config(config);
        let (session, backend) = subscribe(
            &client,
            backend,
            "tag=T",
            minute_range(100),
            SubscribeOptions::default(),
        )
        .await;

        let mut progress = session.progress();

        for _ in 0..2 {
            backend
                .send_event(TransportEvent::Malformed {
                    detail: "garbled".to_string(),
                })
                .await;
        }
        // Within the threshold the session keeps flowing
        backend.send(ServerFrame::Progress { value: 10 }).await;
        assert_eq!(progress.recv().await.unwrap(), Some(10));

        // One more exceeds the threshold
        backend
            .send_event(TransportEvent::Malformed {
                detail: "garbled".to_string(),
            })
            .await;
        let err = progress.recv().await.unwrap_err();
        assert!(matches!(err, SearchError::Connection { .. }));
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn test_min_zoom_window_follows_query_text() {
        for (query, expected) in [
            ("tag=t json value | stats mean(value) over 1s", 1),
            ("tag=t json value | stats mean(value) over 33s", 33),
        ] {
            let (client, backend) = mock_client();
            let (session, backend) = subscribe(
                &client,
                backend,
                query,
                minute_range(1000),
                SubscribeOptions::default(),
            )
            .await;

            let mut stats = session.stats();
            backend
                .send(stats_frame(query, query, vec![], vec![], serde_json::Value::Null, false))
                .await;

            let update = stats.recv().await.unwrap().unwrap();
            assert_eq!(update.min_zoom_window, expected, "query: {}", query);
        }
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_with_terminal_hundred() {
        let (client, backend) = mock_client();
        let (session, backend) = subscribe(
            &client,
            backend,
            "tag=T",
            minute_range(100),
            SubscribeOptions::default(),
        )
        .await;

        let mut progress = session.progress();

        for value in [0u8, 10, 10, 5, 50] {
            backend.send(ServerFrame::Progress { value }).await;
        }
        // Both paths close without the backend ever reporting 100
        backend
            .send(stats_frame("tag=T", "tag=T", vec![], vec![], serde_json::Value::Null, true))
            .await;
        backend
            .send(ServerFrame::EntryBatch {
                entries: vec![],
                finished: true,
            })
            .await;

        // Repeats and regressions dropped; terminal 100 synthesized
        let values = progress.collect().await.unwrap();
        assert_eq!(values, vec![0, 10, 50, 100]);
        assert_eq!(session.state(), SessionState::Completed);
    }

    #[tokio::test]
    async fn test_stats_echo_the_filter_in_effect() {
        let (client, backend) = mock_client();
        let (session, backend) = subscribe(
            &client,
            backend,
            "tag=T",
            minute_range(1000),
            SubscribeOptions::default()
                .with_filter(FilterUpdate::default().entries_offset(0, 1000)),
        )
        .await;

        let mut stats = session.stats();
        backend
            .send(stats_frame("tag=T", "tag=T", vec![], vec![], serde_json::Value::Null, false))
            .await;

        let update = stats.recv().await.unwrap().unwrap();
        assert_eq!(update.filter.entries_offset.count, 1000);
        assert_eq!(update.filter, session.filter());
    }
}
