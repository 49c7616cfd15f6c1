//! Tunnel session lifecycle
//!
//! One controller drives one session: it loads the tunnel config, starts the
//! engine, waits for the connected signal and the local proxy port the fetch
//! mode needs, issues a single fetch and delivers exactly one outcome. A hard
//! deadline is armed when the session starts and preempts everything else.
//!
//! Engine callbacks arrive on arbitrary threads. They are turned into events on
//! a channel and handled by a single event loop, so session state is only ever
//! mutated from one place.

use crate::client::{Fetcher, ProxyMode};
use crate::engine::{EngineCallbacks, TunnelEngine};
use crate::sink::ResultSink;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tunneled_fetch_common::utils::format_timestamp_millis;
use tunneled_fetch_common::{
    ConfigProvider, FetchResult, ProxyKind, Result, SessionState, TunnelConfig, TunnelError,
    TunnelSession,
};

/// Hard horizon for a session
///
/// Clones share the same token, so any clone can expire the session early.
#[derive(Debug, Clone)]
pub struct Deadline {
    horizon: Duration,
    token: CancellationToken,
}

impl Deadline {
    pub fn new(horizon: Duration) -> Self {
        Self {
            horizon,
            token: CancellationToken::new(),
        }
    }

    pub fn horizon(&self) -> Duration {
        self.horizon
    }

    /// Expire immediately, as when the host announces termination
    pub fn expire_now(&self) {
        self.token.cancel();
    }

    pub fn is_expired(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes once the deadline has expired
    pub async fn expired(&self) {
        self.token.cancelled().await;
    }

    /// Start the timer; the returned task expires the deadline at the horizon
    fn arm(&self) -> JoinHandle<()> {
        let deadline = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(deadline.horizon) => {
                    debug!("Deadline of {:?} reached", deadline.horizon);
                    deadline.expire_now();
                }
                _ = deadline.expired() => {}
            }
        })
    }
}

/// Parameters for one session
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub target_url: String,
    pub mode: ProxyMode,
    pub deadline: Duration,
    pub use_embedded_servers: bool,
}

/// What reached the result sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Outcome text passed to `ResultSink::deliver`
    Outcome(String),
    /// The sink's prepared content, after the deadline
    BestAttempt,
}

/// Summary of a finished session
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub session_id: String,
    pub final_state: SessionState,
    pub delivery: Option<Delivery>,
    pub socks_proxy_port: Option<u16>,
    pub http_proxy_port: Option<u16>,
    pub elapsed: Duration,
}

impl SessionReport {
    /// Outcome text, if one was delivered
    pub fn outcome(&self) -> Option<&str> {
        match &self.delivery {
            Some(Delivery::Outcome(text)) => Some(text),
            _ => None,
        }
    }
}

#[derive(Debug)]
enum SessionEvent {
    Connected,
    ListeningPort(ProxyKind, u16),
    FetchFinished(FetchResult),
    EngineExited(String),
}

/// Bridges engine callbacks onto the session event channel
struct EngineDelegate {
    config: TunnelConfig,
    server_list: Option<String>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl EngineDelegate {
    fn send(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            debug!("Session finished; dropping engine event");
        }
    }
}

impl EngineCallbacks for EngineDelegate {
    fn provide_config(&self) -> Option<TunnelConfig> {
        Some(self.config.clone())
    }

    fn provide_embedded_server_list(&self) -> Option<String> {
        self.server_list.clone()
    }

    fn on_diagnostic(&self, message: &str, timestamp: &str) {
        if timestamp.is_empty() {
            debug!("tunnel: {}", message);
        } else {
            debug!("tunnel: {}: {}", timestamp, message);
        }
    }

    fn on_connected(&self) {
        self.send(SessionEvent::Connected);
    }

    fn on_listening_socks_port(&self, port: u16) {
        self.send(SessionEvent::ListeningPort(ProxyKind::Socks, port));
    }

    fn on_listening_http_port(&self, port: u16) {
        self.send(SessionEvent::ListeningPort(ProxyKind::Http, port));
    }

    fn on_engine_exited(&self, status: &str) {
        self.send(SessionEvent::EngineExited(status.to_string()));
    }
}

struct EngineSlot {
    engine: Box<dyn TunnelEngine>,
    running: bool,
}

/// Drives a single tunnel session from start to its one delivered outcome
pub struct TunnelLifecycleController {
    options: SessionOptions,
    deadline: Deadline,
    provider: Arc<dyn ConfigProvider>,
    fetcher: Arc<dyn Fetcher>,
    sink: Arc<dyn ResultSink>,
    engine: Mutex<EngineSlot>,
    session: Mutex<TunnelSession>,
    delivery: Mutex<Option<Delivery>>,
    delivered: AtomicBool,
    started: AtomicBool,
}

impl TunnelLifecycleController {
    pub fn new(
        options: SessionOptions,
        engine: Box<dyn TunnelEngine>,
        provider: Arc<dyn ConfigProvider>,
        fetcher: Arc<dyn Fetcher>,
        sink: Arc<dyn ResultSink>,
    ) -> Self {
        let deadline = Deadline::new(options.deadline);
        Self {
            options,
            deadline,
            provider,
            fetcher,
            sink,
            engine: Mutex::new(EngineSlot {
                engine,
                running: false,
            }),
            session: Mutex::new(TunnelSession::new()),
            delivery: Mutex::new(None),
            delivered: AtomicBool::new(false),
            started: AtomicBool::new(false),
        }
    }

    /// The session deadline; expire it to end the session early
    pub fn deadline(&self) -> &Deadline {
        &self.deadline
    }

    pub fn state(&self) -> SessionState {
        self.session().state
    }

    /// Run the session until it reaches a terminal state
    ///
    /// Returns once an outcome has been delivered. The in-flight fetch, if
    /// any, is left running when the deadline wins.
    pub async fn start(&self) -> Result<SessionReport> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(TunnelError::InvalidTransition {
                from: self.state().to_string(),
                to: SessionState::Starting.to_string(),
            });
        }

        let began = Instant::now();
        let timer = self.deadline.arm();
        {
            let session = self.session();
            info!(
                "Session {} started at {} (deadline {:?}, {:?} mode)",
                session.id,
                format_timestamp_millis(session.started_at),
                self.deadline.horizon(),
                self.options.mode
            );
        }
        self.transition(SessionState::Starting);

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        if self.launch(events_tx.clone()) {
            self.run(&events_tx, &mut events_rx).await;
        }

        timer.abort();
        Ok(self.report(began.elapsed()))
    }

    /// Stop the engine if it is running
    ///
    /// Safe to call any number of times; never delivers an outcome.
    pub fn stop(&self) {
        let mut slot = self.engine.lock().unwrap_or_else(|p| p.into_inner());
        if slot.running {
            info!("Stopping tunnel engine");
            slot.engine.stop();
            slot.running = false;
        }
    }

    /// Load config and start the engine; false if the session already failed
    fn launch(&self, events: mpsc::UnboundedSender<SessionEvent>) -> bool {
        let config = match self.provider.provide_config() {
            Ok(config) => config,
            Err(e) => {
                self.fail(e);
                return false;
            }
        };

        let server_list = if self.options.use_embedded_servers {
            match self.provider.provide_embedded_server_list() {
                Ok(Some(entries)) => Some(entries),
                Ok(None) => {
                    self.fail(TunnelError::Config(
                        "no embedded server entries configured".to_string(),
                    ));
                    return false;
                }
                Err(e) => {
                    self.fail(e);
                    return false;
                }
            }
        } else {
            None
        };

        let delegate = Arc::new(EngineDelegate {
            config,
            server_list,
            events,
        });

        let started = {
            let mut slot = self.engine.lock().unwrap_or_else(|p| p.into_inner());
            let started = slot
                .engine
                .start(delegate, self.options.use_embedded_servers);
            slot.running = started;
            started
        };

        if !started {
            self.fail(TunnelError::EngineStart(
                "tunnel engine start returned false".to_string(),
            ));
            return false;
        }

        info!("Tunnel engine started");
        true
    }

    async fn run(
        &self,
        events_tx: &mpsc::UnboundedSender<SessionEvent>,
        events_rx: &mut mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        loop {
            tokio::select! {
                biased;

                _ = self.deadline.expired() => {
                    self.time_out();
                    return;
                }

                event = events_rx.recv() => {
                    let Some(event) = event else {
                        // Unreachable while `events_tx` is alive; wait out the deadline
                        self.deadline.expired().await;
                        self.time_out();
                        return;
                    };

                    if self.handle_event(event, events_tx) {
                        return;
                    }
                }
            }
        }
    }

    /// Apply one event; true once the session is finished
    fn handle_event(
        &self,
        event: SessionEvent,
        events_tx: &mpsc::UnboundedSender<SessionEvent>,
    ) -> bool {
        let required = self.options.mode.required_proxy();

        match event {
            SessionEvent::ListeningPort(kind, port) => {
                if self.state() == SessionState::Starting {
                    self.transition(SessionState::AwaitingPorts);
                }

                let state = {
                    let mut session = self.session();
                    match session.record_port(kind, port) {
                        Ok(Some(previous)) if previous != port => {
                            warn!("{} proxy port changed from {} to {}", kind, previous, port)
                        }
                        Ok(_) => info!("{} proxy listening on port {}", kind, port),
                        Err(e) => warn!("Ignoring {} proxy port: {}", kind, e),
                    }
                    session.state
                };

                if state == SessionState::Connecting && kind == required {
                    self.begin_fetch(events_tx);
                }
                false
            }
            SessionEvent::Connected => {
                let state = self.state();
                if !matches!(state, SessionState::Starting | SessionState::AwaitingPorts) {
                    debug!("Ignoring connected signal in state {}", state);
                    return false;
                }

                info!("Tunnel connected");
                self.transition(SessionState::Connecting);
                if self.session().port(required).is_some() {
                    self.begin_fetch(events_tx);
                } else {
                    debug!("Waiting for the {} proxy port", required);
                }
                false
            }
            SessionEvent::FetchFinished(result) => {
                if self.state() != SessionState::Fetching {
                    debug!("Discarding fetch result in state {}", self.state());
                    return false;
                }
                self.complete(result);
                true
            }
            SessionEvent::EngineExited(status) => {
                self.fail(TunnelError::EngineStart(format!(
                    "engine exited unexpectedly ({})",
                    status
                )));
                true
            }
        }
    }

    fn begin_fetch(&self, events_tx: &mpsc::UnboundedSender<SessionEvent>) {
        let required = self.options.mode.required_proxy();
        let Some(port) = self.session().port(required) else {
            return;
        };

        self.transition(SessionState::Connected);
        self.transition(SessionState::Fetching);
        info!(
            "Fetching {} through the {} proxy on port {}",
            self.options.target_url, required, port
        );

        let fetcher = Arc::clone(&self.fetcher);
        let target_url = self.options.target_url.clone();
        let mode = self.options.mode;
        let events = events_tx.clone();

        // Not awaited: the deadline may end the session first
        tokio::spawn(async move {
            let result = fetcher.fetch(port, &target_url, mode).await;
            if events.send(SessionEvent::FetchFinished(result)).is_err() {
                debug!("Session already finished; discarding late fetch result");
            }
        });
    }

    fn complete(&self, result: FetchResult) {
        match result.failure_kind() {
            None => info!("Fetch succeeded"),
            Some(kind) => warn!("Fetch failed ({})", kind),
        }

        let outcome = result.outcome_text(&self.options.target_url);
        self.transition(SessionState::Completed);
        self.stop();
        self.deliver(outcome);
    }

    fn fail(&self, err: TunnelError) {
        error!("Session failed: {}", err);
        self.transition(SessionState::Failed);
        self.stop();

        let outcome = FetchResult::from(err).outcome_text(&self.options.target_url);
        self.deliver(outcome);
    }

    fn time_out(&self) {
        let state = self.state();
        if state.is_terminal() {
            return;
        }

        let horizon = self.deadline.horizon();
        warn!("Deadline expired while {}", state.describe());
        self.transition(SessionState::TimedOut);

        if !self.claim_delivery() {
            self.stop();
            return;
        }

        if self.sink.deliver_best_attempt() {
            self.record_delivery(Delivery::BestAttempt);
            self.stop();
        } else {
            self.stop();
            let millis = u64::try_from(horizon.as_millis()).unwrap_or(u64::MAX);
            let outcome = format!("{} while {}", TunnelError::Timeout(millis), state.describe());
            self.sink.deliver(&outcome);
            self.record_delivery(Delivery::Outcome(outcome));
        }
    }

    fn deliver(&self, outcome: String) {
        if !self.claim_delivery() {
            debug!("Outcome already delivered; dropping: {}", outcome);
            return;
        }
        self.sink.deliver(&outcome);
        self.record_delivery(Delivery::Outcome(outcome));
    }

    /// True for exactly one caller per session
    fn claim_delivery(&self) -> bool {
        self.delivered
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn record_delivery(&self, delivery: Delivery) {
        *self.delivery.lock().unwrap_or_else(|p| p.into_inner()) = Some(delivery);
    }

    fn transition(&self, next: SessionState) {
        let mut session = self.session();
        let from = session.state;
        match session.advance(next) {
            Ok(()) => debug!("Session {}: {} -> {}", session.id, from, next),
            Err(e) => warn!("Session {}: {}", session.id, e),
        }
    }

    fn session(&self) -> MutexGuard<'_, TunnelSession> {
        self.session.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn report(&self, elapsed: Duration) -> SessionReport {
        let session = self.session();
        let delivery = self
            .delivery
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();

        info!(
            "Session {} finished in state {} after {:?}",
            session.id, session.state, elapsed
        );

        SessionReport {
            session_id: session.id.clone(),
            final_state: session.state,
            delivery,
            socks_proxy_port: session.port(ProxyKind::Socks),
            http_proxy_port: session.port(ProxyKind::Http),
            elapsed,
        }
    }
}

impl Drop for TunnelLifecycleController {
    fn drop(&mut self) {
        self.stop();
    }
}
