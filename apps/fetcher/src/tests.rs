//! Session flows driven by a scripted engine on a paused clock

use crate::client::{Fetcher, ProxyMode};
use crate::controller::{Delivery, SessionOptions, TunnelLifecycleController};
use crate::engine::{EngineCallbacks, ProcessEngine, TunnelEngine};
use crate::sink::ResultSink;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tunneled_fetch_common::{
    ConfigProvider, FetchResult, Result, SessionState, TunnelConfig, TunnelError,
};

const TARGET_URL: &str = "http://x.test/";

#[derive(Debug, Clone)]
enum Step {
    Wait(Duration),
    Connected,
    Socks(u16),
    Http(u16),
    Diagnostic(&'static str),
    Exit(&'static str),
}

#[derive(Default)]
struct EngineProbe {
    starts: AtomicUsize,
    stops: AtomicUsize,
    seen_config: Mutex<Option<TunnelConfig>>,
    seen_server_list: Mutex<Option<String>>,
}

impl EngineProbe {
    fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

/// Replays a fixed sequence of engine callbacks after a successful start
struct ScriptedEngine {
    probe: Arc<EngineProbe>,
    accepts_start: bool,
    script: Vec<Step>,
    task: Option<JoinHandle<()>>,
}

impl TunnelEngine for ScriptedEngine {
    fn start(&mut self, delegate: Arc<dyn EngineCallbacks>, use_embedded_servers: bool) -> bool {
        self.probe.starts.fetch_add(1, Ordering::SeqCst);
        if !self.accepts_start {
            return false;
        }

        *self.probe.seen_config.lock().unwrap() = delegate.provide_config();
        if use_embedded_servers {
            *self.probe.seen_server_list.lock().unwrap() = delegate.provide_embedded_server_list();
        }

        let script = self.script.clone();
        self.task = Some(tokio::spawn(async move {
            for step in script {
                match step {
                    Step::Wait(duration) => tokio::time::sleep(duration).await,
                    Step::Connected => delegate.on_connected(),
                    Step::Socks(port) => delegate.on_listening_socks_port(port),
                    Step::Http(port) => delegate.on_listening_http_port(port),
                    Step::Diagnostic(message) => delegate.on_diagnostic(message, ""),
                    Step::Exit(status) => delegate.on_engine_exited(status),
                }
            }
        }));
        true
    }

    fn stop(&mut self) {
        self.probe.stops.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct StaticConfigProvider {
    data_root: PathBuf,
    config_error: Option<String>,
    server_list: Option<String>,
}

impl ConfigProvider for StaticConfigProvider {
    fn provide_config(&self) -> Result<TunnelConfig> {
        match &self.config_error {
            Some(message) => Err(TunnelError::Config(message.clone())),
            None => TunnelConfig::from_json(br#"{"EgressRegion":"CA"}"#, &self.data_root),
        }
    }

    fn provide_embedded_server_list(&self) -> Result<Option<String>> {
        Ok(self.server_list.clone())
    }
}

struct ScriptedFetcher {
    delay: Duration,
    result: FetchResult,
    calls: Mutex<Vec<(u16, String, ProxyMode)>>,
}

impl ScriptedFetcher {
    fn calls(&self) -> Vec<(u16, String, ProxyMode)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, proxy_port: u16, target_url: &str, mode: ProxyMode) -> FetchResult {
        self.calls
            .lock()
            .unwrap()
            .push((proxy_port, target_url.to_string(), mode));
        tokio::time::sleep(self.delay).await;
        self.result.clone()
    }
}

/// Records deliveries along with how many engine stops preceded each one
struct RecordingSink {
    probe: Arc<EngineProbe>,
    prepared: bool,
    deliveries: Mutex<Vec<(String, usize)>>,
    best_attempts: Mutex<Vec<usize>>,
}

impl RecordingSink {
    fn deliveries(&self) -> Vec<(String, usize)> {
        self.deliveries.lock().unwrap().clone()
    }

    fn best_attempts(&self) -> Vec<usize> {
        self.best_attempts.lock().unwrap().clone()
    }

    fn total(&self) -> usize {
        self.deliveries().len() + self.best_attempts().len()
    }
}

impl ResultSink for RecordingSink {
    fn deliver(&self, outcome: &str) {
        self.deliveries
            .lock()
            .unwrap()
            .push((outcome.to_string(), self.probe.stops()));
    }

    fn deliver_best_attempt(&self) -> bool {
        if self.prepared {
            self.best_attempts.lock().unwrap().push(self.probe.stops());
        }
        self.prepared
    }
}

struct Scenario {
    mode: ProxyMode,
    deadline: Duration,
    script: Vec<Step>,
    accepts_start: bool,
    config_error: Option<String>,
    use_embedded_servers: bool,
    server_list: Option<String>,
    fetch_delay: Duration,
    fetch_result: FetchResult,
    prepared: bool,
}

impl Default for Scenario {
    fn default() -> Self {
        Self {
            mode: ProxyMode::UrlProxy,
            deadline: Duration::from_secs(30),
            script: vec![Step::Http(8080), Step::Socks(1080), Step::Connected],
            accepts_start: true,
            config_error: None,
            use_embedded_servers: false,
            server_list: None,
            fetch_delay: Duration::from_millis(200),
            fetch_result: FetchResult::success(
                br#"{"ip":"1.2.3.4","country":"CA"}"#.to_vec(),
                "UTF-8",
                r#"{"ip":"1.2.3.4","country":"CA"}"#.to_string(),
            ),
            prepared: false,
        }
    }
}

struct Harness {
    probe: Arc<EngineProbe>,
    fetcher: Arc<ScriptedFetcher>,
    sink: Arc<RecordingSink>,
    controller: Arc<TunnelLifecycleController>,
}

impl Scenario {
    fn build(self) -> Harness {
        let probe = Arc::new(EngineProbe::default());
        let engine = ScriptedEngine {
            probe: Arc::clone(&probe),
            accepts_start: self.accepts_start,
            script: self.script,
            task: None,
        };
        let provider = Arc::new(StaticConfigProvider {
            data_root: std::env::temp_dir(),
            config_error: self.config_error,
            server_list: self.server_list,
        });
        let fetcher = Arc::new(ScriptedFetcher {
            delay: self.fetch_delay,
            result: self.fetch_result,
            calls: Mutex::new(Vec::new()),
        });
        let sink = Arc::new(RecordingSink {
            probe: Arc::clone(&probe),
            prepared: self.prepared,
            deliveries: Mutex::new(Vec::new()),
            best_attempts: Mutex::new(Vec::new()),
        });

        let options = SessionOptions {
            target_url: TARGET_URL.to_string(),
            mode: self.mode,
            deadline: self.deadline,
            use_embedded_servers: self.use_embedded_servers,
        };
        let controller = Arc::new(TunnelLifecycleController::new(
            options,
            Box::new(engine),
            provider,
            fetcher.clone(),
            sink.clone(),
        ));

        Harness {
            probe,
            fetcher,
            sink,
            controller,
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_url_proxy_session_completes() {
    let harness = Scenario::default().build();

    let report = harness.controller.start().await.unwrap();

    assert_eq!(report.final_state, SessionState::Completed);
    assert_eq!(report.http_proxy_port, Some(8080));
    assert_eq!(report.socks_proxy_port, Some(1080));
    assert!(report.session_id.starts_with("sess_"));
    assert_eq!(
        harness.fetcher.calls(),
        vec![(8080, TARGET_URL.to_string(), ProxyMode::UrlProxy)]
    );

    let deliveries = harness.sink.deliveries();
    assert_eq!(deliveries.len(), 1);
    let (outcome, stops_before) = &deliveries[0];
    assert_eq!(
        outcome,
        "Result from http://x.test/:\n{\n  \"ip\":\"1.2.3.4\",\n  \"country\":\"CA\"\n}"
    );
    assert_eq!(*stops_before, 1, "engine must stop before delivery");
    assert_eq!(report.outcome(), Some(outcome.as_str()));

    assert_eq!(harness.probe.starts(), 1);
    assert_eq!(harness.probe.stops(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_ports_then_connected_in_engine_order() {
    let harness = Scenario {
        script: vec![Step::Socks(1080), Step::Http(8080), Step::Connected],
        ..Scenario::default()
    }
    .build();

    let report = harness.controller.start().await.unwrap();

    assert_eq!(report.final_state, SessionState::Completed);
    assert_eq!(
        harness.fetcher.calls(),
        vec![(8080, "http://x.test/".to_string(), ProxyMode::UrlProxy)]
    );
    assert!(
        report
            .outcome()
            .unwrap()
            .starts_with("Result from http://x.test/:\n")
    );
    assert_eq!(harness.sink.total(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_session_proxy_uses_socks_port() {
    let harness = Scenario {
        mode: ProxyMode::SessionProxy,
        ..Scenario::default()
    }
    .build();

    let report = harness.controller.start().await.unwrap();

    assert_eq!(report.final_state, SessionState::Completed);
    assert_eq!(
        harness.fetcher.calls(),
        vec![(1080, TARGET_URL.to_string(), ProxyMode::SessionProxy)]
    );
    assert_eq!(harness.sink.total(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_connected_before_port_waits_for_port() {
    let harness = Scenario {
        mode: ProxyMode::SessionProxy,
        script: vec![
            Step::Diagnostic("establishing"),
            Step::Connected,
            Step::Http(8080),
            Step::Wait(Duration::from_secs(2)),
            Step::Socks(1080),
            Step::Socks(1081),
        ],
        fetch_delay: Duration::from_secs(5),
        ..Scenario::default()
    }
    .build();

    let report = harness.controller.start().await.unwrap();

    assert_eq!(report.final_state, SessionState::Completed);
    assert_eq!(
        harness.fetcher.calls(),
        vec![(1080, TARGET_URL.to_string(), ProxyMode::SessionProxy)]
    );
    // The later port is recorded even though the fetch already started
    assert_eq!(report.socks_proxy_port, Some(1081));
    assert_eq!(harness.sink.total(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_connected_twice_fetches_once() {
    let harness = Scenario {
        script: vec![Step::Http(8080), Step::Connected, Step::Connected],
        ..Scenario::default()
    }
    .build();

    let report = harness.controller.start().await.unwrap();

    assert_eq!(report.final_state, SessionState::Completed);
    assert_eq!(harness.fetcher.calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_beats_slow_fetch() {
    let harness = Scenario {
        fetch_delay: Duration::from_secs(60),
        ..Scenario::default()
    }
    .build();

    let report = harness.controller.start().await.unwrap();

    assert_eq!(report.final_state, SessionState::TimedOut);
    assert!(report.elapsed >= Duration::from_secs(30));
    assert!(report.elapsed < Duration::from_secs(31));

    let deliveries = harness.sink.deliveries();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(
        deliveries[0].0,
        "Timed out after 30000 ms while waiting for the tunneled request"
    );
    assert_eq!(deliveries[0].1, 1);

    // Let the abandoned fetch finish; its result must be discarded
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(harness.sink.total(), 1);
    assert_eq!(harness.probe.stops(), 1);
    assert_eq!(harness.controller.state(), SessionState::TimedOut);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_delivers_best_attempt_before_stop() {
    let harness = Scenario {
        script: vec![Step::Http(8080)],
        prepared: true,
        ..Scenario::default()
    }
    .build();

    let report = harness.controller.start().await.unwrap();

    assert_eq!(report.final_state, SessionState::TimedOut);
    assert_eq!(report.delivery, Some(Delivery::BestAttempt));
    assert_eq!(report.http_proxy_port, Some(8080));
    assert_eq!(harness.sink.best_attempts(), vec![0]);
    assert!(harness.sink.deliveries().is_empty());
    assert_eq!(harness.probe.stops(), 1);
    assert!(harness.fetcher.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_deadline_without_any_engine_events() {
    let harness = Scenario {
        script: Vec::new(),
        ..Scenario::default()
    }
    .build();

    let report = harness.controller.start().await.unwrap();

    assert_eq!(report.final_state, SessionState::TimedOut);
    assert_eq!(
        report.outcome(),
        Some("Timed out after 30000 ms while starting the tunnel")
    );
    assert_eq!(report.http_proxy_port, None);
    assert_eq!(report.socks_proxy_port, None);
    assert_eq!(harness.probe.stops(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_while_waiting_for_port() {
    let harness = Scenario {
        mode: ProxyMode::UrlProxy,
        script: vec![Step::Socks(1080), Step::Connected],
        ..Scenario::default()
    }
    .build();

    let report = harness.controller.start().await.unwrap();

    assert_eq!(report.final_state, SessionState::TimedOut);
    assert_eq!(
        report.outcome(),
        Some("Timed out after 30000 ms while waiting for the local proxy port")
    );
    assert!(harness.fetcher.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_expire_now_ends_session_early() {
    let harness = Scenario {
        deadline: Duration::from_secs(600),
        script: Vec::new(),
        ..Scenario::default()
    }
    .build();

    let deadline = harness.controller.deadline().clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        deadline.expire_now();
    });

    let report = harness.controller.start().await.unwrap();

    assert_eq!(report.final_state, SessionState::TimedOut);
    assert!(report.elapsed < Duration::from_secs(2));
    assert_eq!(harness.sink.total(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_config_failure_never_starts_engine() {
    let harness = Scenario {
        config_error: Some("missing tunnel config".to_string()),
        ..Scenario::default()
    }
    .build();

    let report = harness.controller.start().await.unwrap();

    assert_eq!(report.final_state, SessionState::Failed);
    assert_eq!(
        report.outcome(),
        Some("Failed (config): Config error: missing tunnel config")
    );
    assert_eq!(harness.probe.starts(), 0);
    assert_eq!(harness.probe.stops(), 0);
    assert_eq!(harness.sink.total(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_engine_start_refused() {
    let harness = Scenario {
        accepts_start: false,
        ..Scenario::default()
    }
    .build();

    let report = harness.controller.start().await.unwrap();

    assert_eq!(report.final_state, SessionState::Failed);
    let outcome = report.outcome().unwrap();
    assert!(outcome.starts_with("Failed (engine start)"), "{}", outcome);
    assert_eq!(harness.probe.starts(), 1);
    assert_eq!(harness.probe.stops(), 0);
    assert!(harness.fetcher.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_missing_embedded_servers_fails() {
    let harness = Scenario {
        use_embedded_servers: true,
        server_list: None,
        ..Scenario::default()
    }
    .build();

    let report = harness.controller.start().await.unwrap();

    assert_eq!(report.final_state, SessionState::Failed);
    assert_eq!(harness.probe.starts(), 0);
    assert_eq!(harness.sink.total(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_engine_receives_config_and_server_list() {
    let harness = Scenario {
        use_embedded_servers: true,
        server_list: Some("3132372e302e302e31".to_string()),
        ..Scenario::default()
    }
    .build();

    let report = harness.controller.start().await.unwrap();
    assert_eq!(report.final_state, SessionState::Completed);

    let config = harness.probe.seen_config.lock().unwrap().clone().unwrap();
    assert_eq!(config.get("EgressRegion"), Some(&serde_json::Value::from("CA")));
    assert!(config.get("DataRootDirectory").is_some());
    assert_eq!(
        harness.probe.seen_server_list.lock().unwrap().as_deref(),
        Some("3132372e302e302e31")
    );
}

#[tokio::test(start_paused = true)]
async fn test_fetch_error_completes_with_error_text() {
    let harness = Scenario {
        fetch_result: FetchResult::from(TunnelError::Server {
            url: TARGET_URL.to_string(),
            status: reqwest::StatusCode::NOT_FOUND,
        }),
        ..Scenario::default()
    }
    .build();

    let report = harness.controller.start().await.unwrap();

    assert_eq!(report.final_state, SessionState::Completed);
    let outcome = report.outcome().unwrap();
    assert!(outcome.starts_with("Error from http://x.test/:\n\n"), "{}", outcome);
    assert!(outcome.contains("404"));
    assert_eq!(harness.probe.stops(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_without_start_is_silent() {
    let harness = Scenario::default().build();

    harness.controller.stop();
    harness.controller.stop();

    assert_eq!(harness.probe.stops(), 0);
    assert_eq!(harness.sink.total(), 0);
    assert_eq!(harness.controller.state(), SessionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_stop_after_completion_is_noop() {
    let harness = Scenario::default().build();

    harness.controller.start().await.unwrap();
    harness.controller.stop();
    harness.controller.stop();

    assert_eq!(harness.probe.stops(), 1);
    assert_eq!(harness.sink.total(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_second_start_is_rejected() {
    let harness = Scenario::default().build();

    harness.controller.start().await.unwrap();
    let err = harness.controller.start().await.unwrap_err();

    assert!(matches!(err, TunnelError::InvalidTransition { .. }));
    assert_eq!(harness.probe.starts(), 1);
    assert_eq!(harness.sink.total(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_engine_exit_fails_session() {
    let harness = Scenario {
        script: vec![
            Step::Socks(1080),
            Step::Wait(Duration::from_secs(1)),
            Step::Exit("exit status: 1"),
        ],
        ..Scenario::default()
    }
    .build();

    let report = harness.controller.start().await.unwrap();

    assert_eq!(report.final_state, SessionState::Failed);
    assert!(report.elapsed < Duration::from_secs(2));
    assert_eq!(
        report.outcome(),
        Some(
            "Failed (engine start): Tunnel engine failed to start: \
             engine exited unexpectedly (exit status: 1)"
        )
    );
    assert_eq!(harness.probe.stops(), 1);
    assert!(harness.fetcher.calls().is_empty());
    assert_eq!(harness.sink.total(), 1);
}

#[cfg(unix)]
#[tokio::test]
async fn test_dead_engine_process_fails_without_waiting_for_deadline() {
    let dir = tempfile::TempDir::new().unwrap();
    let provider = Arc::new(StaticConfigProvider {
        data_root: dir.path().to_path_buf(),
        config_error: None,
        server_list: None,
    });
    let fetcher = Arc::new(ScriptedFetcher {
        delay: Duration::ZERO,
        result: FetchResult::success(Vec::new(), "UTF-8", String::new()),
        calls: Mutex::new(Vec::new()),
    });
    let sink = Arc::new(RecordingSink {
        probe: Arc::new(EngineProbe::default()),
        prepared: false,
        deliveries: Mutex::new(Vec::new()),
        best_attempts: Mutex::new(Vec::new()),
    });

    let controller = TunnelLifecycleController::new(
        SessionOptions {
            target_url: TARGET_URL.to_string(),
            mode: ProxyMode::UrlProxy,
            deadline: Duration::from_secs(30),
            use_embedded_servers: false,
        },
        Box::new(ProcessEngine::new("false", Vec::new())),
        provider,
        fetcher.clone(),
        sink.clone(),
    );

    let report = controller.start().await.unwrap();

    assert_eq!(report.final_state, SessionState::Failed);
    assert!(report.elapsed < Duration::from_secs(10), "{:?}", report.elapsed);
    let outcome = report.outcome().unwrap();
    assert!(outcome.starts_with("Failed (engine start)"), "{}", outcome);
    assert!(outcome.contains("exit status: 1"), "{}", outcome);
    assert!(fetcher.calls().is_empty());
    assert_eq!(sink.total(), 1);
}
