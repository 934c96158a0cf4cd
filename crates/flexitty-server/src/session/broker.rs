//! Session registry and pump lifecycle.
//!
//! The broker creates terminal sessions, attaches client sinks to them, and
//! owns every background pump. Each session runs one output pump (a blocking
//! PTY reader feeding an async fan-out task); each attached sink runs one
//! input pump forwarding client events to the terminal. All pumps hang off a
//! cancellation token tree rooted at the broker, so [`SessionBroker::shutdown`]
//! stops them deterministically.

use super::broadcast::{BroadcastGroup, SinkId};
use super::pty::TerminalSession;
use super::ring_buffer::DEFAULT_CAPACITY;
use flexitty_core::{FlexiError, FlexiResult, SessionId, Sink, SinkEvent};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long `shutdown` waits for a single pump before giving up on it.
const PUMP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Knobs applied to every session the broker creates.
#[derive(Debug, Clone)]
pub struct BrokerOptions {
    /// History buffer size per session, in bytes.
    pub buffer_capacity: usize,
    /// Initial terminal geometry.
    pub cols: u16,
    pub rows: u16,
    /// Upper bound on a single send to one sink.
    pub send_timeout: Duration,
    /// Replay the history buffer to a sink before it starts receiving live output.
    pub replay_on_attach: bool,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_CAPACITY,
            cols: 80,
            rows: 24,
            send_timeout: Duration::from_secs(5),
            replay_on_attach: true,
        }
    }
}

/// A terminal shared by any number of sinks.
pub struct Session {
    id: SessionId,
    terminal: Arc<TerminalSession>,
    group: Arc<BroadcastGroup>,
    cancel: CancellationToken,
    pumps: Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn terminal(&self) -> &TerminalSession {
        &self.terminal
    }

    /// Number of currently attached sinks.
    pub async fn attached(&self) -> usize {
        self.group.len().await
    }

    /// True once every pump started for this session has exited.
    pub fn pumps_finished(&self) -> bool {
        self.pumps
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .all(|h| h.is_finished())
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut pumps = self.pumps.lock().unwrap_or_else(|p| p.into_inner());
        pumps.retain(|h| !h.is_finished());
        pumps.push(handle);
    }

    fn take_pumps(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut *self.pumps.lock().unwrap_or_else(|p| p.into_inner()))
    }
}

/// Registry of live sessions.
pub struct SessionBroker {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    options: BrokerOptions,
    shutdown: CancellationToken,
}

impl SessionBroker {
    pub fn new(options: BrokerOptions) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            options,
            shutdown: CancellationToken::new(),
        }
    }

    /// Spawn `command` on a new terminal, start its output pump and register it.
    ///
    /// Nothing is registered if the terminal cannot be started or the broker
    /// shuts down while it is starting.
    pub async fn create_session(&self, command: &str, args: &[String]) -> FlexiResult<SessionId> {
        if self.shutdown.is_cancelled() {
            return Err(shut_down());
        }
        let session = self.open_session(command, args)?;
        self.register(session).await
    }

    fn open_session(&self, command: &str, args: &[String]) -> FlexiResult<Arc<Session>> {
        let id = SessionId::generate();
        let terminal = TerminalSession::spawn(
            command,
            args,
            self.options.cols,
            self.options.rows,
            self.options.buffer_capacity,
        )
        .map_err(|e| {
            warn!(command, error = %e, "failed to create session");
            e
        })?;

        let session = Arc::new(Session {
            id,
            terminal: Arc::new(terminal),
            group: Arc::new(BroadcastGroup::new(self.options.send_timeout)),
            cancel: self.shutdown.child_token(),
            pumps: Mutex::new(Vec::new()),
        });

        for handle in start_output_pump(&session) {
            session.track(handle);
        }
        Ok(session)
    }

    async fn register(&self, session: Arc<Session>) -> FlexiResult<SessionId> {
        let mut sessions = self.sessions.write().await;
        // Checked under the write lock: `shutdown` cancels before it collects
        // the registry, so a session inserted here is always seen by it.
        if self.shutdown.is_cancelled() {
            drop(sessions);
            stop_session(&session).await;
            return Err(shut_down());
        }

        let id = session.id;
        sessions.insert(id, session.clone());
        info!(
            session_id = %id,
            command = %session.terminal.command(),
            total = sessions.len(),
            "session created"
        );
        Ok(id)
    }

    /// Attach a client sink to a session.
    ///
    /// The sink receives the session's history first (when replay is enabled),
    /// then every live output chunk. An input pump forwards the sink's events
    /// to the terminal until the sink closes or the group drops it after a
    /// failed delivery; the sink is detached then.
    pub async fn attach(&self, id: &SessionId, sink: Arc<dyn Sink>) -> FlexiResult<SinkId> {
        let session = self.session(id).await?;
        if self.shutdown.is_cancelled() {
            return Err(shut_down());
        }

        // Fired by the group if it drops this sink, or by shutdown.
        let cancel = session.cancel.child_token();
        let sink_id = if self.options.replay_on_attach {
            session
                .group
                .attach_with_replay(
                    sink.clone(),
                    session.terminal.history_buffer(),
                    cancel.clone(),
                )
                .await?
        } else {
            session.group.attach(sink.clone(), cancel.clone()).await
        };

        let handle = tokio::spawn(input_pump(
            session.id,
            session.terminal.clone(),
            session.group.clone(),
            sink.clone(),
            sink_id,
            cancel,
        ));
        session.track(handle);

        info!(session_id = %id, sink_id, sink = %sink.label(), "client attached");
        Ok(sink_id)
    }

    /// Whether `id` names a live session.
    pub async fn exists(&self, id: &SessionId) -> bool {
        self.sessions.read().await.contains_key(id)
    }

    /// Look up a session.
    pub async fn session(&self, id: &SessionId) -> FlexiResult<Arc<Session>> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| FlexiError::SessionNotFound(id.to_string()))
    }

    /// Resize a session's terminal.
    pub async fn resize(&self, id: &SessionId, cols: u16, rows: u16) -> FlexiResult<()> {
        self.session(id).await?.terminal.resize(cols, rows)
    }

    /// Snapshot of a session's recent output.
    pub async fn history(&self, id: &SessionId) -> FlexiResult<Vec<u8>> {
        self.session(id).await?.terminal.history()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Stop every pump, close every terminal and wait for the pumps to exit.
    ///
    /// Returns the number of pumps still running when their join timed out;
    /// those stay tracked on their session. Sessions stay registered (so
    /// lookups still succeed) but are inert.
    pub async fn shutdown(&self) -> usize {
        self.shutdown.cancel();

        let sessions: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();
        info!(count = sessions.len(), "shutting down sessions");

        let mut still_running = 0;
        for session in sessions {
            still_running += stop_session(&session).await;
        }
        if still_running > 0 {
            warn!(still_running, "some pumps did not stop");
        }
        still_running
    }
}

fn shut_down() -> FlexiError {
    FlexiError::Other("broker is shut down".into())
}

/// Close a session's terminal and join its pumps.
///
/// Joined handles are dropped; handles that outlive [`PUMP_JOIN_TIMEOUT`]
/// are tracked again. Returns how many timed out.
async fn stop_session(session: &Session) -> usize {
    session.terminal.close();

    let mut stuck = Vec::new();
    for mut handle in session.take_pumps() {
        match tokio::time::timeout(PUMP_JOIN_TIMEOUT, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(session_id = %session.id, error = %e, "pump panicked"),
            Err(_) => {
                warn!(session_id = %session.id, "pump did not stop in time");
                stuck.push(handle);
            }
        }
    }

    let count = stuck.len();
    for handle in stuck {
        session.track(handle);
    }
    debug!(session_id = %session.id, still_running = count, "session stopped");
    count
}

/// Start the reader and fan-out halves of a session's output pump.
///
/// The reader runs on a blocking thread because PTY reads block; it hands
/// chunks (already recorded in history) to the async fan-out task. The
/// pump ends on the first end-of-output or read error.
fn start_output_pump(session: &Session) -> [JoinHandle<()>; 2] {
    let (tx, mut rx) = mpsc::unbounded_channel::<(Vec<u8>, u64)>();

    let id = session.id;
    let terminal = session.terminal.clone();
    let cancel = session.cancel.clone();
    let reader = tokio::task::spawn_blocking(move || {
        while !cancel.is_cancelled() {
            match terminal.read_output() {
                Ok(chunk) => {
                    let end_offset = terminal.history_buffer().total_written();
                    if tx.send((chunk, end_offset)).is_err() {
                        break;
                    }
                }
                Err(FlexiError::Eof) => {
                    info!(session_id = %id, "terminal output ended");
                    break;
                }
                Err(e) => {
                    if !terminal.is_closed() {
                        info!(session_id = %id, error = %e, "terminal read failed, stopping output pump");
                    }
                    break;
                }
            }
        }
        if let Some(code) = terminal.exit_code() {
            info!(session_id = %id, code, "terminal process exited");
        }
    });

    let group = session.group.clone();
    let cancel = session.cancel.clone();
    let fan_out = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = rx.recv() => match next {
                    Some((chunk, end_offset)) => {
                        group.deliver_at(&chunk, end_offset).await;
                    }
                    None => break,
                },
            }
        }
        debug!(session_id = %id, "output pump stopped");
    });

    [reader, fan_out]
}

/// Forward one sink's events to the terminal until the sink goes away.
async fn input_pump(
    id: SessionId,
    terminal: Arc<TerminalSession>,
    group: Arc<BroadcastGroup>,
    sink: Arc<dyn Sink>,
    sink_id: SinkId,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = sink.receive() => event,
        };

        match event {
            Ok(Some(SinkEvent::Input(data))) => {
                let terminal = terminal.clone();
                let written = tokio::task::spawn_blocking(move || terminal.write(&data))
                    .await
                    .map_err(|e| FlexiError::Other(format!("join error: {e}")))
                    .and_then(|r| r);
                if let Err(e) = written {
                    warn!(session_id = %id, sink_id, error = %e, "terminal write failed");
                    break;
                }
            }
            Ok(Some(SinkEvent::Resize { cols, rows })) => {
                if let Err(e) = terminal.resize(cols, rows) {
                    warn!(session_id = %id, sink_id, error = %e, "resize rejected");
                }
            }
            Ok(None) => {
                debug!(session_id = %id, sink_id, "sink closed");
                break;
            }
            Err(e) => {
                debug!(session_id = %id, sink_id, error = %e, "sink receive failed");
                break;
            }
        }
    }

    group.detach(sink_id).await;
    info!(session_id = %id, sink_id, "client detached");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_support::MockSink;

    const WAIT: Duration = Duration::from_secs(10);

    fn broker() -> SessionBroker {
        SessionBroker::new(BrokerOptions {
            send_timeout: Duration::from_secs(1),
            ..BrokerOptions::default()
        })
    }

    /// A shell loop that tags every line it reads, so output from the
    /// program is distinguishable from the terminal's own echo.
    fn tagging_shell() -> (String, Vec<String>) {
        (
            "/bin/sh".to_string(),
            vec![
                "-c".to_string(),
                r#"while IFS= read -r line; do echo "got:$line"; done"#.to_string(),
            ],
        )
    }

    #[tokio::test]
    async fn attach_unknown_session_fails_without_side_effects() {
        let broker = broker();
        let (sink, _tx) = MockSink::new();
        let missing = SessionId::generate();

        let err = broker.attach(&missing, sink.clone()).await.unwrap_err();
        assert!(matches!(err, FlexiError::SessionNotFound(_)));
        assert!(broker.is_empty().await);
        assert!(!broker.exists(&missing).await);
        assert!(sink.received().is_empty());
    }

    #[tokio::test]
    async fn unknown_session_lookups_fail() {
        let broker = broker();
        let missing = SessionId::generate();
        assert!(matches!(
            broker.resize(&missing, 80, 24).await,
            Err(FlexiError::SessionNotFound(_))
        ));
        assert!(matches!(
            broker.history(&missing).await,
            Err(FlexiError::SessionNotFound(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn spawn_failure_registers_nothing() {
        let broker = broker();
        let result = broker.create_session("/nonexistent/flexitty-binary", &[]).await;
        assert!(matches!(result, Err(FlexiError::Spawn(_))));
        assert!(broker.is_empty().await);
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn echo_reaches_every_sink() {
        let broker = broker();
        let id = broker.create_session("/bin/cat", &[]).await.unwrap();
        assert!(broker.exists(&id).await);

        let (a, tx_a) = MockSink::new();
        let (b, _tx_b) = MockSink::new();
        broker.attach(&id, a.clone()).await.unwrap();
        broker.attach(&id, b.clone()).await.unwrap();

        tx_a.send(SinkEvent::Input(b"hello\n".to_vec())).unwrap();
        assert!(a.wait_for(b"hello", WAIT).await);
        assert!(b.wait_for(b"hello", WAIT).await);

        broker.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn input_from_one_sink_is_written_once() {
        let broker = broker();
        let (cmd, args) = tagging_shell();
        let id = broker.create_session(&cmd, &args).await.unwrap();

        let (a, tx_a) = MockSink::new();
        let (b, _tx_b) = MockSink::new();
        broker.attach(&id, a.clone()).await.unwrap();
        broker.attach(&id, b.clone()).await.unwrap();

        tx_a.send(SinkEvent::Input(b"ls\n".to_vec())).unwrap();
        tx_a.send(SinkEvent::Input(b"end\n".to_vec())).unwrap();
        assert!(a.wait_for(b"got:end", WAIT).await);
        assert!(b.wait_for(b"got:end", WAIT).await);

        assert_eq!(a.count(b"got:ls"), 1);
        assert_eq!(b.count(b"got:ls"), 1);

        broker.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn late_sink_gets_history_first() {
        let broker = broker();
        let (cmd, args) = tagging_shell();
        let id = broker.create_session(&cmd, &args).await.unwrap();

        let (early, tx) = MockSink::new();
        broker.attach(&id, early.clone()).await.unwrap();
        tx.send(SinkEvent::Input(b"first\n".to_vec())).unwrap();
        assert!(early.wait_for(b"got:first", WAIT).await);

        let (late, _late_tx) = MockSink::new();
        broker.attach(&id, late.clone()).await.unwrap();
        assert!(late.count(b"got:first") == 1);

        tx.send(SinkEvent::Input(b"second\n".to_vec())).unwrap();
        assert!(late.wait_for(b"got:second", WAIT).await);
        assert_eq!(late.count(b"got:first"), 1);

        let history = broker.history(&id).await.unwrap();
        assert!(history.windows(b"got:second".len()).any(|w| w == b"got:second"));

        broker.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn closed_sink_is_detached_but_session_survives() {
        let broker = broker();
        let id = broker.create_session("/bin/cat", &[]).await.unwrap();
        let session = broker.session(&id).await.unwrap();

        let (a, tx_a) = MockSink::new();
        let (b, tx_b) = MockSink::new();
        broker.attach(&id, a.clone()).await.unwrap();
        broker.attach(&id, b.clone()).await.unwrap();
        assert_eq!(session.attached().await, 2);

        drop(tx_a);
        let deadline = tokio::time::Instant::now() + WAIT;
        while session.attached().await != 1 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(session.attached().await, 1);

        tx_b.send(SinkEvent::Input(b"still here\n".to_vec())).unwrap();
        assert!(b.wait_for(b"still here", WAIT).await);
        assert!(broker.exists(&id).await);

        broker.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn resize_event_from_sink_reaches_terminal() {
        let broker = broker();
        let id = broker.create_session("/bin/cat", &[]).await.unwrap();
        let (sink, tx) = MockSink::new();
        broker.attach(&id, sink).await.unwrap();

        tx.send(SinkEvent::Resize { cols: 100, rows: 30 }).unwrap();
        let session = broker.session(&id).await.unwrap();
        let deadline = tokio::time::Instant::now() + WAIT;
        while session.terminal().size() != (100, 30) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(session.terminal().size(), (100, 30));

        broker.resize(&id, 90, 20).await.unwrap();
        assert_eq!(session.terminal().size(), (90, 20));

        broker.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_stops_every_pump() {
        let broker = broker();
        let id = broker.create_session("/bin/cat", &[]).await.unwrap();
        let (sink, _tx) = MockSink::new();
        broker.attach(&id, sink).await.unwrap();
        let session = broker.session(&id).await.unwrap();
        assert!(!session.pumps_finished());

        assert_eq!(broker.shutdown().await, 0);

        assert!(session.pumps_finished());
        assert!(session.terminal().is_closed());
        assert_eq!(session.attached().await, 0);
        assert!(broker.create_session("/bin/cat", &[]).await.is_err());
        let (late, _late_tx) = MockSink::new();
        assert!(broker.attach(&id, late).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn session_started_during_shutdown_is_not_registered() {
        let broker = broker();
        let session = broker.open_session("/bin/cat", &[]).unwrap();

        assert_eq!(broker.shutdown().await, 0);

        let result = broker.register(session.clone()).await;
        assert!(result.is_err());
        assert!(broker.is_empty().await);
        assert!(!broker.exists(&session.id()).await);
        assert!(session.terminal().is_closed());
        assert!(session.pumps_finished());
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sink_dropped_after_failed_delivery_stops_typing() {
        let broker = broker();
        let id = broker.create_session("/bin/cat", &[]).await.unwrap();
        let session = broker.session(&id).await.unwrap();

        let (watcher, tx_watcher) = MockSink::new();
        let (broken, tx_broken) = MockSink::failing();
        broker.attach(&id, watcher.clone()).await.unwrap();
        broker.attach(&id, broken.clone()).await.unwrap();

        // The echo of this line is the first delivery, and it fails for `broken`.
        tx_broken.send(SinkEvent::Input(b"one\n".to_vec())).unwrap();
        assert!(watcher.wait_for(b"one", WAIT).await);
        let deadline = tokio::time::Instant::now() + WAIT;
        while session.attached().await != 1 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(session.attached().await, 1);

        let _ = tx_broken.send(SinkEvent::Input(b"ghost\n".to_vec()));
        tx_watcher.send(SinkEvent::Input(b"marker\n".to_vec())).unwrap();
        assert!(watcher.wait_for(b"marker", WAIT).await);
        assert_eq!(watcher.count(b"ghost"), 0);

        broker.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn without_replay_late_sink_gets_only_live_output() {
        let broker = SessionBroker::new(BrokerOptions {
            send_timeout: Duration::from_secs(1),
            replay_on_attach: false,
            ..BrokerOptions::default()
        });
        let (cmd, args) = tagging_shell();
        let id = broker.create_session(&cmd, &args).await.unwrap();

        let (early, tx) = MockSink::new();
        broker.attach(&id, early.clone()).await.unwrap();
        tx.send(SinkEvent::Input(b"first\n".to_vec())).unwrap();
        assert!(early.wait_for(b"got:first", WAIT).await);

        let (late, _late_tx) = MockSink::new();
        broker.attach(&id, late.clone()).await.unwrap();

        tx.send(SinkEvent::Input(b"second\n".to_vec())).unwrap();
        assert!(late.wait_for(b"got:second", WAIT).await);
        assert_eq!(late.count(b"got:first"), 0);

        broker.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn exited_process_keeps_session_registered() {
        let broker = broker();
        let id = broker
            .create_session("/bin/echo", &["done".to_string()])
            .await
            .unwrap();
        let session = broker.session(&id).await.unwrap();

        let deadline = tokio::time::Instant::now() + WAIT;
        while !session.pumps_finished() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(session.pumps_finished());
        assert!(broker.exists(&id).await);
        let history = broker.history(&id).await.unwrap();
        assert!(history.windows(4).any(|w| w == b"done"));
    }
}
