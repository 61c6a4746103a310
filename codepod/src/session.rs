//! Terminal session multiplexer.
//!
//! Each session owns one interactive exec channel inside its project's
//! instance. Output is pumped into a bounded per-session channel, so a slow
//! consumer only back-pressures its own shell. Sessions are keyed by id in a
//! [`SessionRegistry`] shared with the pool manager, which closes every
//! session of an instance at teardown.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use codepod_protocol::{SessionEvent, SessionStatus};
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::{RuntimeConfig, SessionConfig};
use crate::error::RuntimeError;
use crate::runtime::{ExecControl, ExecRequest, TerminalSize};
use crate::workspace::WorkspaceManager;

/// Output-driven activity is recorded at most this often per session.
const TOUCH_INTERVAL: Duration = Duration::from_secs(1);

/// How long a full channel may delay the final `Ended` event.
const ENDED_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// A registered terminal session.
pub struct Session {
    pub session_id: String,
    pub project_id: String,
    pub created_at: DateTime<Utc>,
    input: tokio::sync::Mutex<Pin<Box<dyn AsyncWrite + Send>>>,
    control: Arc<dyn ExecControl>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("project_id", &self.project_id)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn status(&self) -> SessionStatus {
        if self.cancel.is_cancelled() {
            SessionStatus::Closed
        } else {
            SessionStatus::Active
        }
    }

    /// Stop the output pump and kill the shell. Idempotent.
    async fn close(&self) {
        self.cancel.cancel();
        if let Err(e) = self.control.kill().await {
            debug!(session_id = %self.session_id, error = %e, "kill on close failed");
        }
    }
}

/// Sessions by id.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Session>>> {
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn insert(&self, session: Arc<Session>) -> Result<(), RuntimeError> {
        let mut sessions = self.lock();
        if sessions.contains_key(&session.session_id) {
            return Err(RuntimeError::DuplicateSession(session.session_id.clone()));
        }
        sessions.insert(session.session_id.clone(), session);
        Ok(())
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.lock().contains_key(session_id)
    }

    pub fn get(&self, session_id: &str) -> Result<Arc<Session>, RuntimeError> {
        self.lock()
            .get(session_id)
            .cloned()
            .ok_or_else(|| RuntimeError::SessionNotFound(session_id.to_string()))
    }

    pub fn remove(&self, session_id: &str) -> Option<Arc<Session>> {
        self.lock().remove(session_id)
    }

    /// Remove `session` only if it is still the one registered under its id.
    fn remove_exact(&self, session: &Arc<Session>) -> bool {
        let mut sessions = self.lock();
        match sessions.get(&session.session_id) {
            Some(current) if Arc::ptr_eq(current, session) => {
                sessions.remove(&session.session_id);
                true
            }
            _ => false,
        }
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }

    pub fn count_for_project(&self, project_id: &str) -> usize {
        self.lock()
            .values()
            .filter(|s| s.project_id == project_id)
            .count()
    }

    /// Deregister and close every session of a project. Returns how many
    /// were closed.
    pub async fn close_project(&self, project_id: &str) -> usize {
        let closing: Vec<Arc<Session>> = {
            let mut sessions = self.lock();
            let ids: Vec<String> = sessions
                .values()
                .filter(|s| s.project_id == project_id)
                .map(|s| s.session_id.clone())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };
        for session in &closing {
            session.close().await;
        }
        closing.len()
    }
}

/// Ordered event stream of one session. Ends after [`SessionEvent::Ended`].
pub struct TerminalStream {
    session_id: String,
    inner: ReceiverStream<SessionEvent>,
}

impl TerminalStream {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl Stream for TerminalStream {
    type Item = SessionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl std::fmt::Debug for TerminalStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalStream")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

pub struct TerminalMultiplexer {
    manager: Arc<WorkspaceManager>,
    sessions: Arc<SessionRegistry>,
    config: SessionConfig,
    shell: Vec<String>,
    workdir: String,
}

impl TerminalMultiplexer {
    pub fn new(
        manager: Arc<WorkspaceManager>,
        config: SessionConfig,
        runtime: &RuntimeConfig,
    ) -> Self {
        let sessions = Arc::clone(manager.sessions());
        Self {
            manager,
            sessions,
            config,
            shell: runtime.shell.clone(),
            workdir: runtime.workdir.clone(),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Open an interactive shell for `session_id` in the project's instance,
    /// acquiring the instance first if needed.
    #[instrument(skip(self))]
    pub async fn create_session(
        &self,
        project_id: &str,
        owner_user_id: &str,
        session_id: &str,
    ) -> Result<TerminalStream, RuntimeError> {
        if self.sessions.contains(session_id) {
            return Err(RuntimeError::DuplicateSession(session_id.to_string()));
        }
        self.manager.acquire(project_id, owner_user_id).await?;

        let request = ExecRequest {
            command: self.shell.clone(),
            tty: true,
            size: Some(TerminalSize {
                cols: self.config.default_cols,
                rows: self.config.default_rows,
            }),
            working_dir: Some(self.workdir.clone()),
            env: vec!["TERM=xterm-256color".into()],
        };
        let channel = self.manager.open_exec(project_id, request).await?;

        let session = Arc::new(Session {
            session_id: session_id.to_string(),
            project_id: project_id.to_string(),
            created_at: Utc::now(),
            input: tokio::sync::Mutex::new(channel.input),
            control: channel.control,
            cancel: CancellationToken::new(),
        });
        if let Err(e) = self.sessions.insert(Arc::clone(&session)) {
            session.close().await;
            return Err(e);
        }
        // The instance may have been torn down while the channel opened.
        if !self.manager.is_running(project_id).await {
            self.sessions.remove_exact(&session);
            session.close().await;
            return Err(RuntimeError::Liveness {
                project_id: project_id.to_string(),
                message: "instance stopped while opening session".into(),
            });
        }

        let (tx, rx) = mpsc::channel(self.config.output_buffer.max(1));
        tokio::spawn(pump_output(
            Arc::clone(&self.manager),
            Arc::clone(&self.sessions),
            Arc::clone(&session),
            channel.output,
            tx,
        ));
        self.manager.touch(project_id).await;
        self.update_gauge();

        info!(
            project_id = %project_id,
            session_id = %session_id,
            sessions = self.sessions.count_for_project(project_id),
            "terminal session opened"
        );
        Ok(TerminalStream {
            session_id: session_id.to_string(),
            inner: ReceiverStream::new(rx),
        })
    }

    pub async fn resize(&self, session_id: &str, cols: u16, rows: u16) -> Result<(), RuntimeError> {
        let session = self.sessions.get(session_id)?;
        session
            .control
            .resize(TerminalSize { cols, rows })
            .await
            .map_err(|e| RuntimeError::Liveness {
                project_id: session.project_id.clone(),
                message: format!("resize failed: {:#}", e),
            })
    }

    /// Forward bytes to the session's shell.
    pub async fn write(&self, session_id: &str, data: &[u8]) -> Result<(), RuntimeError> {
        let session = self.sessions.get(session_id)?;
        let written = {
            let mut input = session.input.lock().await;
            match input.write_all(data).await {
                Ok(()) => input.flush().await,
                Err(e) => Err(e),
            }
        };
        if let Err(e) = written {
            // A broken pipe means the shell is gone; the pump reports the end.
            if !self.sessions.contains(session_id) {
                return Err(RuntimeError::SessionNotFound(session_id.to_string()));
            }
            return Err(RuntimeError::Liveness {
                project_id: session.project_id.clone(),
                message: format!("writing to session {}: {}", session_id, e),
            });
        }
        self.manager.touch(&session.project_id).await;
        Ok(())
    }

    /// Close the session and let the pool manager reconsider eviction.
    #[instrument(skip(self))]
    pub async fn terminate(&self, session_id: &str) -> Result<(), RuntimeError> {
        let session = self
            .sessions
            .remove(session_id)
            .ok_or_else(|| RuntimeError::SessionNotFound(session_id.to_string()))?;
        session.close().await;
        self.update_gauge();
        info!(
            session_id = %session_id,
            project_id = %session.project_id,
            "terminal session closed"
        );
        reconsider_eviction(&self.manager, &self.sessions, &session.project_id).await;
        Ok(())
    }

    fn update_gauge(&self) {
        if let Some(metrics) = self.manager.metrics() {
            metrics.set_sessions(self.sessions.count() as i64);
        }
    }
}

/// Ask the pool manager to apply the idle rule once a project has no sessions.
async fn reconsider_eviction(
    manager: &WorkspaceManager,
    sessions: &SessionRegistry,
    project_id: &str,
) {
    if sessions.count_for_project(project_id) == 0 && manager.evict(project_id, false).await {
        info!(project_id = %project_id, "idle instance evicted after last session closed");
    }
}

/// Forward exec output to the session channel until the shell exits, the
/// session is closed, or the consumer goes away.
async fn pump_output(
    manager: Arc<WorkspaceManager>,
    sessions: Arc<SessionRegistry>,
    session: Arc<Session>,
    mut output: BoxStream<'static, std::io::Result<Bytes>>,
    tx: mpsc::Sender<SessionEvent>,
) {
    let session_id = session.session_id.clone();
    let mut last_touch = Instant::now();
    let mut consumer_gone = false;

    loop {
        let next = tokio::select! {
            _ = session.cancel.cancelled() => break,
            next = output.next() => next,
        };
        let event = match next {
            Some(Ok(data)) => SessionEvent::Output {
                session_id: session_id.clone(),
                data: data.to_vec(),
            },
            Some(Err(e)) => {
                warn!(session_id = %session_id, error = %e, "session output failed");
                let _ = tx
                    .send(SessionEvent::Error {
                        session_id: session_id.clone(),
                        message: e.to_string(),
                    })
                    .await;
                break;
            }
            None => break,
        };

        let sent = tokio::select! {
            _ = session.cancel.cancelled() => break,
            sent = tx.send(event) => sent,
        };
        if sent.is_err() {
            consumer_gone = true;
            break;
        }
        if last_touch.elapsed() >= TOUCH_INTERVAL {
            manager.touch(&session.project_id).await;
            last_touch = Instant::now();
        }
    }

    if !consumer_gone {
        let ended = SessionEvent::Ended {
            session_id: session_id.clone(),
        };
        if tokio::time::timeout(ENDED_SEND_TIMEOUT, tx.send(ended)).await.is_err() {
            debug!(session_id = %session_id, "consumer not draining, dropped end event");
        }
    }
    drop(tx);

    // Terminated sessions were already deregistered by whoever closed them.
    if sessions.remove_exact(&session) {
        session.close().await;
        if let Some(metrics) = manager.metrics() {
            metrics.set_sessions(sessions.count() as i64);
        }
        info!(
            session_id = %session_id,
            project_id = %session.project_id,
            consumer_gone,
            "terminal session ended"
        );
        reconsider_eviction(&manager, &sessions, &session.project_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use crate::metrics::MetricsRegistry;
    use crate::runtime::fake::test_config;
    use crate::runtime::local::LocalRuntime;
    use crate::storage::MemoryObjectStore;
    use crate::sync::FileCacheSync;
    use codepod_protocol::ErrorKind;

    struct Harness {
        _dir: tempfile::TempDir,
        manager: Arc<WorkspaceManager>,
        mux: TerminalMultiplexer,
    }

    fn harness(idle_timeout_secs: u64) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.pool.idle_timeout_secs = idle_timeout_secs;
        let sync = Arc::new(FileCacheSync::new(
            config.sync.clone(),
            Arc::new(MemoryObjectStore::new()),
            Arc::new(MemoryLedger::new()),
            None,
        ));
        let session_config = config.session.clone();
        let runtime_config = config.runtime.clone();
        let manager = WorkspaceManager::new(
            config,
            Arc::new(LocalRuntime::new()),
            sync,
            Arc::new(SessionRegistry::new()),
            Some(MetricsRegistry::new()),
        );
        let mux = TerminalMultiplexer::new(Arc::clone(&manager), session_config, &runtime_config);
        Harness {
            _dir: dir,
            manager,
            mux,
        }
    }

    /// Collect output until `needle` shows up or the stream ends.
    async fn read_until(stream: &mut TerminalStream, needle: &str) -> String {
        let mut seen = String::new();
        let collect = async {
            while let Some(event) = stream.next().await {
                match event {
                    SessionEvent::Output { data, .. } => {
                        seen.push_str(&String::from_utf8_lossy(&data));
                        if seen.contains(needle) {
                            break;
                        }
                    }
                    SessionEvent::Ended { .. } => break,
                    SessionEvent::Error { message, .. } => panic!("session error: {message}"),
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(10), collect)
            .await
            .expect("timed out waiting for output");
        seen
    }

    #[tokio::test]
    async fn test_echo_round_trip() {
        let h = harness(3600);
        let mut stream = h.mux.create_session("p1", "u1", "s1").await.unwrap();
        assert_eq!(stream.session_id(), "s1");
        h.mux.write("s1", b"echo hi\n").await.unwrap();
        let out = read_until(&mut stream, "hi").await;
        assert!(out.contains("hi"), "{out:?}");
        h.mux.resize("s1", 120, 40).await.unwrap();
    }

    #[tokio::test]
    async fn test_write_after_close_is_session_not_found() {
        let h = harness(3600);
        let _stream = h.mux.create_session("p1", "u1", "s1").await.unwrap();
        h.mux.terminate("s1").await.unwrap();

        let err = h.mux.write("s1", b"echo hi\n").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionNotFound);
        let err = h.mux.resize("s1", 80, 24).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionNotFound);
        let err = h.mux.terminate("s1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionNotFound);
    }

    #[tokio::test]
    async fn test_duplicate_session_rejected() {
        let h = harness(3600);
        let _stream = h.mux.create_session("p1", "u1", "s1").await.unwrap();
        let err = h.mux.create_session("p1", "u1", "s1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
        assert_eq!(h.mux.sessions().count(), 1);
    }

    #[tokio::test]
    async fn test_sessions_share_one_instance_with_separate_output() {
        let h = harness(3600);
        let mut a = h.mux.create_session("p1", "u1", "a").await.unwrap();
        let mut b = h.mux.create_session("p1", "u2", "b").await.unwrap();
        assert_eq!(h.manager.list().await.len(), 1);

        h.mux.write("a", b"echo from-a\n").await.unwrap();
        h.mux.write("b", b"echo from-b\n").await.unwrap();
        let out_a = read_until(&mut a, "from-a").await;
        let out_b = read_until(&mut b, "from-b").await;
        assert!(!out_a.contains("from-b"));
        assert!(!out_b.contains("from-a"));
        assert_eq!(h.mux.sessions().count_for_project("p1"), 2);
    }

    #[tokio::test]
    async fn test_shell_exit_emits_ended_and_deregisters() {
        let h = harness(3600);
        let mut stream = h.mux.create_session("p1", "u1", "s1").await.unwrap();
        h.mux.write("s1", b"exit\n").await.unwrap();

        let ended = tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(event) = stream.next().await {
                if let SessionEvent::Ended { session_id } = event {
                    return session_id;
                }
            }
            String::new()
        })
        .await
        .unwrap();
        assert_eq!(ended, "s1");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!h.mux.sessions().contains("s1"));
        // Recently active, so the instance survives.
        assert!(h.manager.is_running("p1").await);
    }

    #[tokio::test]
    async fn test_last_session_close_evicts_idle_instance() {
        let h = harness(0);
        let _stream = h.mux.create_session("p1", "u1", "s1").await.unwrap();
        h.mux.terminate("s1").await.unwrap();
        assert!(h.manager.get("p1").await.is_none());
    }

    #[tokio::test]
    async fn test_eviction_closes_sessions() {
        let h = harness(3600);
        let mut stream = h.mux.create_session("p1", "u1", "s1").await.unwrap();
        assert!(h.manager.evict("p1", true).await);
        assert_eq!(h.mux.sessions().count(), 0);

        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            while stream.next().await.is_some() {}
        })
        .await;
        assert!(drained.is_ok());
    }
}
