//! # Connection Management
//!
//! Owns the session with the coordination service. A supervisor task opens
//! the session with exponential backoff, turns raw session events into
//! [`ConnectionState`] transitions and replaces the session after it is lost.
//! Transitions are published three ways:
//!
//! - the current state through a `watch` channel ([`ConnectionManager::state`])
//! - every transition through a `broadcast` channel, for watch and election tasks
//! - a serial dispatch queue that runs registered [`SessionStateHandler`]s
//!
//! Operations go through [`ConnectionManager::with_retry`], which retries
//! connection-level failures according to the configured policy.

use futures_util::FutureExt;
use keeper_core::{
    ConnectionState, CoordinationService, ExponentialBackoffRetry, KeeperConfig, KeeperError,
    KeeperResult, RetryPolicy, Session, SessionEvent, SessionId, SessionOptions,
};
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::dispatcher::{SerialDispatcher, SessionStateHandler};

const TRANSITION_CHANNEL_CAPACITY: usize = 256;

/// The session currently held by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveSession {
    pub id: SessionId,
    pub timeout: Duration,
}

type StateListeners = Arc<RwLock<Vec<Arc<dyn SessionStateHandler>>>>;

/// Session owner shared by the store, the watcher and the electors.
pub struct ConnectionManager {
    config: KeeperConfig,
    service: Arc<dyn CoordinationService>,
    retry: ExponentialBackoffRetry,
    session: Arc<RwLock<Option<ActiveSession>>>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    transitions: broadcast::Sender<ConnectionState>,
    listeners: StateListeners,
    shutdown_tx: watch::Sender<bool>,
    started: AtomicBool,
    stopped: AtomicBool,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(config: KeeperConfig, service: Arc<dyn CoordinationService>) -> KeeperResult<Self> {
        config.validate()?;
        let retry = config.retry_policy();
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (transitions, _) = broadcast::channel(TRANSITION_CHANNEL_CAPACITY);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            service,
            retry,
            session: Arc::new(RwLock::new(None)),
            state_tx: Arc::new(state_tx),
            transitions,
            listeners: Arc::new(RwLock::new(Vec::new())),
            shutdown_tx,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            supervisor: Mutex::new(None),
        })
    }

    /// Starts the session supervisor and returns without waiting for the
    /// first connection. Calling it again is a no-op.
    ///
    /// Must be called within a Tokio runtime; otherwise it fails with
    /// [`KeeperError::Internal`] and can be retried from inside one.
    pub fn init(&self) -> KeeperResult<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(KeeperError::Closed);
        }
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(KeeperError::internal(
                "connection manager must be initialised within a Tokio runtime",
            ));
        }
        if self.started.swap(true, Ordering::AcqRel) {
            warn!(address = %self.config.address, "connection manager already initialised");
            return Ok(());
        }

        info!(
            address = %self.config.address,
            base_sleep_ms = self.retry.base_sleep().as_millis() as u64,
            max_retries = self.retry.max_retries(),
            "starting coordination session"
        );

        let listeners = self.listeners.clone();
        let dispatcher = SerialDispatcher::spawn("connection-state", move |state| {
            let listeners: Vec<_> = listeners.read().clone();
            handle_transition(state, listeners)
        });

        let supervisor = Supervisor {
            service: self.service.clone(),
            options: SessionOptions {
                connect_string: self.config.address.clone(),
                session_timeout: self.config.session_timeout(),
            },
            retry: self.retry,
            session: self.session.clone(),
            state_tx: self.state_tx.clone(),
            transitions: self.transitions.clone(),
            dispatcher,
        };
        supervisor.publish(ConnectionState::Connecting);

        let shutdown = self.shutdown_tx.subscribe();
        *self.supervisor.lock() = Some(tokio::spawn(supervisor.run(shutdown)));
        Ok(())
    }

    /// Closes the session and signals every client task to finish.
    /// Safe to call repeatedly and without a prior `init`.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(address = %self.config.address, "stopping coordination session");
        self.shutdown_tx.send_replace(true);

        let supervisor = self.supervisor.lock().take();
        if let Some(handle) = supervisor {
            if let Err(err) = handle.await {
                error!(error = %err, "session supervisor terminated abnormally");
            }
        }
        self.session.write().take();
        self.state_tx.send_replace(ConnectionState::Disconnected);
    }

    /// Appends a listener run on every `RECONNECTED` transition.
    pub fn add_state_listener(&self, listener: Arc<dyn SessionStateHandler>) {
        self.listeners.write().push(listener);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Current state plus every later change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Ordered stream of transitions from now on.
    pub fn subscribe_state(&self) -> broadcast::Receiver<ConnectionState> {
        self.transitions.subscribe()
    }

    /// Resolves once `stop` has been called.
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn current_session(&self) -> Option<ActiveSession> {
        *self.session.read()
    }

    pub fn service(&self) -> &Arc<dyn CoordinationService> {
        &self.service
    }

    pub fn config(&self) -> &KeeperConfig {
        &self.config
    }

    pub fn retry_policy(&self) -> &ExponentialBackoffRetry {
        &self.retry
    }

    /// Waits for a usable session; `None` uses the configured connection
    /// timeout.
    pub async fn wait_until_connected(&self, timeout: Option<Duration>) -> KeeperResult<SessionId> {
        self.ensure_running()?;
        if let Some(active) = self.connected_session() {
            return Ok(active.id);
        }

        let timeout = timeout.unwrap_or_else(|| self.config.effective_connection_timeout());
        let mut state = self.state_tx.subscribe();
        let mut shutdown = self.shutdown_tx.subscribe();
        let wait = async {
            loop {
                {
                    let current = *state.borrow_and_update();
                    if current.is_connected() {
                        if let Some(active) = self.current_session() {
                            return Ok(active.id);
                        }
                    }
                }
                tokio::select! {
                    changed = state.changed() => {
                        if changed.is_err() {
                            return Err(KeeperError::Closed);
                        }
                    }
                    _ = shutdown_signalled(&mut shutdown) => return Err(KeeperError::Closed),
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(KeeperError::timeout("waiting for connection")),
        }
    }

    /// Runs `op` against the current session, retrying retryable failures
    /// with the configured backoff.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// # use keeper_client::ConnectionManager;
    /// # async fn read(manager: &ConnectionManager) -> keeper_core::KeeperResult<()> {
    /// let service = manager.service();
    /// let stat = manager
    ///     .with_retry("exists", move |session| service.exists(session, "/app", None))
    ///     .await?;
    /// println!("present: {}", stat.is_some());
    /// # Ok(())
    /// # }
    /// ```
    pub async fn with_retry<T, F, Fut>(&self, operation: &str, mut op: F) -> KeeperResult<T>
    where
        F: FnMut(SessionId) -> Fut,
        Fut: Future<Output = KeeperResult<T>>,
    {
        let mut retry_count = 0;
        loop {
            let result = match self.wait_until_connected(None).await {
                Ok(session) => op(session).await,
                Err(err) => Err(err),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && !self.is_stopped() => {
                    match self.retry.allow_retry(retry_count) {
                        Some(delay) => {
                            debug!(
                                operation,
                                retry = retry_count + 1,
                                delay_ms = delay.as_millis() as u64,
                                error = %err,
                                "retrying operation"
                            );
                            retry_count += 1;
                            tokio::time::sleep(delay).await;
                        }
                        None => return Err(err),
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn ensure_running(&self) -> KeeperResult<()> {
        if self.is_stopped() {
            return Err(KeeperError::Closed);
        }
        if !self.is_started() {
            return Err(KeeperError::NotStarted);
        }
        Ok(())
    }

    fn connected_session(&self) -> Option<ActiveSession> {
        if self.state().is_connected() {
            self.current_session()
        } else {
            None
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}

/// Resolves once the shutdown flag is set or its sender is gone.
pub(crate) async fn shutdown_signalled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn handle_transition(state: ConnectionState, listeners: Vec<Arc<dyn SessionStateHandler>>) {
    match state {
        ConnectionState::Connected => warn!(%state, "connected to coordination service"),
        ConnectionState::Suspended => warn!(%state, "connection suspended"),
        ConnectionState::Lost => warn!(%state, "session lost, waiting for a new session"),
        ConnectionState::Reconnected => {
            warn!(%state, listeners = listeners.len(), "reconnected to coordination service");
            for listener in listeners {
                if AssertUnwindSafe(listener.reconnected())
                    .catch_unwind()
                    .await
                    .is_err()
                {
                    error!("state listener panicked");
                }
            }
        }
        ConnectionState::Connecting | ConnectionState::Disconnected => {
            debug!(%state, "connection state changed")
        }
    }
}

enum SessionEnd {
    Shutdown,
    Lost,
}

/// Background task owning the raw session.
struct Supervisor {
    service: Arc<dyn CoordinationService>,
    options: SessionOptions,
    retry: ExponentialBackoffRetry,
    session: Arc<RwLock<Option<ActiveSession>>>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    transitions: broadcast::Sender<ConnectionState>,
    dispatcher: SerialDispatcher<ConnectionState>,
}

impl Supervisor {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ever_connected = false;

        loop {
            let session = tokio::select! {
                session = self.open_with_backoff() => session,
                _ = shutdown_signalled(&mut shutdown) => break,
            };

            let active = ActiveSession {
                id: session.id,
                timeout: session.negotiated_timeout,
            };
            *self.session.write() = Some(active);
            info!(
                session = %active.id,
                timeout_ms = active.timeout.as_millis() as u64,
                "session established"
            );
            self.publish(if ever_connected {
                ConnectionState::Reconnected
            } else {
                ConnectionState::Connected
            });
            ever_connected = true;

            match self.monitor(session, &mut shutdown).await {
                SessionEnd::Shutdown => {
                    if let Err(err) = self.service.close_session(active.id).await {
                        warn!(session = %active.id, error = %err, "failed to close session");
                    }
                    self.session.write().take();
                    break;
                }
                SessionEnd::Lost => {
                    self.session.write().take();
                    self.publish(ConnectionState::Lost);
                    // the service may still hold it after a local expiry
                    if let Err(err) = self.service.close_session(active.id).await {
                        debug!(session = %active.id, error = %err, "failed to close lost session");
                    }
                }
            }
        }
        debug!("session supervisor stopped");
    }

    /// Opens a session, one retry round at a time, until it succeeds.
    async fn open_with_backoff(&self) -> Session {
        loop {
            let mut retry_count = 0;
            loop {
                match self.service.open_session(self.options.clone()).await {
                    Ok(session) => return session,
                    Err(err) => match self.retry.allow_retry(retry_count) {
                        Some(delay) => {
                            warn!(
                                attempt = retry_count + 1,
                                retry_in_ms = delay.as_millis() as u64,
                                error = %err,
                                "failed to open session, retrying"
                            );
                            retry_count += 1;
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            error!(
                                attempts = self.retry.max_attempts(),
                                error = %err,
                                "failed to open session after all retry attempts"
                            );
                            break;
                        }
                    },
                }
            }
            tokio::time::sleep(self.retry.max_sleep()).await;
        }
    }

    async fn monitor(&self, mut session: Session, shutdown: &mut watch::Receiver<bool>) -> SessionEnd {
        let mut expires_at: Option<Instant> = None;

        loop {
            let deadline = expires_at;
            let local_expiry = async move {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = shutdown_signalled(shutdown) => return SessionEnd::Shutdown,
                event = session.events.recv() => match event {
                    Some(SessionEvent::Disconnected) => {
                        if expires_at.is_none() {
                            expires_at = Some(Instant::now() + session.negotiated_timeout);
                            self.publish(ConnectionState::Suspended);
                        }
                    }
                    Some(SessionEvent::SyncConnected) => {
                        if expires_at.take().is_some() {
                            self.publish(ConnectionState::Reconnected);
                        }
                    }
                    Some(SessionEvent::Expired) => {
                        warn!(session = %session.id, "session expired by the service");
                        return SessionEnd::Lost;
                    }
                    None => {
                        warn!(session = %session.id, "session event stream closed");
                        return SessionEnd::Lost;
                    }
                },
                _ = local_expiry => {
                    warn!(
                        session = %session.id,
                        timeout_ms = session.negotiated_timeout.as_millis() as u64,
                        "suspended past the session timeout, treating session as lost"
                    );
                    return SessionEnd::Lost;
                }
            }
        }
    }

    fn publish(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        debug!(from = %previous, to = %state, "connection transition");
        let _ = self.transitions.send(state);
        self.dispatcher.dispatch(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keeper_memory::MemoryCoordinationService;
    use std::sync::atomic::AtomicUsize;

    fn config() -> KeeperConfig {
        KeeperConfig::new("memory:2181")
            .with_session_timeout(Duration::from_millis(200))
            .with_retry(Duration::from_millis(10), 3)
    }

    fn manager(service: Arc<MemoryCoordinationService>) -> ConnectionManager {
        let _ = tracing_subscriber::fmt::try_init();
        ConnectionManager::new(config(), service).unwrap()
    }

    async fn next_state(rx: &mut broadcast::Receiver<ConnectionState>) -> ConnectionState {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("transition within timeout")
            .unwrap()
    }

    #[test]
    fn test_init_outside_runtime_fails() {
        let service = Arc::new(MemoryCoordinationService::new());
        let manager = manager(service.clone());
        assert!(matches!(manager.init(), Err(KeeperError::Internal { .. })));
        assert!(!manager.is_started());

        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            manager.init().unwrap();
            manager.wait_until_connected(None).await.unwrap();
            manager.stop().await;
        });
        assert_eq!(service.get_stats().open_sessions, 0);
    }

    #[tokio::test]
    async fn test_init_connects() {
        let service = Arc::new(MemoryCoordinationService::new());
        let manager = manager(service.clone());
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        manager.init().unwrap();
        let session = manager
            .wait_until_connected(Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert!(service.session_exists(session));

        // second init is a no-op
        manager.init().unwrap();
        assert_eq!(service.sessions().len(), 1);

        manager.stop().await;
        assert!(!service.session_exists(session));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_stop_without_init_and_twice() {
        let service = Arc::new(MemoryCoordinationService::new());
        let manager = manager(service);
        manager.stop().await;
        manager.stop().await;
        assert!(matches!(manager.init(), Err(KeeperError::Closed)));
    }

    #[tokio::test]
    async fn test_with_retry_before_init() {
        let service = Arc::new(MemoryCoordinationService::new());
        let manager = manager(service.clone());
        let svc = manager.service();
        let result = manager
            .with_retry("exists", move |session| svc.exists(session, "/", None))
            .await;
        assert!(matches!(result, Err(KeeperError::NotStarted)));
        assert_eq!(service.operation_count(), 0);
    }

    #[tokio::test]
    async fn test_suspend_and_reconnect_notifies_listeners() {
        let service = Arc::new(MemoryCoordinationService::new());
        let manager = manager(service.clone());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        manager.add_state_listener(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let mut transitions = manager.subscribe_state();
        manager.init().unwrap();
        assert_eq!(next_state(&mut transitions).await, ConnectionState::Connected);
        let session = manager.current_session().unwrap().id;

        service.disconnect_session(session);
        assert_eq!(next_state(&mut transitions).await, ConnectionState::Suspended);
        service.reconnect_session(session);
        assert_eq!(next_state(&mut transitions).await, ConnectionState::Reconnected);

        tokio::time::timeout(Duration::from_secs(1), async {
            while calls.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(manager.current_session().unwrap().id, session);
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_expiry_replaces_session() {
        let service = Arc::new(MemoryCoordinationService::new());
        let manager = manager(service.clone());
        let mut transitions = manager.subscribe_state();
        manager.init().unwrap();
        assert_eq!(next_state(&mut transitions).await, ConnectionState::Connected);
        let first = manager.current_session().unwrap().id;

        service.expire_session(first);
        assert_eq!(next_state(&mut transitions).await, ConnectionState::Lost);
        assert_eq!(next_state(&mut transitions).await, ConnectionState::Reconnected);

        let second = manager.current_session().unwrap().id;
        assert_ne!(first, second);
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_local_expiry_while_suspended() {
        let service = Arc::new(MemoryCoordinationService::new());
        let manager = manager(service.clone());
        let mut transitions = manager.subscribe_state();
        manager.init().unwrap();
        assert_eq!(next_state(&mut transitions).await, ConnectionState::Connected);
        let session = manager.current_session().unwrap().id;

        service.disconnect_session(session);
        assert_eq!(next_state(&mut transitions).await, ConnectionState::Suspended);
        // never reconnected: the 200ms session timeout runs out locally
        assert_eq!(next_state(&mut transitions).await, ConnectionState::Lost);
        assert_eq!(next_state(&mut transitions).await, ConnectionState::Reconnected);
        assert!(!service.session_exists(session));
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_with_retry_gives_up_after_policy() {
        let service = Arc::new(MemoryCoordinationService::new());
        let manager = manager(service.clone());
        manager.init().unwrap();
        manager.wait_until_connected(None).await.unwrap();

        service.set_available(false);
        let before = service.operation_count();
        let svc = manager.service();
        let err = manager
            .with_retry("exists", move |session| svc.exists(session, "/", None))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        // first attempt plus three retries
        assert_eq!(service.operation_count() - before, 4);

        service.set_available(true);
        manager.stop().await;
    }
}
