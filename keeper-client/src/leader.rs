//! Leader election over ephemeral sequential candidacy nodes.
//!
//! Each participant creates `_c_<participant>-lock-<sequence>` under the
//! election path. The candidate with the lowest sequence leads; every other
//! candidate watches only its immediate predecessor. A leader runs its task
//! once, then deletes its candidacy and queues up again.

use bytes::Bytes;
use keeper_core::path;
use keeper_core::{ConnectionState, CreateMode, EventKind, KeeperError, KeeperResult, Watcher};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::connection::{shutdown_signalled, ConnectionManager};
use crate::dispatcher::LeadershipTask;
use crate::store::NodeStore;

const CANDIDACY_PREFIX: &str = "_c_";
const LOCK_SUFFIX: &str = "-lock-";

/// Where an elector is in its election cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectorState {
    /// Queued behind other candidates, or waiting for a session
    Candidate,

    /// Running the leadership task
    Leader {
        /// Term number of this elector, starting at 1
        term: u64,
        /// When leadership was taken, milliseconds since the epoch
        since: u64,
    },

    /// Stopped; no longer participating
    Stopped,
}

impl fmt::Display for ElectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElectorState::Candidate => write!(f, "CANDIDATE"),
            ElectorState::Leader { term, .. } => write!(f, "LEADER(term {term})"),
            ElectorState::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// Counters for one elector.
#[derive(Debug, Default, Clone)]
pub struct ElectionStats {
    pub candidacies_created: u64,
    pub candidacies_lost: u64,
    pub terms_served: u64,
    pub revocations: u64,
    pub task_panics: u64,
}

/// Handed to the leadership task for the duration of one term.
#[derive(Clone)]
pub struct LeadershipContext {
    election_path: String,
    candidacy_path: String,
    participant_id: Uuid,
    term: u64,
    revoked: watch::Receiver<bool>,
    store: NodeStore,
}

impl LeadershipContext {
    pub fn election_path(&self) -> &str {
        &self.election_path
    }

    /// Our candidacy node for this term.
    pub fn candidacy_path(&self) -> &str {
        &self.candidacy_path
    }

    pub fn participant_id(&self) -> Uuid {
        self.participant_id
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    /// True once leadership can no longer be trusted: the connection was
    /// suspended or lost, the candidacy node vanished, or the elector was
    /// stopped. The task should wind down when it sees this.
    pub fn is_revoked(&self) -> bool {
        *self.revoked.borrow()
    }

    /// Resolves when leadership is revoked.
    pub async fn revoked(&self) {
        let mut revoked = self.revoked.clone();
        let _ = revoked.wait_for(|revoked| *revoked).await;
    }

    pub fn store(&self) -> &NodeStore {
        &self.store
    }
}

impl fmt::Debug for LeadershipContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeadershipContext")
            .field("election_path", &self.election_path)
            .field("candidacy_path", &self.candidacy_path)
            .field("participant_id", &self.participant_id)
            .field("term", &self.term)
            .field("revoked", &self.is_revoked())
            .finish()
    }
}

struct ElectorShared {
    participant_id: Uuid,
    election_path: String,
    state: RwLock<ElectorState>,
    stats: RwLock<ElectionStats>,
    terms_served: AtomicU64,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a running election participant.
#[derive(Clone)]
pub struct LeaderElector {
    shared: Arc<ElectorShared>,
}

impl LeaderElector {
    /// Joins the election under `election_path`, which must exist. Returns
    /// `None` without taking part when it does not.
    pub async fn start<A>(
        store: NodeStore,
        election_path: &str,
        task: Arc<dyn LeadershipTask<A>>,
        args: A,
    ) -> Option<Self>
    where
        A: Send + Sync + 'static,
    {
        match store.exists(election_path).await {
            Ok(true) => {}
            Ok(false) => {
                error!(election = election_path, "election path does not exist");
                return None;
            }
            Err(err) => {
                error!(election = election_path, error = %err, "cannot check election path");
                return None;
            }
        }

        let (stop_tx, _) = watch::channel(false);
        let shared = Arc::new(ElectorShared {
            participant_id: Uuid::new_v4(),
            election_path: election_path.to_string(),
            state: RwLock::new(ElectorState::Candidate),
            stats: RwLock::new(ElectionStats::default()),
            terms_served: AtomicU64::new(0),
            stop_tx,
            task: Mutex::new(None),
        });

        let store_shutdown = store.connection().shutdown_receiver();
        let election = Election {
            shared: shared.clone(),
            connection: store.connection().clone(),
            store,
            task,
            args: Arc::new(args),
            stop: shared.stop_tx.subscribe(),
            shutdown: store_shutdown,
        };
        info!(
            election = election_path,
            participant = %shared.participant_id,
            "joining election"
        );
        *shared.task.lock() = Some(tokio::spawn(election.run()));
        Some(Self { shared })
    }

    pub fn participant_id(&self) -> Uuid {
        self.shared.participant_id
    }

    pub fn election_path(&self) -> &str {
        &self.shared.election_path
    }

    pub fn state(&self) -> ElectorState {
        self.shared.state.read().clone()
    }

    pub fn is_leader(&self) -> bool {
        matches!(*self.shared.state.read(), ElectorState::Leader { .. })
    }

    /// Completed terms.
    pub fn terms_served(&self) -> u64 {
        self.shared.terms_served.load(Ordering::Acquire)
    }

    pub fn get_stats(&self) -> ElectionStats {
        self.shared.stats.read().clone()
    }

    /// Leaves the election. A running task is revoked but not interrupted;
    /// the candidacy is deleted once it returns.
    pub fn stop(&self) {
        if !self.shared.stop_tx.send_replace(true) {
            info!(
                election = %self.shared.election_path,
                participant = %self.shared.participant_id,
                "leaving election"
            );
        }
    }

    /// Waits for the election loop to finish after [`stop`](Self::stop) or
    /// client shutdown.
    pub async fn join(&self) {
        let handle = self.shared.task.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                error!(election = %self.shared.election_path, error = %err, "election loop failed");
            }
        }
    }
}

impl fmt::Debug for LeaderElector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaderElector")
            .field("election_path", &self.shared.election_path)
            .field("participant_id", &self.shared.participant_id)
            .field("state", &self.state())
            .finish()
    }
}

enum Standing {
    Leader,
    /// Our candidacy is gone; a new one is needed
    Lost,
    Stopped,
}

/// The election loop of one participant.
struct Election<A> {
    shared: Arc<ElectorShared>,
    connection: Arc<ConnectionManager>,
    store: NodeStore,
    task: Arc<dyn LeadershipTask<A>>,
    args: Arc<A>,
    stop: watch::Receiver<bool>,
    shutdown: watch::Receiver<bool>,
}

impl<A: Send + Sync + 'static> Election<A> {
    async fn run(mut self) {
        let mut failures: u32 = 0;

        while !self.should_stop() {
            self.set_state(ElectorState::Candidate);

            let candidacy = match self.create_candidacy().await {
                Ok(candidacy) => {
                    failures = 0;
                    candidacy
                }
                Err(err) => {
                    error!(
                        election = %self.shared.election_path,
                        error = %err,
                        "failed to create candidacy"
                    );
                    let delay = self.connection.retry_policy().sleep_for(failures);
                    failures = failures.saturating_add(1);
                    if self.pause(delay).await {
                        break;
                    }
                    continue;
                }
            };

            match self.await_leadership(&candidacy).await {
                Standing::Leader => {
                    self.lead(&candidacy).await;
                    self.relinquish(&candidacy).await;
                }
                Standing::Lost => {
                    self.shared.stats.write().candidacies_lost += 1;
                    warn!(
                        election = %self.shared.election_path,
                        candidacy = %candidacy,
                        "candidacy lost, queueing again"
                    );
                    self.relinquish(&candidacy).await;
                }
                Standing::Stopped => {
                    self.relinquish(&candidacy).await;
                    break;
                }
            }
        }

        self.set_state(ElectorState::Stopped);
        info!(
            election = %self.shared.election_path,
            participant = %self.shared.participant_id,
            terms = self.shared.terms_served.load(Ordering::Acquire),
            "election loop stopped"
        );
    }

    fn should_stop(&self) -> bool {
        *self.stop.borrow() || *self.shutdown.borrow()
    }

    /// Sleeps for `delay`; true when stopped meanwhile.
    async fn pause(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = shutdown_signalled(&mut self.stop) => true,
            _ = shutdown_signalled(&mut self.shutdown) => true,
            _ = tokio::time::sleep(delay) => false,
        }
    }

    fn set_state(&self, state: ElectorState) {
        let mut current = self.shared.state.write();
        if *current != state {
            debug!(
                election = %self.shared.election_path,
                from = %*current,
                to = %state,
                "elector state changed"
            );
            *current = state;
        }
    }

    fn protected_prefix(&self) -> String {
        format!("{CANDIDACY_PREFIX}{}", self.shared.participant_id)
    }

    /// Creates our candidacy, or adopts the one a half-applied create or a
    /// failed delete left behind under our participant prefix.
    async fn create_candidacy(&self) -> KeeperResult<String> {
        let service = self.connection.service();
        let election = self.shared.election_path.as_str();
        let prefix = self.protected_prefix();
        let requested = path::join(election, &format!("{prefix}{LOCK_SUFFIX}"));
        let requested = requested.as_str();
        let prefix = prefix.as_str();

        let candidacy = self
            .connection
            .with_retry("createCandidacy", move |session| async move {
                let children = service.get_children(session, election, None).await?;
                if let Some(existing) = children.iter().find(|c| c.starts_with(prefix)) {
                    debug!(election, candidacy = %existing, "adopting existing candidacy");
                    return Ok(path::join(election, existing));
                }
                service
                    .create(session, requested, Bytes::new(), CreateMode::EphemeralSequential)
                    .await
            })
            .await?;

        self.shared.stats.write().candidacies_created += 1;
        debug!(election, candidacy = %candidacy, "candidacy created");
        Ok(candidacy)
    }

    async fn await_leadership(&mut self, candidacy: &str) -> Standing {
        let own = path::node_name(candidacy).to_string();
        let mut transitions = self.connection.subscribe_state();

        loop {
            if self.should_stop() {
                return Standing::Stopped;
            }

            let siblings = match self.candidates().await {
                Ok(siblings) => siblings,
                Err(err) => {
                    warn!(candidacy, error = %err, "failed to list candidates");
                    return Standing::Lost;
                }
            };
            let mut queue: Vec<(u64, &String)> = siblings
                .iter()
                .filter_map(|name| path::sequence_of(name).map(|seq| (seq, name)))
                .collect();
            queue.sort();

            let position = match queue.iter().position(|(_, name)| **name == own) {
                Some(position) => position,
                None => return Standing::Lost,
            };
            if position == 0 {
                return Standing::Leader;
            }

            let predecessor = path::join(&self.shared.election_path, queue[position - 1].1);
            let (watcher, mut fired) = Watcher::channel();
            let service = self.connection.service();
            let watched = predecessor.as_str();
            let armed = self
                .connection
                .with_retry("exists", move |session| {
                    service.exists(session, watched, Some(watcher.clone()))
                })
                .await;
            match armed {
                Ok(Some(_)) => {
                    debug!(candidacy, predecessor = %predecessor, "waiting for predecessor");
                }
                Ok(None) => continue,
                Err(err) => {
                    error!(candidacy, error = %err, "failed to watch predecessor");
                    return Standing::Lost;
                }
            }

            loop {
                tokio::select! {
                    _ = shutdown_signalled(&mut self.stop) => return Standing::Stopped,
                    _ = shutdown_signalled(&mut self.shutdown) => return Standing::Stopped,
                    _ = fired.recv() => break,
                    transition = transitions.recv() => match transition {
                        Ok(ConnectionState::Lost) => return Standing::Lost,
                        Ok(ConnectionState::Reconnected) | Err(RecvError::Lagged(_)) => break,
                        Ok(_) => {}
                        Err(RecvError::Closed) => return Standing::Stopped,
                    },
                }
            }
        }
    }

    async fn candidates(&self) -> KeeperResult<Vec<String>> {
        let service = self.connection.service();
        let election = self.shared.election_path.as_str();
        self.connection
            .with_retry("getChildren", move |session| {
                service.get_children(session, election, None)
            })
            .await
    }

    async fn lead(&self, candidacy: &str) {
        let term = self.shared.terms_served.load(Ordering::Acquire) + 1;
        self.set_state(ElectorState::Leader {
            term,
            since: now_millis(),
        });
        info!(
            election = %self.shared.election_path,
            candidacy,
            term,
            "elected leader"
        );

        let (revoke_tx, revoked) = watch::channel(false);
        let revocation = revoked.clone();
        let monitor = tokio::spawn(monitor_leadership(
            self.connection.clone(),
            candidacy.to_string(),
            revoke_tx,
            self.connection.subscribe_state(),
            self.stop.clone(),
            self.shutdown.clone(),
        ));

        let context = LeadershipContext {
            election_path: self.shared.election_path.clone(),
            candidacy_path: candidacy.to_string(),
            participant_id: self.shared.participant_id,
            term,
            revoked,
            store: self.store.clone(),
        };
        let task = self.task.clone();
        let args = self.args.clone();
        let outcome = tokio::spawn(async move { task.execute(context, args).await }).await;

        monitor.abort();
        let revoked = *revocation.borrow();
        {
            let mut stats = self.shared.stats.write();
            stats.terms_served += 1;
            if revoked {
                stats.revocations += 1;
            }
            if outcome.is_err() {
                stats.task_panics += 1;
            }
        }
        if let Err(err) = outcome {
            error!(
                election = %self.shared.election_path,
                term,
                error = %err,
                "leadership task failed"
            );
        }

        self.shared.terms_served.store(term, Ordering::Release);
        info!(election = %self.shared.election_path, term, "leadership term finished");
    }

    /// Deletes our candidacy. A missing node is fine: the session that owned
    /// it may be gone.
    async fn relinquish(&self, candidacy: &str) {
        self.set_state(ElectorState::Candidate);
        let service = self.connection.service();
        match self
            .connection
            .with_retry("deleteCandidacy", move |session| {
                service.delete(session, candidacy, None)
            })
            .await
        {
            Ok(()) => debug!(candidacy, "candidacy deleted"),
            Err(err) if err.is_no_node() => {}
            Err(KeeperError::Closed) => {}
            Err(err) => warn!(candidacy, error = %err, "failed to delete candidacy"),
        }
    }
}

/// Flips the revoked flag when leadership can no longer be relied upon.
/// Finishes as soon as it has revoked.
async fn monitor_leadership(
    connection: Arc<ConnectionManager>,
    candidacy: String,
    revoke: watch::Sender<bool>,
    mut transitions: broadcast::Receiver<ConnectionState>,
    mut stop: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let reason = loop {
        if !connection.state().is_connected() {
            break "connection not available";
        }

        let (watcher, mut fired) = Watcher::channel();
        let service = connection.service();
        let watched = candidacy.as_str();
        match connection
            .with_retry("exists", move |session| {
                service.exists(session, watched, Some(watcher.clone()))
            })
            .await
        {
            Ok(Some(_)) => {}
            Ok(None) => break "candidacy node disappeared",
            Err(_) => break "cannot verify candidacy",
        }

        let rearm = loop {
            tokio::select! {
                _ = shutdown_signalled(&mut stop) => break Err("elector stopped"),
                _ = shutdown_signalled(&mut shutdown) => break Err("client stopped"),
                event = fired.recv() => break Ok(event),
                transition = transitions.recv() => match transition {
                    Ok(ConnectionState::Suspended) => break Err("connection suspended"),
                    Ok(ConnectionState::Lost) => break Err("session lost"),
                    Ok(_) => {}
                    Err(RecvError::Lagged(_)) => {
                        if !connection.state().is_connected() {
                            break Err("connection not available");
                        }
                    }
                    Err(RecvError::Closed) => break Err("client stopped"),
                },
            }
        };
        match rearm {
            // data change on our own node; watch again
            Ok(Some(event)) if event.kind != EventKind::NodeDeleted => continue,
            Ok(_) => break "candidacy node disappeared",
            Err(reason) => break reason,
        }
    };

    warn!(candidacy = %candidacy, reason, "leadership revoked");
    revoke.send_replace(true);
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
