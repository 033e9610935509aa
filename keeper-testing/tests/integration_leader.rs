//! Leader election integration tests

use async_trait::async_trait;
use keeper_client::{
    ElectorState, KeeperClient, LeaderElector, LeadershipContext, LeadershipTask,
};
use keeper_testing::{wait_for, TestCluster, WAIT};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Tracks how many terms are running at once.
#[derive(Default)]
struct ExclusiveTask {
    active: AtomicUsize,
    max_active: AtomicUsize,
    terms: AtomicUsize,
    leaders: Mutex<Vec<Uuid>>,
}

#[async_trait]
impl LeadershipTask for ExclusiveTask {
    async fn execute(&self, context: LeadershipContext, _args: Arc<()>) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        self.leaders.lock().push(context.participant_id());
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.terms.fetch_add(1, Ordering::SeqCst);
    }
}

/// Holds leadership until it is revoked.
#[derive(Default)]
struct HoldingTask {
    leaders: Mutex<Vec<Uuid>>,
}

#[async_trait]
impl LeadershipTask for HoldingTask {
    async fn execute(&self, context: LeadershipContext, _args: Arc<()>) {
        self.leaders.lock().push(context.participant_id());
        context.revoked().await;
    }
}

/// Panics in every term.
#[derive(Default)]
struct PanickingTask {
    runs: AtomicUsize,
}

#[async_trait]
impl LeadershipTask for PanickingTask {
    async fn execute(&self, _context: LeadershipContext, _args: Arc<()>) {
        self.runs.fetch_add(1, Ordering::SeqCst);
        panic!("leadership task failed");
    }
}

/// Waits until `path` holds exactly `count` candidacies.
async fn wait_for_candidacies(
    client: &KeeperClient,
    path: &str,
    count: usize,
) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if client.get_children(path).await.len() == count {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("timed out waiting for {count} candidacies under {path}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_one_leader_at_a_time() -> anyhow::Result<()> {
    let cluster = TestCluster::new();
    let setup = cluster.client().await?;
    setup.set("/election/workers", "workers").await.unwrap();

    let task = Arc::new(ExclusiveTask::default());
    let mut electors = Vec::new();
    for _ in 0..5 {
        let client = cluster.client().await?;
        let shared: Arc<dyn LeadershipTask> = task.clone();
        let elector = client
            .take_leader_and_exec_task("/election/workers", shared, ())
            .await
            .expect("election path exists");
        electors.push(elector);
    }

    wait_for(Duration::from_secs(10), "ten terms", || {
        task.terms.load(Ordering::SeqCst) >= 10
    })
    .await?;
    for elector in &electors {
        elector.stop();
    }
    for elector in &electors {
        elector.join().await;
    }

    assert_eq!(task.max_active.load(Ordering::SeqCst), 1);
    let leaders = task.leaders.lock().clone();
    let participants: Vec<Uuid> = electors.iter().map(LeaderElector::participant_id).collect();
    assert!(leaders.iter().all(|id| participants.contains(id)));
    // every participant requeues, so leadership rotates
    assert!(leaders.windows(2).any(|pair| pair[0] != pair[1]));

    assert!(setup.get_children("/election/workers").await.is_empty());

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_leadership_moves_when_leader_session_expires() -> anyhow::Result<()> {
    let cluster = TestCluster::new();
    let first = cluster.client().await?;
    let second = cluster.client().await?;
    first.set("/election/scheduler", "s").await.unwrap();

    let task = Arc::new(HoldingTask::default());
    let shared: Arc<dyn LeadershipTask> = task.clone();
    let first_elector = first
        .take_leader_and_exec_task("/election/scheduler", shared.clone(), ())
        .await
        .expect("election path exists");
    wait_for(WAIT, "first leader", || first_elector.is_leader()).await?;

    let second_elector = second
        .take_leader_and_exec_task("/election/scheduler", shared, ())
        .await
        .expect("election path exists");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!second_elector.is_leader());

    cluster
        .service()
        .expire_session(TestCluster::session_of(&first)?);
    wait_for(WAIT, "second leader", || second_elector.is_leader()).await?;
    wait_for(WAIT, "first leader revoked", || {
        !first_elector.is_leader() && first_elector.get_stats().revocations == 1
    })
    .await?;
    assert_eq!(
        task.leaders.lock().clone(),
        vec![first_elector.participant_id(), second_elector.participant_id()]
    );

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_stopping_the_leader_hands_over() -> anyhow::Result<()> {
    let cluster = TestCluster::new();
    let first = cluster.client().await?;
    let second = cluster.client().await?;
    first.set("/election/indexer", "i").await.unwrap();

    let task: Arc<dyn LeadershipTask> = Arc::new(HoldingTask::default());
    let first_elector = first
        .take_leader_and_exec_task("/election/indexer", task.clone(), ())
        .await
        .expect("election path exists");
    wait_for(WAIT, "first leader", || first_elector.is_leader()).await?;
    let second_elector = second
        .take_leader_and_exec_task("/election/indexer", task, ())
        .await
        .expect("election path exists");

    first_elector.stop();
    first_elector.join().await;
    wait_for(WAIT, "second leader", || second_elector.is_leader()).await?;
    assert_eq!(first_elector.state(), ElectorState::Stopped);
    assert_eq!(first_elector.terms_served(), 1);

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_expired_leader_hands_over_to_next_lowest() -> anyhow::Result<()> {
    let cluster = TestCluster::new();
    let observer = cluster.client().await?;
    observer.set("/election/shards", "s").await.unwrap();

    let task = Arc::new(HoldingTask::default());
    let mut clients = Vec::new();
    let mut electors = Vec::new();
    for joined in 1..=3 {
        let client = cluster.client().await?;
        let shared: Arc<dyn LeadershipTask> = task.clone();
        let elector = client
            .take_leader_and_exec_task("/election/shards", shared, ())
            .await
            .expect("election path exists");
        // join strictly one after another so sequence order is known
        wait_for_candidacies(&observer, "/election/shards", joined).await?;
        clients.push(client);
        electors.push(elector);
    }
    wait_for(WAIT, "first leader", || electors[0].is_leader()).await?;

    cluster
        .service()
        .expire_session(TestCluster::session_of(&clients[0])?);
    wait_for(WAIT, "second candidate leads", || electors[1].is_leader()).await?;
    // the expired participant queues again behind the others
    wait_for_candidacies(&observer, "/election/shards", 3).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!electors[0].is_leader());
    assert!(!electors[2].is_leader());
    assert_eq!(
        task.leaders.lock().clone(),
        vec![electors[0].participant_id(), electors[1].participant_id()]
    );

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_panicking_task_relinquishes_and_requeues() -> anyhow::Result<()> {
    let cluster = TestCluster::new();
    let client = cluster.client().await?;
    client.set("/election/flaky", "f").await.unwrap();

    let task = Arc::new(PanickingTask::default());
    let shared: Arc<dyn LeadershipTask> = task.clone();
    let elector = client
        .take_leader_and_exec_task("/election/flaky", shared, ())
        .await
        .expect("election path exists");

    wait_for(WAIT, "repeated terms", || elector.get_stats().task_panics >= 3).await?;
    elector.stop();
    elector.join().await;

    let stats = elector.get_stats();
    assert_eq!(stats.terms_served, stats.task_panics);
    assert_eq!(stats.task_panics, task.runs.load(Ordering::SeqCst) as u64);
    assert_eq!(elector.state(), ElectorState::Stopped);
    assert!(client.get_children("/election/flaky").await.is_empty());

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_foreign_children_do_not_block_election() -> anyhow::Result<()> {
    let cluster = TestCluster::new();
    let client = cluster.client().await?;
    client.set("/election/regional", "r").await.unwrap();
    client.set("/election/regional/éééééx", "foreign").await.unwrap();
    client.set("/election/regional/notes", "foreign").await.unwrap();

    let task = Arc::new(ExclusiveTask::default());
    let shared: Arc<dyn LeadershipTask> = task.clone();
    let elector = client
        .take_leader_and_exec_task("/election/regional", shared, ())
        .await
        .expect("election path exists");

    wait_for(WAIT, "terms despite foreign children", || {
        task.terms.load(Ordering::SeqCst) >= 2
    })
    .await?;
    elector.stop();
    elector.join().await;

    assert!(elector.terms_served() >= 2);
    assert_eq!(
        client.get_children("/election/regional").await,
        vec!["notes".to_string(), "éééééx".to_string()]
    );

    cluster.shutdown().await;
    Ok(())
}
