//! WorkerSupervisor
//!
//! Owns one named background task per ID. Every task gets its own
//! cancellation token; `stop` cancels it and waits up to the grace period
//! before aborting. A worker that returns an error is restarted under the
//! pool's `RestartPolicy` until the policy is exhausted.

use crate::error::SupervisorError;
use crate::observability::{events, metrics, RestartPolicy, RestartTracker};
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A unit of background work run under a supervisor.
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    type Param: Clone + Send + Sync + 'static;

    /// Run until `cancel` fires (returning `Ok`) or the work fails.
    async fn run(&self, id: &str, param: Self::Param, cancel: CancellationToken) -> anyhow::Result<()>;
}

struct WorkerHandle {
    generation: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

type HandleMap = Arc<Mutex<HashMap<String, WorkerHandle>>>;

pub struct WorkerSupervisor<W: Worker> {
    pool: &'static str,
    worker: Arc<W>,
    policy: RestartPolicy,
    grace: Duration,
    workers: HandleMap,
    generation: AtomicU64,
    shutting_down: AtomicBool,
}

impl<W: Worker> WorkerSupervisor<W> {
    pub fn new(pool: &'static str, worker: W, policy: RestartPolicy, grace: Duration) -> Self {
        Self {
            pool,
            worker: Arc::new(worker),
            policy,
            grace,
            workers: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Start a worker under `id`.
    pub async fn start(&self, id: &str, param: W::Param) -> Result<(), SupervisorError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(SupervisorError::ShuttingDown);
        }

        let mut workers = self.workers.lock().await;
        if workers.get(id).is_some_and(|h| !h.task.is_finished()) {
            return Err(SupervisorError::AlreadyRunning(id.to_string()));
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(supervise(
            self.pool,
            id.to_string(),
            generation,
            param,
            self.worker.clone(),
            self.policy.clone(),
            cancel.clone(),
            self.workers.clone(),
        ));
        workers.insert(
            id.to_string(),
            WorkerHandle {
                generation,
                cancel,
                task,
            },
        );
        metrics::set_workers(self.pool, workers.len());
        events::worker_started(id, self.pool);
        Ok(())
    }

    /// Cancel a worker and wait for it to exit. Returns `false` when no
    /// worker with that ID exists.
    pub async fn stop(&self, id: &str) -> bool {
        let handle = {
            let mut workers = self.workers.lock().await;
            let handle = workers.remove(id);
            metrics::set_workers(self.pool, workers.len());
            handle
        };
        match handle {
            Some(handle) => {
                self.shut_down(id, handle).await;
                true
            }
            None => false,
        }
    }

    /// Stop, then start again with a fresh restart budget.
    pub async fn restart(&self, id: &str, param: W::Param) -> Result<(), SupervisorError> {
        self.stop(id).await;
        self.start(id, param).await
    }

    /// IDs of live workers, sorted.
    pub async fn list(&self) -> Vec<String> {
        let workers = self.workers.lock().await;
        let mut ids: Vec<String> = workers
            .iter()
            .filter(|(_, h)| !h.task.is_finished())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub async fn is_running(&self, id: &str) -> bool {
        self.workers
            .lock()
            .await
            .get(id)
            .is_some_and(|h| !h.task.is_finished())
    }

    /// Stop every worker and refuse new ones.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let handles: Vec<(String, WorkerHandle)> = {
            let mut workers = self.workers.lock().await;
            let drained = workers.drain().collect();
            metrics::set_workers(self.pool, 0);
            drained
        };
        join_all(
            handles
                .into_iter()
                .map(|(id, handle)| async move { self.shut_down(&id, handle).await }),
        )
        .await;
    }

    async fn shut_down(&self, id: &str, handle: WorkerHandle) {
        handle.cancel.cancel();
        let mut task = handle.task;
        let reason = match tokio::time::timeout(self.grace, &mut task).await {
            Ok(_) => "stopped",
            Err(_) => {
                task.abort();
                "aborted"
            }
        };
        events::worker_stopped(id, self.pool, reason);
    }
}

/// Task body: run the worker, restarting it on failure.
#[allow(clippy::too_many_arguments)]
async fn supervise<W: Worker>(
    pool: &'static str,
    id: String,
    generation: u64,
    param: W::Param,
    worker: Arc<W>,
    policy: RestartPolicy,
    cancel: CancellationToken,
    workers: HandleMap,
) {
    let mut tracker = RestartTracker::new(policy);
    loop {
        let started = Instant::now();
        let result = worker.run(&id, param.clone(), cancel.clone()).await;
        if cancel.is_cancelled() {
            return;
        }
        let error = match result {
            Ok(()) => break,
            Err(e) => format!("{e:#}"),
        };

        match tracker.record_failure(started.elapsed()) {
            Some(delay) => {
                let backoff_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                events::worker_restarting(&id, &error, backoff_ms);
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            None => {
                events::worker_exhausted(&id, &error, tracker.restart_count());
                break;
            }
        }
    }

    // Finished on its own: drop the handle unless a newer worker replaced it.
    let mut map = workers.lock().await;
    if map.get(&id).is_some_and(|h| h.generation == generation) {
        map.remove(&id);
        events::worker_stopped(&id, pool, "finished");
    }
    metrics::set_workers(pool, map.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Fails `failures` times, then blocks until cancelled.
    struct Flaky {
        runs: Arc<AtomicUsize>,
        failures: usize,
    }

    #[async_trait]
    impl Worker for Flaky {
        type Param = ();

        async fn run(&self, _id: &str, _param: (), cancel: CancellationToken) -> anyhow::Result<()> {
            let run = self.runs.fetch_add(1, Ordering::SeqCst);
            if run < self.failures {
                anyhow::bail!("run {run} failed");
            }
            cancel.cancelled().await;
            Ok(())
        }
    }

    /// Ignores cancellation entirely.
    struct Stubborn;

    #[async_trait]
    impl Worker for Stubborn {
        type Param = ();

        async fn run(&self, _id: &str, _param: (), _cancel: CancellationToken) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    /// Completes immediately.
    struct Once {
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Worker for Once {
        type Param = u32;

        async fn run(&self, _id: &str, _param: u32, _cancel: CancellationToken) -> anyhow::Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn fast_policy(max_restarts: u32) -> RestartPolicy {
        RestartPolicy::new(
            max_restarts,
            Duration::from_secs(60),
            Duration::from_millis(1),
            Duration::from_millis(5),
        )
    }

    fn flaky(failures: usize) -> (Flaky, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        (
            Flaky {
                runs: runs.clone(),
                failures,
            },
            runs,
        )
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_start_stop_list() {
        let (worker, runs) = flaky(0);
        let supervisor = WorkerSupervisor::new("events", worker, fast_policy(3), Duration::from_secs(1));

        supervisor.start("BCS-K8S-40002", ()).await.unwrap();
        supervisor.start("BCS-K8S-40001", ()).await.unwrap();
        assert_eq!(
            supervisor.start("BCS-K8S-40001", ()).await,
            Err(SupervisorError::AlreadyRunning("BCS-K8S-40001".into()))
        );
        assert_eq!(supervisor.list().await, vec!["BCS-K8S-40001", "BCS-K8S-40002"]);

        assert!(supervisor.stop("BCS-K8S-40001").await);
        assert!(!supervisor.stop("BCS-K8S-40001").await);
        assert!(!supervisor.is_running("BCS-K8S-40001").await);
        assert_eq!(supervisor.list().await, vec!["BCS-K8S-40002"]);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_worker_is_restarted() {
        let (worker, runs) = flaky(2);
        let supervisor = WorkerSupervisor::new("events", worker, fast_policy(3), Duration::from_secs(1));

        supervisor.start("c1", ()).await.unwrap();
        wait_until(|| runs.load(Ordering::SeqCst) == 3).await;
        assert!(supervisor.is_running("c1").await);
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_exhausted_worker_leaves_the_list() {
        let (worker, runs) = flaky(usize::MAX);
        let supervisor = WorkerSupervisor::new("events", worker, fast_policy(2), Duration::from_secs(1));

        supervisor.start("c1", ()).await.unwrap();
        wait_until(|| runs.load(Ordering::SeqCst) == 3).await;
        tokio::time::timeout(Duration::from_secs(2), async {
            while supervisor.is_running("c1").await {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();
        assert!(supervisor.list().await.is_empty());

        // A later tick may start it again.
        supervisor.start("c1", ()).await.unwrap();
        wait_until(|| runs.load(Ordering::SeqCst) > 3).await;
    }

    #[tokio::test]
    async fn test_restart_runs_again() {
        let (worker, runs) = flaky(0);
        let supervisor = WorkerSupervisor::new("events", worker, fast_policy(3), Duration::from_secs(1));

        supervisor.start("c1", ()).await.unwrap();
        wait_until(|| runs.load(Ordering::SeqCst) == 1).await;
        supervisor.restart("c1", ()).await.unwrap();
        wait_until(|| runs.load(Ordering::SeqCst) == 2).await;
        assert_eq!(supervisor.list().await, vec!["c1"]);
    }

    #[tokio::test]
    async fn test_stop_aborts_after_grace() {
        let supervisor = WorkerSupervisor::new("events", Stubborn, fast_policy(0), Duration::from_millis(20));
        supervisor.start("c1", ()).await.unwrap();

        let stopped = tokio::time::timeout(Duration::from_secs(1), supervisor.stop("c1")).await;
        assert_eq!(stopped.ok(), Some(true));
        assert!(supervisor.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_one_shot_worker_can_start_again_after_finishing() {
        let runs = Arc::new(AtomicUsize::new(0));
        let supervisor = WorkerSupervisor::new(
            "full-sync",
            Once { runs: runs.clone() },
            RestartPolicy::never(),
            Duration::from_secs(1),
        );

        supervisor.start("full-sync/c1", 1).await.unwrap();
        wait_until(|| runs.load(Ordering::SeqCst) == 1).await;
        tokio::time::timeout(Duration::from_secs(1), async {
            while supervisor.is_running("full-sync/c1").await {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();

        supervisor.start("full-sync/c1", 2).await.unwrap();
        wait_until(|| runs.load(Ordering::SeqCst) == 2).await;
    }

    #[tokio::test]
    async fn test_no_starts_after_shutdown() {
        let (worker, _runs) = flaky(0);
        let supervisor = WorkerSupervisor::new("events", worker, fast_policy(3), Duration::from_secs(1));
        supervisor.start("c1", ()).await.unwrap();

        supervisor.shutdown().await;
        assert!(supervisor.list().await.is_empty());
        assert_eq!(supervisor.start("c2", ()).await, Err(SupervisorError::ShuttingDown));
    }
}
