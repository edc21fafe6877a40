//! End-to-end orchestration tests against the in-memory store and queue
//!
//! Run with: cargo test -p procflow-durable --test orchestration_test

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::json;

use procflow_durable::engine::{
    DropReason, ExecutionOutcome, ExecutorError, GraphRegistry, JoinOutcome, ProcessGraph,
    StartOutcome, StepError, StepExecutor, StepRegistry, StepTransition,
};
use procflow_durable::persistence::{
    InMemoryProcessStore, JobStatus, NewScheduledJob, ProcessStatus, ProcessStore, StepStatus,
};
use procflow_durable::queue::{InMemoryTaskQueue, StepTask};
use procflow_durable::worker::{JobPoller, JobPollerConfig};

type Calls = Arc<Mutex<HashMap<String, u32>>>;

fn order_graph() -> ProcessGraph {
    ProcessGraph::builder("order")
        .then("prepare", "dispatch")
        .fan_out("dispatch", "calls", ["call_a", "call_b", "call_c"])
        .join("calls", "finalize")
        .complete("finalize")
        .build()
        .unwrap()
}

struct Setup {
    store: InMemoryProcessStore,
    queue: Arc<InMemoryTaskQueue>,
    executor: Arc<StepExecutor>,
    calls: Calls,
}

impl Setup {
    fn calls(&self, step_name: &str) -> u32 {
        self.calls
            .lock()
            .unwrap()
            .get(step_name)
            .copied()
            .unwrap_or(0)
    }

    /// Execute pending tasks until the queue is empty
    async fn run_to_quiescence(&self) -> Vec<Result<ExecutionOutcome, ExecutorError>> {
        let mut results = Vec::new();
        loop {
            let tasks = self.queue.drain_pending();
            if tasks.is_empty() {
                break;
            }
            for task in tasks {
                results.push(self.executor.execute(&task).await);
            }
        }
        results
    }

    async fn start(&self, business_key: &str) -> i64 {
        self.executor
            .orchestrator()
            .start_process("order", Some(business_key), json!({"amount": 10}), None)
            .await
            .unwrap()
            .process_id()
    }
}

/// Order process with counting handlers; `failures` maps step names to error messages
fn setup(failures: &[(&str, String)], skip_handlers: &[&str]) -> Setup {
    let store = InMemoryProcessStore::new();
    let queue = Arc::new(InMemoryTaskQueue::new());
    let calls: Calls = Arc::default();
    let graph = order_graph();

    let mut steps = StepRegistry::new();
    for name in graph.step_names() {
        if skip_handlers.contains(&name) {
            continue;
        }
        let failure = failures
            .iter()
            .find(|(step, _)| *step == name)
            .map(|(_, message)| message.clone());
        let calls = calls.clone();
        steps.register_fn(name, move |ctx| {
            let calls = calls.clone();
            let failure = failure.clone();
            async move {
                *calls.lock().unwrap().entry(ctx.step_name.clone()).or_default() += 1;
                tokio::task::yield_now().await;
                match failure {
                    Some(message) => Err(StepError::permanent(message)),
                    None => Ok(()),
                }
            }
        });
    }

    let mut graphs = GraphRegistry::new();
    graphs.register(graph);

    let executor = Arc::new(StepExecutor::new(
        Arc::new(store.clone()),
        queue.clone(),
        steps,
        graphs,
    ));

    Setup {
        store,
        queue,
        executor,
        calls,
    }
}

// ============================================
// Full Process Runs
// ============================================

#[test_log::test(tokio::test)]
async fn test_order_process_runs_to_completion() {
    let s = setup(&[], &[]);
    let pid = s.start("ORD-1").await;

    let results = s.run_to_quiescence().await;
    assert!(results.iter().all(|r| r.is_ok()));

    let instance = s.store.get_instance(pid).await.unwrap().unwrap();
    assert_eq!(instance.status, ProcessStatus::Completed);
    assert!(instance.finished_at.is_some());

    let steps = s.store.list_steps(pid).await.unwrap();
    assert_eq!(steps.len(), 6);
    assert!(steps.iter().all(|step| step.status == StepStatus::Done));

    for name in ["prepare", "dispatch", "call_a", "call_b", "call_c", "finalize"] {
        assert_eq!(s.calls(name), 1, "{name} should run exactly once");
    }
    assert_eq!(s.queue.dispatch_count(pid, "finalize"), 1);
}

#[tokio::test]
async fn test_redelivered_tasks_do_not_rerun_handlers() {
    let s = setup(&[], &[]);
    let pid = s.start("ORD-1").await;
    s.run_to_quiescence().await;

    for task in s.queue.dispatched() {
        let outcome = s.executor.execute(&task).await.unwrap();
        assert_eq!(
            outcome,
            ExecutionOutcome::Dropped(DropReason::AlreadyTerminal(StepStatus::Done))
        );
    }

    for name in ["prepare", "dispatch", "call_a", "call_b", "call_c", "finalize"] {
        assert_eq!(s.calls(name), 1);
    }
    let instance = s.store.get_instance(pid).await.unwrap().unwrap();
    assert_eq!(instance.status, ProcessStatus::Completed);
}

#[tokio::test]
async fn test_restart_with_same_business_key_is_noop() {
    let s = setup(&[], &[]);
    let pid = s.start("ORD-1").await;
    s.run_to_quiescence().await;

    let outcome = s
        .executor
        .orchestrator()
        .start_process("order", Some("ORD-1"), json!({"amount": 99}), None)
        .await
        .unwrap();

    assert_eq!(outcome, StartOutcome::Existing(pid));
    assert_eq!(s.queue.dispatch_count(pid, "prepare"), 1);
    assert_eq!(s.store.instance_count().await, 1);
}

#[tokio::test]
async fn test_restart_recovers_lost_initial_dispatch() {
    let s = setup(&[], &[]);
    let pid = s.start("ORD-1").await;

    // The task never reaches a worker, as if the starter crashed after commit
    assert_eq!(s.queue.drain_pending().len(), 1);
    assert!(s.run_to_quiescence().await.is_empty());
    let instance = s.store.get_instance(pid).await.unwrap().unwrap();
    assert_eq!(instance.status, ProcessStatus::Running);

    let outcome = s
        .executor
        .orchestrator()
        .start_process("order", Some("ORD-1"), json!({"amount": 10}), None)
        .await
        .unwrap();
    assert_eq!(outcome, StartOutcome::Existing(pid));

    s.run_to_quiescence().await;
    assert_eq!(s.calls("prepare"), 1);
    let instance = s.store.get_instance(pid).await.unwrap().unwrap();
    assert_eq!(instance.status, ProcessStatus::Completed);
}

// ============================================
// Concurrency
// ============================================

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_concurrent_starts_converge_on_one_instance() {
    let s = setup(&[], &[]);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let executor = s.executor.clone();
            tokio::spawn(async move {
                executor
                    .orchestrator()
                    .start_process("order", Some("ORD-1"), json!({"amount": 10}), None)
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.unwrap());
    }

    let created: Vec<_> = outcomes.iter().filter(|o| o.is_created()).collect();
    assert_eq!(created.len(), 1);

    let pid = created[0].process_id();
    assert!(outcomes.iter().all(|o| o.process_id() == pid));
    assert_eq!(s.store.instance_count().await, 1);
    assert!(s.queue.dispatch_count(pid, "prepare") >= 1);

    // Re-sent initial tasks are absorbed by the claim
    s.run_to_quiescence().await;
    assert_eq!(s.calls("prepare"), 1);
    let instance = s.store.get_instance(pid).await.unwrap().unwrap();
    assert_eq!(instance.status, ProcessStatus::Completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_branches_release_join_once() {
    let s = setup(&[], &[]);

    for i in 0..20 {
        let pid = s.start(&format!("ORD-{i}")).await;

        for step in ["prepare", "dispatch"] {
            s.queue.drain_pending();
            s.executor.execute(&StepTask::new(pid, step)).await.unwrap();
        }

        let branches = s.queue.drain_pending();
        assert_eq!(branches.len(), 3);

        let handles: Vec<_> = branches
            .into_iter()
            .map(|task| {
                let executor = s.executor.clone();
                tokio::spawn(async move { executor.execute(&task).await })
            })
            .collect();
        for handle in handles {
            let outcome = handle.await.unwrap().unwrap();
            assert!(matches!(outcome, ExecutionOutcome::Completed { .. }));
        }

        assert_eq!(s.queue.dispatch_count(pid, "finalize"), 1);
        let finalize = s.store.get_step(pid, "finalize").await.unwrap().unwrap();
        assert_eq!(finalize.status, StepStatus::Pending);
        s.queue.drain_pending();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_try_join_dispatches_once() {
    let s = setup(&[], &[]);
    let pid = s.start("ORD-1").await;
    let executor = s.executor.clone();

    executor
        .orchestrator()
        .fan_out(pid, "calls", &["call_a", "call_b", "call_c"])
        .await
        .unwrap();
    for step in ["call_a", "call_b", "call_c"] {
        executor
            .orchestrator()
            .mark_step_done(pid, step)
            .await
            .unwrap();
    }

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let executor = s.executor.clone();
            tokio::spawn(async move {
                executor
                    .orchestrator()
                    .try_join(pid, "calls", "finalize")
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut released = 0;
    for handle in handles {
        match handle.await.unwrap() {
            JoinOutcome::Released => released += 1,
            JoinOutcome::AlreadyReleased => {}
            other => panic!("unexpected join outcome: {other:?}"),
        }
    }

    assert_eq!(released, 1);
    assert_eq!(s.queue.dispatch_count(pid, "finalize"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_done_and_failed_race_never_overrides_done() {
    let s = setup(&[], &[]);

    for i in 0..20 {
        let pid = s.start(&format!("ORD-{i}")).await;
        let done = {
            let executor = s.executor.clone();
            tokio::spawn(async move {
                executor.orchestrator().mark_step_done(pid, "prepare").await
            })
        };
        let failed = {
            let executor = s.executor.clone();
            tokio::spawn(async move {
                executor
                    .orchestrator()
                    .mark_step_failed(pid, "prepare", "late failure")
                    .await
            })
        };

        let done = done.await.unwrap().unwrap();
        let failed = failed.await.unwrap().unwrap();

        let step = s.store.get_step(pid, "prepare").await.unwrap().unwrap();
        let instance = s.store.get_instance(pid).await.unwrap().unwrap();
        match step.status {
            StepStatus::Done => {
                assert_eq!(done, StepTransition::Applied);
                assert_eq!(failed, StepTransition::AlreadyDone);
                assert!(step.last_error.is_none());
                assert_eq!(instance.status, ProcessStatus::Running);
            }
            StepStatus::Failed => {
                assert_eq!(failed, StepTransition::Applied);
                assert_eq!(done, StepTransition::AlreadyFailed);
                assert_eq!(instance.status, ProcessStatus::Failed);
            }
            other => panic!("unexpected step status {other}"),
        }
    }
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_concurrent_job_pollers_claim_each_job_once() {
    let s = setup(&[], &[]);
    for i in 0..20 {
        s.store
            .schedule_job(NewScheduledJob::now(
                "order",
                Some(format!("JOB-{i}")),
                json!({"n": i}),
            ))
            .await
            .unwrap();
    }

    let pollers: Vec<_> = (0..2)
        .map(|_| {
            Arc::new(JobPoller::new(
                Arc::new(s.store.clone()),
                s.queue.clone(),
                JobPollerConfig::default().with_batch_size(3),
            ))
        })
        .collect();

    let handles: Vec<_> = pollers
        .iter()
        .map(|poller| {
            let poller = poller.clone();
            tokio::spawn(async move {
                let mut claimed = 0;
                loop {
                    let report = poller.poll_once(Utc::now()).await.unwrap();
                    assert_eq!(report.failed, 0);
                    if report.claimed == 0 {
                        break claimed;
                    }
                    claimed += report.claimed;
                }
            })
        })
        .collect();

    let mut total = 0;
    for handle in handles {
        total += handle.await.unwrap();
    }

    assert_eq!(total, 20);
    assert_eq!(s.store.instance_count().await, 20);
    assert_eq!(s.queue.dispatched().len(), 20);
    for job_id in 1..=20 {
        let job = s.store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Done);
    }
}

// ============================================
// Failure Paths
// ============================================

#[tokio::test]
async fn test_branch_failure_fails_process_and_blocks_join() {
    let long_error = "x".repeat(5000);
    let s = setup(&[("call_b", long_error)], &[]);
    let pid = s.start("ORD-1").await;

    let results = s.run_to_quiescence().await;
    let failures: Vec<_> = results.iter().filter(|r| r.is_err()).collect();
    assert_eq!(failures.len(), 1);
    assert!(matches!(
        failures[0],
        Err(ExecutorError::BusinessLogic { step_name, .. }) if step_name == "call_b"
    ));

    let call_b = s.store.get_step(pid, "call_b").await.unwrap().unwrap();
    assert_eq!(call_b.status, StepStatus::Failed);
    assert_eq!(call_b.last_error.as_ref().map(|e| e.chars().count()), Some(4000));

    let instance = s.store.get_instance(pid).await.unwrap().unwrap();
    assert_eq!(instance.status, ProcessStatus::Failed);
    assert!(s.store.get_step(pid, "finalize").await.unwrap().is_none());
    assert_eq!(s.calls("finalize"), 0);
}

#[tokio::test]
async fn test_missing_handler_leaves_step_pending() {
    let s = setup(&[], &["finalize"]);
    let pid = s.start("ORD-1").await;

    let results = s.run_to_quiescence().await;
    let err = results
        .into_iter()
        .find_map(Result::err)
        .expect("finalize should fail to claim");
    assert!(matches!(err, ExecutorError::UnknownStep(ref name) if name == "finalize"));

    let finalize = s.store.get_step(pid, "finalize").await.unwrap().unwrap();
    assert_eq!(finalize.status, StepStatus::Pending);
    assert_eq!(finalize.attempt, 0);

    let instance = s.store.get_instance(pid).await.unwrap().unwrap();
    assert_eq!(instance.status, ProcessStatus::Running);
}

#[tokio::test]
async fn test_partial_join_then_last_branch_releases() {
    let s = setup(&[], &[]);
    let pid = s.start("ORD-1").await;
    let orchestrator = s.executor.orchestrator();

    orchestrator
        .fan_out(pid, "calls", &["call_a", "call_b", "call_c"])
        .await
        .unwrap();
    orchestrator.mark_step_done(pid, "call_a").await.unwrap();
    orchestrator.mark_step_done(pid, "call_b").await.unwrap();

    assert_eq!(
        orchestrator.try_join(pid, "calls", "finalize").await.unwrap(),
        JoinOutcome::Pending { done: 2, total: 3 }
    );
    assert!(s.store.get_step(pid, "finalize").await.unwrap().is_none());

    orchestrator.mark_step_done(pid, "call_c").await.unwrap();
    assert_eq!(
        orchestrator.try_join(pid, "calls", "finalize").await.unwrap(),
        JoinOutcome::Released
    );
    assert_eq!(s.queue.dispatch_count(pid, "finalize"), 1);
}
