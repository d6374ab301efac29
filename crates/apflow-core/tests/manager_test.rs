//! Integration tests for the per-tree scheduling loop.

mod common;

use std::sync::{Arc, Mutex};

use serde_json::json;
use tokio_util::sync::CancellationToken;

use apflow_core::config::{post_hook, pre_hook};
use apflow_core::execution::manager::{ManagerConfig, TaskManager};
use apflow_core::extensions::ExtensionRegistry;
use apflow_core::streaming::{CollectingCallback, StreamingCallback};
use apflow_db::TaskRepository;
use apflow_db::models::{StatusUpdate, TaskSpec, TaskStatus};
use apflow_test_utils::{create_test_db, dep};
use common::{Gauge, GaugeExecutor, test_registry};

async fn create_all(repo: &TaskRepository, specs: Vec<TaskSpec>) -> String {
    let mut root_id = String::new();
    for spec in specs {
        let task = repo.create_task(&spec).await.unwrap();
        if task.parent_id.is_none() {
            root_id = task.id;
        }
    }
    root_id
}

#[tokio::test]
async fn single_task_completes_in_one_sweep() {
    apflow_test_utils::init_tracing();
    let db = create_test_db().await;
    let repo = db.repository();
    let root_id = create_all(
        &repo,
        vec![
            TaskSpec::new("solo")
                .with_id("solo")
                .with_method("emit")
                .with_input("payload", json!({"answer": 42})),
        ],
    )
    .await;

    let manager = TaskManager::new(repo.clone(), test_registry());
    let outcome = manager.run(&root_id).await.unwrap();

    assert_eq!(outcome.status, TaskStatus::Completed);
    assert_eq!(outcome.progress, 1.0);

    let task = repo.get_task("solo").await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.progress, 1.0);
    assert!(task.started_at.is_some());
    assert!(task.completed_at.is_some());
    let result = task.result.unwrap();
    assert_eq!(result["status"], json!("success"));
    assert_eq!(result["result"], json!({"answer": 42}));
}

#[tokio::test]
async fn two_level_tree_completes_and_rolls_up() {
    let db = create_test_db().await;
    let repo = db.repository();
    let root_id = create_all(
        &repo,
        vec![
            TaskSpec::new("root").with_id("R"),
            TaskSpec::new("sys")
                .with_id("A")
                .with_parent("R")
                .with_method("system_info")
                .with_input("resource", json!("cpu")),
            TaskSpec::new("sys")
                .with_id("B")
                .with_parent("R")
                .with_method("system_info")
                .with_input("resource", json!("memory")),
        ],
    )
    .await;

    let manager = TaskManager::new(repo.clone(), test_registry());
    let outcome = manager.run(&root_id).await.unwrap();

    assert_eq!(outcome.status, TaskStatus::Completed);
    assert_eq!(outcome.progress, 1.0);
    for id in ["R", "A", "B"] {
        let task = repo.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed, "task {id}");
        assert_eq!(task.progress, 1.0, "task {id}");
    }
}

#[tokio::test]
async fn dependency_fields_are_mapped_into_inputs_at_dispatch() {
    let db = create_test_db().await;
    let repo = db.repository();

    let mut consumer = TaskSpec::new("consumer")
        .with_id("Q")
        .with_parent("P")
        .with_dependency(dep("P"));
    consumer
        .schemas
        .insert("method".to_owned(), json!("aggregate_results"));
    consumer.schemas.insert(
        "input_schema".to_owned(),
        json!({"properties": {"cores": {}, "system": {}}}),
    );

    let root_id = create_all(
        &repo,
        vec![
            TaskSpec::new("producer")
                .with_id("P")
                .with_method("emit")
                .with_input("payload", json!({"cores": 8, "system": "linux"})),
            consumer,
        ],
    )
    .await;

    let manager = TaskManager::new(repo.clone(), test_registry());
    let outcome = manager.run(&root_id).await.unwrap();
    assert_eq!(outcome.status, TaskStatus::Completed);

    let q = repo.get_task("Q").await.unwrap().unwrap();
    assert_eq!(q.status, TaskStatus::Completed);
    assert_eq!(q.inputs.get("cores"), Some(&json!(8)));
    assert_eq!(q.inputs.get("system"), Some(&json!("linux")));

    let result = q.result.unwrap();
    assert_eq!(result["result"]["cores"], json!(8));
}

#[tokio::test]
async fn linear_chain_completes_in_dependency_order() {
    let db = create_test_db().await;
    let repo = db.repository();
    let root_id = create_all(
        &repo,
        vec![
            TaskSpec::new("a").with_id("a").with_method("emit"),
            TaskSpec::new("b")
                .with_id("b")
                .with_parent("a")
                .with_method("emit")
                .with_dependency(dep("a")),
            TaskSpec::new("c")
                .with_id("c")
                .with_parent("b")
                .with_method("emit")
                .with_dependency(dep("b")),
        ],
    )
    .await;

    let order: Arc<Mutex<Vec<String>>> = Arc::default();
    let record = Arc::clone(&order);
    let manager = TaskManager::new(repo.clone(), test_registry()).with_hooks(
        vec![],
        vec![post_hook(move |task, _inputs, _result| {
            let record = Arc::clone(&record);
            let id = task.id.clone();
            Box::pin(async move {
                record.lock().unwrap().push(id);
                Ok(())
            })
        })],
    );

    let outcome = manager.run(&root_id).await.unwrap();
    assert_eq!(outcome.status, TaskStatus::Completed);
    assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
}

#[tokio::test]
async fn diamond_dispatches_join_after_both_branches() {
    let db = create_test_db().await;
    let repo = db.repository();
    let root_id = create_all(
        &repo,
        vec![
            TaskSpec::new("a")
                .with_id("a")
                .with_method("emit")
                .with_input("payload", json!({"seed": 1})),
            TaskSpec::new("b")
                .with_id("b")
                .with_parent("a")
                .with_method("emit")
                .with_dependency(dep("a"))
                .with_input("payload", json!({"left": true})),
            TaskSpec::new("c")
                .with_id("c")
                .with_parent("a")
                .with_method("emit")
                .with_dependency(dep("a"))
                .with_input("payload", json!({"right": true})),
            TaskSpec::new("d")
                .with_id("d")
                .with_parent("a")
                .with_method("aggregate_results")
                .with_dependency(apflow_db::models::TaskDependency::Id("b".to_owned()))
                .with_dependency(apflow_db::models::TaskDependency::Id("c".to_owned())),
        ],
    )
    .await;

    let manager = TaskManager::new(repo.clone(), test_registry());
    let outcome = manager.run(&root_id).await.unwrap();
    assert_eq!(outcome.status, TaskStatus::Completed);

    // d only dispatches once both producers completed; its merged inputs
    // carry both stored results.
    let d = repo.get_task("d").await.unwrap().unwrap();
    assert_eq!(d.status, TaskStatus::Completed);
    assert_eq!(d.inputs["result"], json!({"right": true}));
    assert_eq!(d.inputs["status"], json!("success"));
}

#[tokio::test]
async fn fanout_is_bounded_by_max_concurrency() {
    let db = create_test_db().await;
    let repo = db.repository();

    let registry = Arc::new(ExtensionRegistry::new());
    let gauge = Arc::new(Gauge::default());
    GaugeExecutor::register(&registry, Arc::clone(&gauge));

    let mut specs = vec![TaskSpec::new("root").with_id("r")];
    for i in 0..4 {
        specs.push(
            TaskSpec::new(format!("leaf-{i}"))
                .with_id(format!("leaf-{i}"))
                .with_parent("r")
                .with_method("gauge"),
        );
    }
    let root_id = create_all(&repo, specs).await;

    let manager = TaskManager::new(repo.clone(), registry)
        .with_config(ManagerConfig { max_concurrency: 2 });
    let outcome = manager.run(&root_id).await.unwrap();

    assert_eq!(outcome.status, TaskStatus::Completed);
    assert!(gauge.peak() >= 1);
    assert!(gauge.peak() <= 2, "peak concurrency was {}", gauge.peak());
}

#[tokio::test]
async fn failed_producer_leaves_dependent_pending_and_tree_failed() {
    let db = create_test_db().await;
    let repo = db.repository();
    let root_id = create_all(
        &repo,
        vec![
            TaskSpec::new("root").with_id("r"),
            TaskSpec::new("broken")
                .with_id("a")
                .with_parent("r")
                .with_method("emit")
                .with_input("fail", json!(true))
                .with_input("token_usage", json!({"input": 11, "output": 2})),
            TaskSpec::new("dependent")
                .with_id("b")
                .with_parent("r")
                .with_method("emit")
                .with_dependency(dep("a")),
            TaskSpec::new("independent")
                .with_id("c")
                .with_parent("r")
                .with_method("emit"),
        ],
    )
    .await;

    let manager = TaskManager::new(repo.clone(), test_registry());
    let outcome = manager.run(&root_id).await.unwrap();
    assert_eq!(outcome.status, TaskStatus::Failed);

    let a = repo.get_task("a").await.unwrap().unwrap();
    assert_eq!(a.status, TaskStatus::Failed);
    assert_eq!(a.error.as_deref(), Some("requested failure"));
    assert_eq!(a.result.unwrap()["token_usage"], json!({"input": 11, "output": 2}));

    // The sibling in the same sweep still ran; the dependent never did.
    let c = repo.get_task("c").await.unwrap().unwrap();
    assert_eq!(c.status, TaskStatus::Completed);
    let b = repo.get_task("b").await.unwrap().unwrap();
    assert_eq!(b.status, TaskStatus::Pending);

    let root = repo.get_task("r").await.unwrap().unwrap();
    assert_eq!(root.status, TaskStatus::Failed);
}

#[tokio::test]
async fn unknown_method_fails_the_task_immediately() {
    let db = create_test_db().await;
    let repo = db.repository();
    let root_id = create_all(
        &repo,
        vec![TaskSpec::new("mystery").with_id("m").with_method("no_such_executor")],
    )
    .await;

    let manager = TaskManager::new(repo.clone(), test_registry());
    let outcome = manager.run(&root_id).await.unwrap();
    assert_eq!(outcome.status, TaskStatus::Failed);

    let task = repo.get_task("m").await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.unwrap().contains("no_such_executor"));
}

#[tokio::test]
async fn cancellation_between_sweeps_cancels_the_rest_of_the_chain() {
    let db = create_test_db().await;
    let repo = db.repository();
    let root_id = create_all(
        &repo,
        vec![
            TaskSpec::new("a").with_id("a").with_method("emit"),
            TaskSpec::new("b")
                .with_id("b")
                .with_parent("a")
                .with_method("emit")
                .with_dependency(dep("a")),
            TaskSpec::new("c")
                .with_id("c")
                .with_parent("b")
                .with_method("emit")
                .with_dependency(dep("b")),
        ],
    )
    .await;

    // The flag goes up right after a's row is persisted, before b dispatches.
    let token = CancellationToken::new();
    let cancel = token.clone();
    let manager = TaskManager::new(repo.clone(), test_registry())
        .with_cancellation(token)
        .with_hooks(
            vec![],
            vec![post_hook(move |task, _inputs, _result| {
                let cancel = cancel.clone();
                let is_first = task.id == "a";
                Box::pin(async move {
                    if is_first {
                        cancel.cancel();
                    }
                    Ok(())
                })
            })],
        );

    let outcome = manager.run(&root_id).await.unwrap();
    assert_eq!(outcome.status, TaskStatus::Cancelled);

    let a = repo.get_task("a").await.unwrap().unwrap();
    assert_eq!(a.status, TaskStatus::Completed);
    let b = repo.get_task("b").await.unwrap().unwrap();
    assert_eq!(b.status, TaskStatus::Cancelled);
    let c = repo.get_task("c").await.unwrap().unwrap();
    assert_eq!(c.status, TaskStatus::Cancelled);
}

#[tokio::test]
async fn cancelable_executor_is_asked_to_cancel() {
    let db = create_test_db().await;
    let repo = db.repository();
    let root_id = create_all(
        &repo,
        vec![
            TaskSpec::new("slow")
                .with_id("slow")
                .with_method("slow_cancelable")
                .with_input("duration_ms", json!(10_000)),
        ],
    )
    .await;

    let token = CancellationToken::new();
    let manager = TaskManager::new(repo.clone(), test_registry()).with_cancellation(token.clone());

    let (outcome, _) = tokio::join!(manager.run(&root_id), async {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        token.cancel();
    });
    let outcome = outcome.unwrap();
    assert_eq!(outcome.status, TaskStatus::Cancelled);

    let task = repo.get_task("slow").await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    let result = task.result.unwrap();
    assert_eq!(result["result"], json!({"partial": true}));
    assert_eq!(result["token_usage"], json!({"input": 5, "output": 7}));
}

#[tokio::test]
async fn non_cancelable_executor_finishes_but_row_ends_cancelled() {
    let db = create_test_db().await;
    let repo = db.repository();
    let root_id = create_all(
        &repo,
        vec![
            TaskSpec::new("steady")
                .with_id("steady")
                .with_method("emit")
                .with_input("sleep_ms", json!(200))
                .with_input("payload", json!({"finished": true})),
        ],
    )
    .await;

    let token = CancellationToken::new();
    let manager = TaskManager::new(repo.clone(), test_registry()).with_cancellation(token.clone());

    let (outcome, _) = tokio::join!(manager.run(&root_id), async {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        token.cancel();
    });
    let outcome = outcome.unwrap();
    assert_eq!(outcome.status, TaskStatus::Cancelled);

    // The executor ran to completion; its payload survives on the row.
    let task = repo.get_task("steady").await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert_eq!(task.result.unwrap()["result"], json!({"finished": true}));
}

#[tokio::test]
async fn hooks_run_in_order_and_failures_are_swallowed() {
    let db = create_test_db().await;
    let repo = db.repository();
    let root_id = create_all(
        &repo,
        vec![TaskSpec::new("hooked").with_id("h").with_method("emit")],
    )
    .await;

    let calls: Arc<Mutex<Vec<&'static str>>> = Arc::default();
    let first = Arc::clone(&calls);
    let second = Arc::clone(&calls);
    let third = Arc::clone(&calls);

    let manager = TaskManager::new(repo.clone(), test_registry()).with_hooks(
        vec![
            pre_hook(move |task| {
                let first = Arc::clone(&first);
                task.inputs.insert("stamped".to_owned(), json!(true));
                Box::pin(async move {
                    first.lock().unwrap().push("pre-1");
                    Ok(())
                })
            }),
            pre_hook(move |_task| {
                let second = Arc::clone(&second);
                Box::pin(async move {
                    second.lock().unwrap().push("pre-2");
                    anyhow::bail!("hook blew up")
                })
            }),
        ],
        vec![post_hook(move |_task, inputs, result| {
            let third = Arc::clone(&third);
            assert_eq!(inputs.get("stamped"), Some(&json!(true)));
            assert_eq!(result["status"], json!("success"));
            Box::pin(async move {
                third.lock().unwrap().push("post-1");
                Ok(())
            })
        })],
    );

    let outcome = manager.run(&root_id).await.unwrap();
    assert_eq!(outcome.status, TaskStatus::Completed);
    assert_eq!(*calls.lock().unwrap(), vec!["pre-1", "pre-2", "post-1"]);

    // The pre-hook mutation reached the executor and the persisted row.
    let task = repo.get_task("h").await.unwrap().unwrap();
    assert_eq!(task.inputs.get("stamped"), Some(&json!(true)));
    assert_eq!(task.result.unwrap()["result"]["stamped"], json!(true));
}

#[tokio::test]
async fn streaming_events_trace_the_state_transitions() {
    let db = create_test_db().await;
    let repo = db.repository();
    let root_id = create_all(
        &repo,
        vec![
            TaskSpec::new("root").with_id("r"),
            TaskSpec::new("leaf").with_id("leaf").with_parent("r").with_method("emit"),
        ],
    )
    .await;

    let callback = Arc::new(CollectingCallback::new());
    let manager = TaskManager::new(repo.clone(), test_registry())
        .with_streaming(Arc::clone(&callback) as Arc<dyn StreamingCallback>);
    manager.run(&root_id).await.unwrap();

    let leaf_events = callback.events_for("leaf").await;
    assert_eq!(leaf_events.len(), 2);
    assert_eq!(leaf_events[0].status, TaskStatus::InProgress);
    assert!(!leaf_events[0].final_);
    assert_eq!(leaf_events[1].status, TaskStatus::Completed);
    assert!(leaf_events[1].final_);
    assert!(leaf_events[1].result.is_some());
    assert_eq!(leaf_events[1].context_id, "r");

    let root_events = callback.events_for("r").await;
    let last = root_events.last().unwrap();
    assert_eq!(last.status, TaskStatus::Completed);
    assert!(last.final_);
    assert_eq!(last.progress, 1.0);
}

#[tokio::test]
async fn remarked_pending_task_reruns_with_cached_upstream_result() {
    let db = create_test_db().await;
    let repo = db.repository();
    let root_id = create_all(
        &repo,
        vec![
            TaskSpec::new("up")
                .with_id("up")
                .with_method("emit")
                .with_input("payload", json!({"version": 1})),
            TaskSpec::new("down")
                .with_id("down")
                .with_parent("up")
                .with_method("aggregate_results")
                .with_dependency(apflow_db::models::TaskDependency::Id("up".to_owned())),
        ],
    )
    .await;

    let manager = TaskManager::new(repo.clone(), test_registry());
    assert_eq!(manager.run(&root_id).await.unwrap().status, TaskStatus::Completed);

    // Re-mark downstream and give it a stale error to verify recovery.
    repo.update_status(
        "down",
        TaskStatus::Pending,
        StatusUpdate {
            error: Some("stale failure".to_owned()),
            progress: Some(0.0),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let manager = TaskManager::new(repo.clone(), test_registry());
    let outcome = manager.run(&root_id).await.unwrap();
    assert_eq!(outcome.status, TaskStatus::Completed);

    let down = repo.get_task("down").await.unwrap().unwrap();
    assert_eq!(down.status, TaskStatus::Completed);
    assert!(down.error.is_none());
    // The upstream's cached stored result satisfied and fed the re-run.
    assert_eq!(down.inputs["result"], json!({"version": 1}));
}

#[tokio::test]
async fn progress_reflects_partial_completion() {
    let db = create_test_db().await;
    let repo = db.repository();
    let root_id = create_all(
        &repo,
        vec![
            TaskSpec::new("root").with_id("r"),
            TaskSpec::new("ok").with_id("ok").with_parent("r").with_method("emit"),
            TaskSpec::new("blocked")
                .with_id("blocked")
                .with_parent("r")
                .with_method("emit")
                .with_dependency(dep("never")),
        ],
    )
    .await;

    // An unsatisfiable dependency: "never" is not in the tree.
    let manager = TaskManager::new(repo.clone(), test_registry());
    let outcome = manager.run(&root_id).await.unwrap();

    // ok completed, blocked stuck pending, root rolled up half done.
    assert_eq!(outcome.progress, 0.5);
    let root = repo.get_task("r").await.unwrap().unwrap();
    assert_eq!(root.progress, 0.5);
    assert_eq!(root.status, TaskStatus::Pending);
}
