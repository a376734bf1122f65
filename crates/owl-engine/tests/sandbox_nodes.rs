mod common;

use std::time::{Duration, Instant};

use serde_json::json;

use owl_core::config::SandboxConfig;
use owl_core::error::{ExecutionFault, OwlError, SandboxFault};
use owl_core::schema::TypeSchema;
use owl_core::types::{field_map, FieldMap, TypeTag};
use owl_engine::{Executor, Node, NodeEnv, ProviderRegistry, Workflow};
use owl_sandbox::Sandbox;

fn single(node: Node) -> Workflow {
    let mut wf = Workflow::new("single").unwrap();
    wf.add_entry_node(node).unwrap();
    wf
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn runaway_snippet_times_out() {
    let node = Node::sandboxed("spin", "while True:\n    pass\n", TypeSchema::new(), TypeSchema::new())
        .unwrap()
        .with_timeout(Duration::from_millis(100));

    let start = Instant::now();
    let err = Executor::new(NodeEnv::default())
        .run(&single(node), FieldMap::new())
        .await
        .unwrap_err();

    assert!(start.elapsed() < Duration::from_secs(5));
    match err {
        OwlError::NodeExecution(e) => {
            assert_eq!(e.node, "spin");
            assert!(e.is_timeout());
            assert_eq!(
                e.cause,
                ExecutionFault::Sandbox(SandboxFault::TimedOut { budget_ms: 100 })
            );
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn sandbox_default_timeout_applies() {
    let sandbox = Sandbox::new(SandboxConfig {
        timeout_ms: 50,
        ..SandboxConfig::default()
    });
    let env = NodeEnv::new(ProviderRegistry::new(), sandbox);
    let node = Node::sandboxed("spin", "n = 0\nwhile n >= 0:\n    n += 1\n", TypeSchema::new(), TypeSchema::new())
        .unwrap();

    let err = Executor::new(env)
        .run(&single(node), FieldMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, OwlError::NodeExecution(ref e) if e.is_timeout()));
}

#[tokio::test]
async fn forbidden_operations_are_security_violations() {
    for source in [
        "import os",
        "x = open('/etc/passwd')",
        "x = ''.__class__",
        "y = eval('1')",
    ] {
        let node = Node::sandboxed("evil", source, TypeSchema::new(), TypeSchema::new()).unwrap();
        let err = Executor::new(NodeEnv::default())
            .run(&single(node), FieldMap::new())
            .await
            .unwrap_err();
        assert!(
            matches!(
                err,
                OwlError::NodeExecution(ref e)
                    if matches!(e.cause, ExecutionFault::Sandbox(SandboxFault::SecurityViolation(_)))
            ),
            "{} -> {}",
            source,
            err
        );
    }
}

#[tokio::test]
async fn sandbox_output_must_match_schema() {
    let node = Node::sandboxed(
        "stats",
        "total = sum(values)\nmean = total / len(values)\n",
        TypeSchema::of([("values", TypeTag::Sequence)]),
        TypeSchema::of([("total", TypeTag::Integer), ("mean", TypeTag::Float)]),
    )
    .unwrap();
    let out = Executor::new(NodeEnv::default())
        .run(&single(node), field_map([("values", json!([1, 2, 3, 4]))]))
        .await
        .unwrap();
    assert_eq!(out["total"], json!(10));
    assert_eq!(out["mean"], json!(2.5));
}

/// Runs on a plain thread so a worker that outlives its budget shows up as
/// a missing reply instead of a hung test.
fn run_blocking_on_thread(source: &'static str, outputs: TypeSchema, budget: Duration) -> Result<FieldMap, OwlError> {
    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let node = Node::sandboxed("snippet", source, TypeSchema::new(), outputs)
            .unwrap()
            .with_timeout(budget);
        let result = Executor::new(NodeEnv::default()).run_blocking(&single(node), FieldMap::new());
        let _ = tx.send(result);
    });
    rx.recv_timeout(Duration::from_secs(10))
        .expect("run_blocking did not return after the snippet budget")
}

#[test]
fn empty_repetition_finishes_inside_budget() {
    let out = run_blocking_on_thread(
        "xs = [] * 1000000000000000",
        TypeSchema::of([("xs", TypeTag::Sequence)]),
        Duration::from_millis(100),
    )
    .unwrap();
    assert_eq!(out["xs"], json!([]));
}

#[test]
fn oversized_repetition_faults_without_hanging() {
    let err = run_blocking_on_thread(
        "s = 'x' * 1000000\nxs = [s] * 100000",
        TypeSchema::new(),
        Duration::from_millis(100),
    )
    .unwrap_err();
    assert!(
        matches!(
            err,
            OwlError::NodeExecution(ref e)
                if matches!(e.cause, ExecutionFault::Sandbox(SandboxFault::Faulted(ref m)) if m.contains("allocated"))
        ),
        "{}",
        err
    );
}

#[test]
fn timed_out_worker_releases_run_blocking() {
    let err = run_blocking_on_thread("while True:\n    pass\n", TypeSchema::new(), Duration::from_millis(100))
        .unwrap_err();
    assert!(matches!(err, OwlError::NodeExecution(ref e) if e.is_timeout()));
}
