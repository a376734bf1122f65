use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use tracing::{debug, error, info};
use uuid::Uuid;

use owl_core::config::{ExecutionMode, ExecutorConfig, OverwritePolicy};
use owl_core::error::{
    ExecutionFault, NodeConnectionError, NodeExecutionError, NodeValidationError, OwlError,
    Result, ValidationPhase,
};
use owl_core::event::{EventBus, NodeEvent, NodePhase};
use owl_core::types::FieldMap;

use crate::context::ExecutionContext;
use crate::graph::Workflow;
use crate::node::{Node, NodeEnv};

/// Runs workflows.
///
/// Nodes execute in topological order; each one sees only the context fields
/// its input schema declares and its outputs are validated before they are
/// merged. The first failure aborts the run and no partial context is
/// returned. The executor never retries.
pub struct Executor {
    config: ExecutorConfig,
    env: NodeEnv,
    events: Option<Arc<EventBus>>,
}

/// Per-run bookkeeping shared by both scheduling modes.
struct Run<'a> {
    id: Uuid,
    workflow: &'a Workflow,
    context: ExecutionContext,
    completed: Vec<String>,
}

impl Executor {
    pub fn new(env: NodeEnv) -> Self {
        Self {
            config: ExecutorConfig::default(),
            env,
            events: None,
        }
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.config.mode = mode;
        self
    }

    pub fn with_overwrite(mut self, policy: OverwritePolicy) -> Self {
        self.config.overwrite = policy;
        self
    }

    /// Publish a `NodeEvent` per node phase on `bus`.
    pub fn with_events(mut self, bus: Arc<EventBus>) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn env(&self) -> &NodeEnv {
        &self.env
    }

    /// Run `workflow` on `inputs` and return the final context.
    pub async fn run(&self, workflow: &Workflow, inputs: FieldMap) -> Result<FieldMap> {
        let order = workflow.validate()?;
        let mut run = Run {
            id: Uuid::new_v4(),
            workflow,
            context: ExecutionContext::new(inputs),
            completed: Vec::new(),
        };
        let start = Instant::now();
        info!(
            run_id = %run.id,
            workflow = %workflow.name(),
            nodes = order.len(),
            mode = ?self.config.mode,
            "Starting workflow run"
        );

        let result = match self.config.mode {
            ExecutionMode::Sequential => self.run_sequential(&mut run, order).await,
            ExecutionMode::Parallel => self.run_parallel(&mut run).await,
        };

        let elapsed_ms = start.elapsed().as_millis() as u64;
        match result {
            Ok(()) => {
                info!(run_id = %run.id, elapsed_ms, "Workflow run complete");
                Ok(run.context.into_values())
            }
            Err(e) => {
                error!(run_id = %run.id, elapsed_ms, error = %e, "Workflow run aborted");
                debug!(
                    run_id = %run.id,
                    completed = ?run.completed,
                    fields = ?run.context.keys(),
                    "Discarding partial context"
                );
                Err(e)
            }
        }
    }

    /// Blocking wrapper around `run` on a private runtime.
    ///
    /// Must not be called from inside an async context.
    pub fn run_blocking(&self, workflow: &Workflow, inputs: FieldMap) -> Result<FieldMap> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;
        runtime.block_on(self.run(workflow, inputs))
    }

    async fn run_sequential(&self, run: &mut Run<'_>, order: &[String]) -> Result<()> {
        for id in order {
            let node = self.lookup(run.workflow, id)?;
            let inputs = self.prepare(run, &node)?;
            let started = Instant::now();
            let outputs = node.execute(inputs, &self.env).await;
            self.finish(run, &node, outputs, started)?;
        }
        Ok(())
    }

    /// One level at a time: snapshot inputs, execute the level concurrently,
    /// then validate and merge in topological order.
    async fn run_parallel(&self, run: &mut Run<'_>) -> Result<()> {
        let workflow = run.workflow;
        for level in workflow.levels() {
            // Validate the whole level before announcing any of it.
            let mut batch = Vec::with_capacity(level.len());
            for id in &level {
                let node = self.lookup(workflow, id)?;
                match self.slice_inputs(run, &node) {
                    Ok(inputs) => batch.push((node, inputs)),
                    Err(e) => {
                        self.start(run.id, &node);
                        self.fail(run.id, node.id(), &e);
                        return Err(e);
                    }
                }
            }
            for (node, _) in &batch {
                self.start(run.id, node);
            }
            debug!(run_id = %run.id, nodes = ?level, "Dispatching level");

            let handles: Vec<_> = batch
                .iter()
                .map(|(node, inputs)| {
                    let node = Arc::clone(node);
                    let inputs = inputs.clone();
                    let env = self.env.clone();
                    tokio::spawn(async move {
                        let started = Instant::now();
                        let result = node.execute(inputs, &env).await;
                        (result, started)
                    })
                })
                .collect();

            let results = join_all(handles).await;
            for ((node, _), joined) in batch.iter().zip(results) {
                let (outputs, started) = match joined {
                    Ok(done) => done,
                    Err(e) => (
                        Err(NodeExecutionError::new(
                            node.id(),
                            ExecutionFault::Computation(format!("worker task failed: {}", e)),
                        )),
                        Instant::now(),
                    ),
                };
                self.finish(run, node, outputs, started)?;
            }
        }
        Ok(())
    }

    fn lookup(&self, workflow: &Workflow, id: &str) -> Result<Arc<Node>> {
        workflow
            .node(id)
            .cloned()
            .ok_or_else(|| NodeConnectionError::UnknownNode { id: id.to_string() }.into())
    }

    /// Announce a node, then slice and validate its inputs.
    fn prepare(&self, run: &Run<'_>, node: &Node) -> Result<FieldMap> {
        self.start(run.id, node);
        self.slice_inputs(run, node).map_err(|err| {
            self.fail(run.id, node.id(), &err);
            err
        })
    }

    fn slice_inputs(&self, run: &Run<'_>, node: &Node) -> Result<FieldMap> {
        let sliced = run.context.slice(node.input_schema());
        node.input_schema().validate(&sliced).map_err(|source| {
            OwlError::from(NodeValidationError {
                node: node.id().to_string(),
                phase: ValidationPhase::Input,
                source,
            })
        })
    }

    fn start(&self, run_id: Uuid, node: &Node) {
        self.emit(run_id, node.id(), NodePhase::Start, node.kind().to_string());
        info!(run_id = %run_id, node = %node.id(), kind = %node.kind(), "Executing node");
    }

    /// Validate a node's result and merge it into the context.
    fn finish(
        &self,
        run: &mut Run<'_>,
        node: &Node,
        outputs: std::result::Result<FieldMap, NodeExecutionError>,
        started: Instant,
    ) -> Result<()> {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let result = outputs
            .map_err(|e| OwlError::from(e.with_upstream(run.workflow.upstream_of(node.id()))))
            .and_then(|outputs| {
                node.output_schema().validate(&outputs).map_err(|source| {
                    OwlError::from(NodeValidationError {
                        node: node.id().to_string(),
                        phase: ValidationPhase::Output,
                        source,
                    })
                })
            })
            .and_then(|validated| {
                run.context
                    .merge(node.id(), validated, self.config.overwrite)
            });

        match result {
            Ok(()) => {
                debug!(run_id = %run.id, node = %node.id(), elapsed_ms, "Node complete");
                self.emit(run.id, node.id(), NodePhase::Success, format!("{}ms", elapsed_ms));
                run.completed.push(node.id().to_string());
                Ok(())
            }
            Err(e) => {
                self.fail(run.id, node.id(), &e);
                Err(e)
            }
        }
    }

    fn fail(&self, run_id: Uuid, node: &str, err: &OwlError) {
        error!(run_id = %run_id, node, error = %err, "Node failed");
        self.emit(run_id, node, NodePhase::Error, err.to_string());
    }

    fn emit(&self, run_id: Uuid, node: &str, phase: NodePhase, detail: String) {
        if let Some(bus) = &self.events {
            bus.publish(NodeEvent::new(run_id, node, phase, detail));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use owl_core::error::SchemaValidationError;
    use owl_core::schema::TypeSchema;
    use owl_core::types::{field_map, TypeTag};
    use serde_json::json;

    fn add_one(id: &str, input: &'static str, output: &'static str) -> Node {
        Node::pure(
            id,
            TypeSchema::of([(input, TypeTag::Integer)]),
            TypeSchema::of([(output, TypeTag::Integer)]),
            move |inputs| {
                let n = inputs[input].as_i64().unwrap_or_default();
                Ok(field_map([(output, json!(n + 1))]))
            },
        )
        .unwrap()
    }

    fn chain() -> Workflow {
        let mut wf = Workflow::new("chain").unwrap();
        wf.add_node(add_one("first", "a", "b")).unwrap();
        wf.add_node(add_one("second", "b", "c")).unwrap();
        wf.connect("first", "second").unwrap();
        wf
    }

    #[tokio::test]
    async fn test_sequential_chain() {
        let out = Executor::new(NodeEnv::default())
            .run(&chain(), field_map([("a", json!(1))]))
            .await
            .unwrap();
        assert_eq!(out, field_map([("a", json!(1)), ("b", json!(2)), ("c", json!(3))]));
    }

    #[tokio::test]
    async fn test_missing_input_names_node() {
        let err = Executor::new(NodeEnv::default())
            .run(&chain(), FieldMap::new())
            .await
            .unwrap_err();
        match err {
            OwlError::NodeValidation(e) => {
                assert_eq!(e.node, "first");
                assert_eq!(e.phase, ValidationPhase::Input);
                assert_eq!(e.source, SchemaValidationError::MissingField { field: "a".into() });
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_bad_output_is_rejected() {
        let mut wf = Workflow::new("bad").unwrap();
        wf.add_entry_node(
            Node::pure("liar", TypeSchema::new(), TypeSchema::of([("n", TypeTag::Integer)]), |_| {
                Ok(field_map([("n", json!("three"))]))
            })
            .unwrap(),
        )
        .unwrap();
        let err = Executor::new(NodeEnv::default())
            .run(&wf, FieldMap::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OwlError::NodeValidation(NodeValidationError { phase: ValidationPhase::Output, .. })
        ));
    }

    #[tokio::test]
    async fn test_execution_error_carries_upstream() {
        let mut wf = chain();
        wf.add_node(
            Node::pure("third", TypeSchema::of([("c", TypeTag::Integer)]), TypeSchema::new(), |_| {
                anyhow::bail!("boom")
            })
            .unwrap(),
        )
        .unwrap();
        wf.connect("second", "third").unwrap();

        let err = Executor::new(NodeEnv::default())
            .run(&wf, field_map([("a", json!(0))]))
            .await
            .unwrap_err();
        match err {
            OwlError::NodeExecution(e) => {
                assert_eq!(e.node, "third");
                assert_eq!(e.upstream, vec!["first", "second"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_reject_policy_detects_collision() {
        let mut wf = Workflow::new("collide").unwrap();
        wf.add_node(add_one("first", "a", "b")).unwrap();
        wf.add_node(add_one("again", "b", "b")).unwrap();
        wf.connect("first", "again").unwrap();

        let executor = Executor::new(NodeEnv::default());
        let out = executor
            .run(&wf, field_map([("a", json!(1))]))
            .await
            .unwrap();
        assert_eq!(out["b"], json!(3));

        let err = Executor::new(NodeEnv::default())
            .with_overwrite(OverwritePolicy::Reject)
            .run(&wf, field_map([("a", json!(1))]))
            .await
            .unwrap_err();
        assert!(matches!(err, OwlError::FieldCollision { ref node, .. } if node == "again"));
    }

    #[tokio::test]
    async fn test_events_per_phase() {
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        Executor::new(NodeEnv::default())
            .with_events(Arc::clone(&bus))
            .run(&chain(), field_map([("a", json!(1))]))
            .await
            .unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push((event.node_id, event.phase));
        }
        assert_eq!(
            seen,
            vec![
                ("first".to_string(), NodePhase::Start),
                ("first".to_string(), NodePhase::Success),
                ("second".to_string(), NodePhase::Start),
                ("second".to_string(), NodePhase::Success),
            ]
        );
    }

    #[tokio::test]
    async fn test_parallel_input_failure_announces_no_siblings() {
        let mut wf = Workflow::new("siblings").unwrap();
        wf.add_entry_node(add_one("ready", "a", "b")).unwrap();
        wf.add_entry_node(add_one("starved", "missing", "c")).unwrap();

        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let err = Executor::new(NodeEnv::default())
            .with_mode(ExecutionMode::Parallel)
            .with_events(Arc::clone(&bus))
            .run(&wf, field_map([("a", json!(1))]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OwlError::NodeValidation(ref e) if e.node == "starved" && e.phase == ValidationPhase::Input
        ));

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push((event.node_id, event.phase));
        }
        assert_eq!(
            seen,
            vec![
                ("starved".to_string(), NodePhase::Start),
                ("starved".to_string(), NodePhase::Error),
            ]
        );
    }

    #[tokio::test]
    async fn test_orphan_blocks_run() {
        let mut wf = chain();
        wf.add_node(add_one("stray", "x", "y")).unwrap();
        let err = Executor::new(NodeEnv::default())
            .run(&wf, FieldMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OwlError::NodeConnection(_)));
    }

    #[test]
    fn test_run_blocking() {
        let out = Executor::new(NodeEnv::default())
            .run_blocking(&chain(), field_map([("a", json!(10))]))
            .unwrap();
        assert_eq!(out["c"], json!(12));
    }
}
