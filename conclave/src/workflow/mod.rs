//! Workflow execution: sequential step lists and parallel DAGs.
//!
//! Two modes from the same step list (selected by the presence of stable
//! step ids): sequential runs steps in `order`, each step's output feeding
//! the next; DAG mode repeatedly computes the ready-set (dependencies completed,
//! not skipped, branch gate satisfied), runs agent nodes concurrently, and
//! lets condition nodes route by marking non-taken branches skipped.
//!
//! The [`WorkflowRun`] row mirrors the per-step snapshot on every change so
//! reconnecting clients can read current state. Final output is the
//! concatenation of sink-node outputs. Agent nodes record `workflow_step`
//! trace spans. A failed node fails the run; downstream nodes are not run.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::StreamExt;
use sse_event::StreamEvent;
use tokio::task::JoinSet;
use tracing::warn;

use crate::engine::prompts::{condition_prompt, TOOL_RESULT_PROMPT};
use crate::engine::trace::TraceRecorder;
use crate::engine::turn::run_blocking_loop;
use crate::engine::{AgentResources, EventSink, EventStream, StreamEngine};
use crate::entity::workflow::{
    is_dag, sink_ids, validate_acyclic, NodeKind, RunStatus, StepResult, Workflow, WorkflowRun,
    WorkflowStep,
};
use crate::entity::new_id;
use crate::error::EngineError;
use crate::mcp::{is_mcp_name, McpToolbox};
use crate::message::ChatMessage;
use crate::provider::{ChatProvider, StreamChunk};
use crate::store::SqliteStore;

/// Runs workflows against the engine's shared resources.
pub struct WorkflowExecutor {
    engine: Arc<StreamEngine>,
}

impl WorkflowExecutor {
    pub fn new(engine: Arc<StreamEngine>) -> Self {
        Self { engine }
    }

    fn store(&self) -> &Arc<SqliteStore> {
        self.engine.store()
    }

    /// Starts a run and returns its event stream plus the run id.
    pub async fn run_workflow(
        &self,
        user_id: &str,
        workflow_id: &str,
        input: String,
    ) -> Result<(EventStream, String), EngineError> {
        let (run, workflow) = self.prepare_run(user_id, workflow_id, input).await?;
        let run_id = run.id.clone();
        let (sink, stream) = EventSink::channel();
        let engine = self.engine.clone();
        tokio::spawn(async move {
            execute(engine, run, workflow, sink).await;
        });
        Ok((stream, run_id))
    }

    /// Non-streaming variant used by the scheduler: executes to completion
    /// and returns the final run row. Progress events are discarded.
    pub async fn run_workflow_blocking(
        &self,
        user_id: &str,
        workflow_id: &str,
        input: String,
    ) -> Result<WorkflowRun, EngineError> {
        let (run, workflow) = self.prepare_run(user_id, workflow_id, input).await?;
        let run_id = run.id.clone();
        let (sink, stream) = EventSink::channel();
        drop(stream);
        execute(self.engine.clone(), run, workflow, sink).await;
        self.store()
            .get_run(&run_id)
            .await?
            .ok_or_else(|| EngineError::Workflow(format!("run {} disappeared", run_id)))
    }

    async fn prepare_run(
        &self,
        user_id: &str,
        workflow_id: &str,
        input: String,
    ) -> Result<(WorkflowRun, Workflow), EngineError> {
        let workflow = self
            .store()
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("workflow {}", workflow_id)))?;
        if workflow.owner_id != user_id {
            return Err(EngineError::Authorization(
                "workflow does not belong to caller".into(),
            ));
        }
        if !workflow.is_active {
            return Err(EngineError::NotFound(format!("workflow {}", workflow_id)));
        }
        if workflow.steps.is_empty() {
            return Err(EngineError::Validation("workflow has no steps".into()));
        }
        validate_acyclic(&workflow.steps).map_err(EngineError::Validation)?;

        let mut steps = workflow.steps.clone();
        steps.sort_by_key(|s| s.order);

        let mut snapshot = Vec::with_capacity(steps.len());
        for (i, step) in steps.iter().enumerate() {
            let agent_name = match (step.node_type, &step.agent_id) {
                (NodeKind::Agent, Some(agent_id)) => self
                    .store()
                    .get_agent(agent_id)
                    .await
                    .ok()
                    .flatten()
                    .map(|a| a.name)
                    .unwrap_or_else(|| "Unknown".to_string()),
                _ => step.node_type.display_name().to_string(),
            };
            snapshot.push(StepResult {
                node_id: step.id.clone(),
                order: i as u32 + 1,
                node_type: step.node_type,
                agent_id: step.agent_id.clone(),
                agent_name,
                task: step.task.clone(),
                status: "pending".into(),
                output: None,
                error: None,
                started_at: None,
                completed_at: None,
            });
        }

        let run = WorkflowRun {
            id: new_id(),
            workflow_id: workflow.id.clone(),
            owner_id: user_id.to_string(),
            session_id: None,
            status: RunStatus::Running,
            steps: snapshot,
            input,
            final_output: None,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
        };
        self.store().put_run(&run).await?;
        Ok((run, workflow))
    }
}

async fn execute(engine: Arc<StreamEngine>, run: WorkflowRun, workflow: Workflow, sink: EventSink) {
    let mut steps = workflow.steps.clone();
    steps.sort_by_key(|s| s.order);

    sink.emit(StreamEvent::WorkflowStart {
        run_id: run.id.clone(),
        workflow_name: workflow.name.clone(),
        total_steps: steps.len(),
    })
    .await;

    let result = if is_dag(&steps) {
        execute_dag(&engine, run.clone(), &steps, &sink).await
    } else {
        execute_sequential(&engine, run.clone(), &steps, &sink).await
    };

    match result {
        Ok(_) => {
            sink.emit(StreamEvent::Done).await;
        }
        Err(error) => {
            let store = engine.store();
            if let Ok(Some(mut row)) = store.get_run(&run.id).await {
                row.status = RunStatus::Failed;
                row.error = Some(error.clone());
                row.completed_at = Some(Utc::now());
                let _ = store.put_run(&row).await;
            }
            sink.emit(StreamEvent::WorkflowError {
                run_id: run.id.clone(),
                error,
            })
            .await;
        }
    }
}

/// Sequential mode: steps run by order; each output is the next input; only
/// the final step streams.
async fn execute_sequential(
    engine: &Arc<StreamEngine>,
    mut run: WorkflowRun,
    steps: &[WorkflowStep],
    sink: &EventSink,
) -> Result<(), String> {
    let store = engine.store().clone();
    let mut trace = TraceRecorder::for_run(store.clone(), &run.id);
    let mut previous_output = run.input.clone();

    for (i, step) in steps.iter().enumerate() {
        let node_id = step
            .id
            .clone()
            .unwrap_or_else(|| format!("step-{}", i + 1));
        let is_last = i == steps.len() - 1;

        let agent_id = step
            .agent_id
            .clone()
            .ok_or_else(|| format!("step {} has no agent", i + 1))?;
        let resources = engine
            .load_agent_resources(&agent_id)
            .await
            .map_err(|e| e.to_string())?;

        run.steps[i].status = "running".into();
        run.steps[i].started_at = Some(Utc::now());
        let _ = store.put_run(&run).await;

        sink.emit(StreamEvent::NodeStart {
            node_id: node_id.clone(),
            agent_id: Some(resources.agent.id.clone()),
            agent_name: Some(resources.agent.name.clone()),
            task: Some(step.task.clone()),
        })
        .await;

        let node_input = format!("Task: {}\n\nInput:\n{}", step.task, previous_output);
        let node_started = Instant::now();
        let output = run_agent_node(
            engine,
            &resources,
            &run.owner_id,
            node_input.clone(),
            is_last.then(|| (node_id.clone(), sink.clone())),
        )
        .await;

        match output {
            Ok(output) => {
                trace
                    .record_workflow_step(
                        &resources.agent.name,
                        &node_input,
                        &output,
                        node_started.elapsed().as_millis() as u64,
                        "success",
                    )
                    .await;
                run.steps[i].status = "completed".into();
                run.steps[i].output = Some(output.clone());
                run.steps[i].completed_at = Some(Utc::now());
                let _ = store.put_run(&run).await;
                sink.emit(StreamEvent::NodeComplete {
                    node_id,
                    output: output.clone(),
                })
                .await;
                previous_output = output;
            }
            Err(error) => {
                trace
                    .record_workflow_step(
                        &resources.agent.name,
                        &node_input,
                        &error,
                        node_started.elapsed().as_millis() as u64,
                        "failed",
                    )
                    .await;
                run.steps[i].status = "failed".into();
                run.steps[i].error = Some(error.clone());
                run.steps[i].completed_at = Some(Utc::now());
                let _ = store.put_run(&run).await;
                sink.emit(StreamEvent::NodeError {
                    node_id,
                    error: error.clone(),
                })
                .await;
                return Err(error);
            }
        }
    }

    run.status = RunStatus::Completed;
    run.final_output = Some(previous_output.clone());
    run.completed_at = Some(Utc::now());
    let _ = store.put_run(&run).await;
    sink.emit(StreamEvent::WorkflowComplete {
        run_id: run.id.clone(),
        final_output: previous_output,
    })
    .await;
    Ok(())
}

/// DAG mode: ready-set loop with concurrent agent nodes and inline
/// start/end/condition nodes.
async fn execute_dag(
    engine: &Arc<StreamEngine>,
    mut run: WorkflowRun,
    steps: &[WorkflowStep],
    sink: &EventSink,
) -> Result<(), String> {
    let store = engine.store().clone();
    let mut trace = TraceRecorder::for_run(store.clone(), &run.id);
    let user_input = run.input.clone();

    let node_map: HashMap<String, &WorkflowStep> = steps
        .iter()
        .filter_map(|s| s.id.clone().map(|id| (id, s)))
        .collect();
    let all_ids: HashSet<String> = node_map.keys().cloned().collect();
    let index_of: HashMap<String, usize> = steps
        .iter()
        .enumerate()
        .filter_map(|(i, s)| s.id.clone().map(|id| (id, i)))
        .collect();

    let mut outputs: HashMap<String, String> = HashMap::new();
    let mut condition_outputs: HashMap<String, String> = HashMap::new();
    let mut completed: HashSet<String> = HashSet::new();
    let mut failed: HashSet<String> = HashSet::new();
    let mut skipped: HashSet<String> = HashSet::new();
    let mut in_flight: HashSet<String> = HashSet::new();
    let mut tasks: JoinSet<(String, Result<String, String>, String, u128)> = JoinSet::new();

    // A dependency is satisfied once completed or skipped: a node below a
    // non-taken branch must not block its join point (the end node still
    // fires with only the taken branch's output).
    let node_ready = |node_id: &str,
                      completed: &HashSet<String>,
                      skipped: &HashSet<String>,
                      condition_outputs: &HashMap<String, String>|
     -> bool {
        let Some(step) = node_map.get(node_id) else {
            return false;
        };
        for dep in &step.depends_on {
            if !node_map.contains_key(dep) {
                continue;
            }
            if !completed.contains(dep) && !skipped.contains(dep) {
                return false;
            }
            if let (Some(branch), Some(chosen)) =
                (&step.input_branch, condition_outputs.get(dep))
            {
                if branch != chosen {
                    return false;
                }
            }
        }
        true
    };

    loop {
        // Compute the ready set: deps done, not started, not gated away.
        let ready: Vec<String> = all_ids
            .iter()
            .filter(|id| {
                !completed.contains(*id)
                    && !failed.contains(*id)
                    && !skipped.contains(*id)
                    && !in_flight.contains(*id)
            })
            .filter(|id| node_ready(id, &completed, &skipped, &condition_outputs))
            .cloned()
            .collect();

        let mut progressed = false;
        for node_id in ready {
            if !failed.is_empty() {
                break; // a failed node terminates the run; stop launching work
            }
            let step = node_map[&node_id];
            match step.node_type {
                NodeKind::Start => {
                    let default_input = step
                        .config
                        .as_ref()
                        .and_then(|c| c.get("default_input"))
                        .and_then(|v| v.as_str())
                        .filter(|s| !s.is_empty())
                        .map(str::to_string);
                    let out = default_input.unwrap_or_else(|| user_input.clone());
                    complete_node(
                        &node_id, &out, &mut run, &index_of, &mut completed, &mut outputs, sink,
                        &store,
                    )
                    .await;
                    progressed = true;
                }
                NodeKind::End => {
                    let upstream: Vec<String> = step
                        .depends_on
                        .iter()
                        .filter_map(|dep| outputs.get(dep).cloned())
                        .filter(|s| !s.is_empty())
                        .collect();
                    let out = upstream.join("\n\n");
                    complete_node(
                        &node_id, &out, &mut run, &index_of, &mut completed, &mut outputs, sink,
                        &store,
                    )
                    .await;
                    progressed = true;
                }
                NodeKind::Condition => {
                    let upstream: Vec<String> = step
                        .depends_on
                        .iter()
                        .filter_map(|dep| outputs.get(dep).cloned())
                        .collect();
                    let branches = step
                        .condition
                        .as_ref()
                        .map(|c| c.branches.clone())
                        .unwrap_or_default();
                    let prompt = step
                        .condition
                        .as_ref()
                        .and_then(|c| c.condition_prompt.clone())
                        .unwrap_or_else(|| step.task.clone());
                    let chosen = evaluate_condition(
                        engine, steps, &upstream, &user_input, &branches, &prompt,
                    )
                    .await?;
                    condition_outputs.insert(node_id.clone(), chosen.clone());

                    // Non-taken branches downstream of this condition skip.
                    for (other_id, other) in &node_map {
                        if completed.contains(other_id)
                            || skipped.contains(other_id)
                            || in_flight.contains(other_id)
                        {
                            continue;
                        }
                        if let Some(branch) = &other.input_branch {
                            if other.depends_on.contains(&node_id) && branch != &chosen {
                                skipped.insert(other_id.clone());
                                if let Some(&idx) = index_of.get(other_id) {
                                    run.steps[idx].status = "skipped".into();
                                }
                            }
                        }
                    }
                    complete_node(
                        &node_id, &chosen, &mut run, &index_of, &mut completed, &mut outputs,
                        sink, &store,
                    )
                    .await;
                    progressed = true;
                }
                NodeKind::Agent => {
                    let Some(agent_id) = step.agent_id.clone() else {
                        failed.insert(node_id.clone());
                        mark_failed(&node_id, "node has no agent", &mut run, &index_of, sink, &store)
                            .await;
                        continue;
                    };
                    let resources = match engine.load_agent_resources(&agent_id).await {
                        Ok(r) => r,
                        Err(e) => {
                            failed.insert(node_id.clone());
                            mark_failed(&node_id, &e.to_string(), &mut run, &index_of, sink, &store)
                                .await;
                            continue;
                        }
                    };

                    let upstream: Vec<(String, String)> = step
                        .depends_on
                        .iter()
                        .filter_map(|dep| outputs.get(dep).map(|o| (dep.clone(), o.clone())))
                        .collect();
                    let node_input = format_dag_input(&step.task, &upstream, &user_input);

                    if let Some(&idx) = index_of.get(&node_id) {
                        run.steps[idx].status = "running".into();
                        run.steps[idx].started_at = Some(Utc::now());
                    }
                    let _ = store.put_run(&run).await;
                    sink.emit(StreamEvent::NodeStart {
                        node_id: node_id.clone(),
                        agent_id: Some(resources.agent.id.clone()),
                        agent_name: Some(resources.agent.name.clone()),
                        task: Some(step.task.clone()),
                    })
                    .await;

                    // Terminal nodes stream deltas; inner nodes run blocking.
                    let terminal = sink_ids(steps, &skipped).contains(&node_id.as_str());
                    let engine = engine.clone();
                    let owner = run.owner_id.clone();
                    let sink_clone = terminal.then(|| (node_id.clone(), sink.clone()));
                    let spawn_id = node_id.clone();
                    in_flight.insert(node_id.clone());
                    tasks.spawn(async move {
                        let started = Instant::now();
                        let result =
                            run_agent_node(&engine, &resources, &owner, node_input.clone(), sink_clone)
                                .await;
                        (
                            spawn_id,
                            result,
                            node_input,
                            started.elapsed().as_millis(),
                        )
                    });
                    progressed = true;
                }
            }
        }

        let finished = completed.len() + failed.len() + skipped.len();
        if finished == all_ids.len() && in_flight.is_empty() {
            break;
        }
        if !in_flight.is_empty() {
            // First-completed-wins: consume one finished node, then recompute
            // the ready set.
            if let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((node_id, result, node_input, elapsed_ms)) => {
                        in_flight.remove(&node_id);
                        let agent_name = index_of
                            .get(&node_id)
                            .map(|&i| run.steps[i].agent_name.clone())
                            .unwrap_or_default();
                        match result {
                            Ok(output) => {
                                trace
                                    .record_workflow_step(
                                        &agent_name,
                                        &node_input,
                                        &output,
                                        elapsed_ms as u64,
                                        "success",
                                    )
                                    .await;
                                complete_node(
                                    &node_id, &output, &mut run, &index_of, &mut completed,
                                    &mut outputs, sink, &store,
                                )
                                .await;
                            }
                            Err(error) => {
                                trace
                                    .record_workflow_step(
                                        &agent_name,
                                        &node_input,
                                        &error,
                                        elapsed_ms as u64,
                                        "failed",
                                    )
                                    .await;
                                failed.insert(node_id.clone());
                                mark_failed(&node_id, &error, &mut run, &index_of, sink, &store)
                                    .await;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "workflow node task panicked");
                    }
                }
            }
            continue;
        }
        if !progressed {
            break; // deadlock guard: nothing running, nothing ready
        }
        if !failed.is_empty() {
            break;
        }
    }

    if !failed.is_empty() {
        return Err("One or more nodes failed".into());
    }

    let sinks = sink_ids(steps, &skipped);
    let final_output: Vec<String> = sinks
        .iter()
        .filter_map(|id| outputs.get(*id).cloned())
        .filter(|o| !o.is_empty())
        .collect();
    let final_output = final_output.join("\n\n");

    run.status = RunStatus::Completed;
    run.final_output = Some(final_output.clone());
    run.completed_at = Some(Utc::now());
    let _ = store.put_run(&run).await;
    sink.emit(StreamEvent::WorkflowComplete {
        run_id: run.id.clone(),
        final_output,
    })
    .await;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn complete_node(
    node_id: &str,
    output: &str,
    run: &mut WorkflowRun,
    index_of: &HashMap<String, usize>,
    completed: &mut HashSet<String>,
    outputs: &mut HashMap<String, String>,
    sink: &EventSink,
    store: &Arc<SqliteStore>,
) {
    completed.insert(node_id.to_string());
    outputs.insert(node_id.to_string(), output.to_string());
    if let Some(&idx) = index_of.get(node_id) {
        run.steps[idx].status = "completed".into();
        run.steps[idx].output = Some(output.to_string());
        if run.steps[idx].started_at.is_none() {
            run.steps[idx].started_at = Some(Utc::now());
        }
        run.steps[idx].completed_at = Some(Utc::now());
    }
    let _ = store.put_run(run).await;
    sink.emit(StreamEvent::NodeComplete {
        node_id: node_id.to_string(),
        output: output.to_string(),
    })
    .await;
}

async fn mark_failed(
    node_id: &str,
    error: &str,
    run: &mut WorkflowRun,
    index_of: &HashMap<String, usize>,
    sink: &EventSink,
    store: &Arc<SqliteStore>,
) {
    if let Some(&idx) = index_of.get(node_id) {
        run.steps[idx].status = "failed".into();
        run.steps[idx].error = Some(error.to_string());
        run.steps[idx].completed_at = Some(Utc::now());
    }
    let _ = store.put_run(run).await;
    sink.emit(StreamEvent::NodeError {
        node_id: node_id.to_string(),
        error: error.to_string(),
    })
    .await;
}

/// Builds the user message for a DAG agent node.
fn format_dag_input(task: &str, upstream: &[(String, String)], user_input: &str) -> String {
    if upstream.is_empty() {
        return format!("Task: {}\n\nInput:\n{}", task, user_input);
    }
    let sections: Vec<String> = upstream
        .iter()
        .map(|(id, out)| format!("Output from step '{}':\n{}", id, out))
        .collect();
    format!("Task: {}\n\nUpstream context:\n{}", task, sections.join("\n\n"))
}

/// One agent node: full tool loop. With a `(node_id, sink)` pair the node
/// streams `node_content_delta`s; otherwise it runs blocking.
async fn run_agent_node(
    engine: &Arc<StreamEngine>,
    resources: &AgentResources,
    owner_id: &str,
    node_input: String,
    streaming: Option<(String, EventSink)>,
) -> Result<String, String> {
    let settings = engine.settings().clone();
    let toolbox = McpToolbox::connect(&resources.mcp_servers, settings.mcp_call_timeout).await;
    let mut tools = resources.tools.clone();
    tools.extend(toolbox.tool_schemas());
    let messages = vec![ChatMessage::user(node_input)];
    let system_prompt = if resources.agent.system_prompt.is_empty() {
        None
    } else {
        Some(resources.agent.system_prompt.as_str())
    };

    match streaming {
        None => {
            run_blocking_loop(
                &resources.provider,
                messages,
                system_prompt,
                &tools,
                &toolbox,
                engine.executor(),
                owner_id,
                settings.max_tool_rounds,
            )
            .await
        }
        Some((node_id, sink)) => {
            stream_node(
                engine,
                &resources.provider,
                messages,
                system_prompt,
                &tools,
                &toolbox,
                owner_id,
                settings.max_tool_rounds,
                &node_id,
                &sink,
            )
            .await
        }
    }
}

/// Streaming node loop: content deltas out, tool results fed back, no gates.
#[allow(clippy::too_many_arguments)]
async fn stream_node(
    engine: &Arc<StreamEngine>,
    provider: &Arc<dyn ChatProvider>,
    mut messages: Vec<ChatMessage>,
    system_prompt: Option<&str>,
    tools: &[crate::provider::ToolSchema],
    toolbox: &McpToolbox,
    owner_id: &str,
    max_rounds: u32,
    node_id: &str,
    sink: &EventSink,
) -> Result<String, String> {
    let mut content = String::new();
    for round in 0..=max_rounds {
        let mut collected = Vec::new();
        content.clear();
        let mut stream = provider.stream_chat(&messages, system_prompt, tools).await;
        while let Some(chunk) = stream.next().await {
            match chunk {
                StreamChunk::Content(text) => {
                    content.push_str(&text);
                    sink.emit(StreamEvent::NodeContentDelta {
                        node_id: node_id.to_string(),
                        content: text,
                    })
                    .await;
                }
                StreamChunk::ToolCall(tc) => collected.push(tc),
                StreamChunk::Done(_) => break,
                StreamChunk::Error(e) => return Err(e),
                StreamChunk::Reasoning(_) => {}
            }
        }
        if collected.is_empty() || round == max_rounds {
            break;
        }
        messages.push(ChatMessage::assistant(""));
        for tc in collected {
            let result = if is_mcp_name(&tc.name) {
                toolbox.call(&tc.name, tc.arguments_value()).await
            } else {
                engine
                    .executor()
                    .execute(owner_id, &tc.name, &tc.arguments)
                    .await
            };
            messages.push(ChatMessage::user(format!(
                "[Tool '{}' returned: {}]\n\n{}",
                tc.name, result, TOOL_RESULT_PROMPT
            )));
        }
    }
    Ok(content)
}

/// Classifies upstream content into one of the configured branch labels via
/// an LLM call on the first agent node's provider; defaults to the first
/// branch when no provider or no match is available.
async fn evaluate_condition(
    engine: &Arc<StreamEngine>,
    steps: &[WorkflowStep],
    upstream: &[String],
    user_input: &str,
    branches: &[String],
    prompt: &str,
) -> Result<String, String> {
    let Some(first) = branches.first() else {
        return Ok(String::new());
    };

    let provider = {
        let mut found = None;
        for step in steps {
            if step.node_type == NodeKind::Agent {
                if let Some(agent_id) = &step.agent_id {
                    if let Ok(resources) = engine.load_agent_resources(agent_id).await {
                        found = Some(resources.provider);
                        break;
                    }
                }
            }
        }
        found
    };
    let Some(provider) = provider else {
        return Ok(first.clone());
    };

    let branch_list = branches
        .iter()
        .map(|b| format!("\"{}\"", b))
        .collect::<Vec<_>>()
        .join(", ");
    let system = condition_prompt(&branch_list);
    let context = if upstream.is_empty() {
        user_input.to_string()
    } else {
        upstream.join("\n\n")
    };
    let prompt = if prompt.is_empty() {
        format!(
            "Based on the content, choose the most appropriate branch from: {}. Reply with only the branch name.",
            branch_list
        )
    } else {
        prompt.to_string()
    };
    let context_capped: String = context.chars().take(4000).collect();
    let user_msg = format!("{}\n\nContent:\n{}", prompt, context_capped);

    let response = provider
        .chat(&[ChatMessage::user(user_msg)], Some(&system), &[])
        .await
        .map_err(|e| format!("Condition LLM error: {}", e))?;

    let chosen = response
        .content
        .trim()
        .trim_matches(|c| c == '"' || c == '\'')
        .to_lowercase();
    for b in branches {
        if b.to_lowercase() == chosen {
            return Ok(b.clone());
        }
    }
    for b in branches {
        let bl = b.to_lowercase();
        if !chosen.is_empty() && (bl.contains(&chosen) || chosen.contains(&bl)) {
            return Ok(b.clone());
        }
    }
    warn!(chosen = %chosen, "condition reply matched no branch; defaulting to first");
    Ok(first.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: DAG input labels upstream outputs by node id.
    #[test]
    fn dag_input_formats() {
        assert_eq!(
            format_dag_input("analyze", &[], "raw"),
            "Task: analyze\n\nInput:\nraw"
        );
        let with_upstream = format_dag_input(
            "analyze",
            &[("fetch".into(), "data".into())],
            "raw",
        );
        assert!(with_upstream.contains("Output from step 'fetch':\ndata"));
        assert!(!with_upstream.contains("raw"));
    }
}
