//! Workflow definitions, runs, and schedules.
//!
//! A workflow is an ordered step list. When any step carries a stable `id`
//! the workflow runs in DAG mode (`depends_on` edges, parallel firing,
//! condition branches); otherwise steps run sequentially by `order`, each
//! step's output feeding the next step's input.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Node behavior in DAG mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    #[default]
    Agent,
    Start,
    End,
    Condition,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Agent => "agent",
            NodeKind::Start => "start",
            NodeKind::End => "end",
            NodeKind::Condition => "condition",
        }
    }

    /// Display name for non-agent nodes ("Start", "End", "Condition").
    pub fn display_name(&self) -> &'static str {
        match self {
            NodeKind::Agent => "Agent",
            NodeKind::Start => "Start",
            NodeKind::End => "End",
            NodeKind::Condition => "Condition",
        }
    }
}

/// Condition node configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConditionConfig {
    #[serde(default)]
    pub branches: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition_prompt: Option<String>,
}

/// One workflow step.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Stable node id; presence of any id switches the workflow to DAG mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub order: u32,
    pub task: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub node_type: NodeKind,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Gate: run only when the gating condition chose this branch label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<ConditionConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
}

/// A stored workflow definition.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub steps: Vec<WorkflowStep>,
    #[serde(default = "super::workflow::default_true")]
    pub is_active: bool,
}

pub(crate) fn default_true() -> bool {
    true
}

/// True when any step has a stable id (DAG mode).
pub fn is_dag(steps: &[WorkflowStep]) -> bool {
    steps.iter().any(|s| s.id.is_some())
}

/// Validates that step ids form a DAG. Iterative DFS with three-colour
/// marking; `depends_on` entries naming unknown nodes are ignored.
pub fn validate_acyclic(steps: &[WorkflowStep]) -> Result<(), String> {
    #[derive(Clone, Copy, PartialEq)]
    enum Colour {
        White,
        Grey,
        Black,
    }

    let adj: HashMap<&str, &[String]> = steps
        .iter()
        .filter_map(|s| {
            s.id.as_deref()
                .map(|id| (id, s.depends_on.as_slice()))
        })
        .collect();
    let mut colour: HashMap<&str, Colour> = adj.keys().map(|&n| (n, Colour::White)).collect();

    let starts: Vec<&str> = adj.keys().copied().collect();
    for start in starts {
        if colour[start] != Colour::White {
            continue;
        }
        // Stack holds (node, next dependency index) for an explicit DFS.
        let mut stack: Vec<(&str, usize)> = vec![(start, 0)];
        colour.insert(start, Colour::Grey);
        loop {
            let Some(frame) = stack.last_mut() else { break };
            let node = frame.0;
            let next = frame.1;
            frame.1 += 1;

            let deps: &[String] = adj.get(node).copied().unwrap_or(&[]);
            if next >= deps.len() {
                colour.insert(node, Colour::Black);
                stack.pop();
                continue;
            }
            let dep = deps[next].as_str();
            match colour.get(dep).copied() {
                // References a node outside this workflow, or already finished.
                None | Some(Colour::Black) => {}
                Some(Colour::Grey) => {
                    return Err(format!("cycle detected involving node '{}'", dep))
                }
                Some(Colour::White) => {
                    colour.insert(dep, Colour::Grey);
                    stack.push((dep, 0));
                }
            }
        }
    }
    Ok(())
}

/// Sink node ids: nodes nothing depends on, excluding `skipped`.
pub fn sink_ids<'a>(steps: &'a [WorkflowStep], skipped: &HashSet<String>) -> Vec<&'a str> {
    let mut downstream: HashSet<&str> = HashSet::new();
    for s in steps {
        for dep in &s.depends_on {
            downstream.insert(dep.as_str());
        }
    }
    steps
        .iter()
        .filter_map(|s| s.id.as_deref())
        .filter(|id| !downstream.contains(id) && !skipped.contains(*id))
        .collect()
}

/// Run status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

/// Per-step snapshot mirrored into the run row while executing.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub order: u32,
    pub node_type: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub agent_name: String,
    pub task: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// One execution instance of a workflow.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: String,
    pub workflow_id: String,
    pub owner_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub status: RunStatus,
    pub steps: Vec<StepResult>,
    pub input: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Cron-driven workflow trigger.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowSchedule {
    pub id: String,
    pub workflow_id: String,
    pub owner_id: String,
    /// 5-field POSIX cron expression.
    pub cron_expression: String,
    #[serde(default)]
    pub input: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str, deps: &[&str]) -> WorkflowStep {
        WorkflowStep {
            id: Some(id.to_string()),
            order: 0,
            task: String::new(),
            agent_id: None,
            node_type: NodeKind::Agent,
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            input_branch: None,
            condition: None,
            config: None,
        }
    }

    /// **Scenario**: a diamond graph validates; adding a back-edge fails.
    #[test]
    fn validate_acyclic_diamond_and_cycle() {
        let steps = vec![
            step("a", &[]),
            step("b", &["a"]),
            step("c", &["a"]),
            step("d", &["b", "c"]),
        ];
        assert!(validate_acyclic(&steps).is_ok());

        let cyclic = vec![step("a", &["c"]), step("b", &["a"]), step("c", &["b"])];
        let err = validate_acyclic(&cyclic).unwrap_err();
        assert!(err.contains("cycle"), "{}", err);
    }

    /// **Scenario**: a self-loop is a cycle.
    #[test]
    fn validate_acyclic_self_loop() {
        let steps = vec![step("a", &["a"])];
        assert!(validate_acyclic(&steps).is_err());
    }

    /// **Scenario**: dangling depends_on entries are ignored.
    #[test]
    fn validate_acyclic_ignores_unknown_deps() {
        let steps = vec![step("a", &["ghost"]), step("b", &["a"])];
        assert!(validate_acyclic(&steps).is_ok());
    }

    /// **Scenario**: dag mode is keyed off stable ids.
    #[test]
    fn is_dag_requires_an_id() {
        let mut s = step("a", &[]);
        assert!(is_dag(std::slice::from_ref(&s)));
        s.id = None;
        assert!(!is_dag(std::slice::from_ref(&s)));
    }

    /// **Scenario**: sinks are nodes without downstream dependents, minus skipped.
    #[test]
    fn sink_ids_excludes_skipped() {
        let steps = vec![
            step("s", &[]),
            step("p", &["s"]),
            step("n", &["s"]),
            step("e", &["p", "n"]),
        ];
        let mut skipped = HashSet::new();
        assert_eq!(sink_ids(&steps, &skipped), vec!["e"]);
        skipped.insert("e".to_string());
        assert!(sink_ids(&steps, &skipped).is_empty());
    }
}
