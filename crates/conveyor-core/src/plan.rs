//! Compiled, version-resolved execution plans.
//!
//! A [`Plan`] is isomorphic to the job's step tree. Composite nodes are kept
//! as-is; leaf nodes are bound to concrete versions and images.

use crate::ids::{PlanId, ScopeId, VersionId};
use crate::pipeline::{TaskConfig, VersionPolicy};
use crate::version::{Params, ScopeSpec, Source, Version};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub step: PlanStep,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStep {
    Get(GetPlan),
    Put(PutPlan),
    Task(TaskPlan),
    Do(Vec<Plan>),
    InParallel {
        steps: Vec<Plan>,
        limit: Option<usize>,
        fail_fast: bool,
    },
    Aggregate(Vec<Plan>),
    OnSuccess(HookPlan),
    OnFailure(HookPlan),
    OnError(HookPlan),
    OnAbort(HookPlan),
    Ensure(HookPlan),
    Try(Box<Plan>),
    Timeout {
        step: Box<Plan>,
        duration_secs: u64,
    },
    /// One pre-compiled subtree per attempt.
    Retry(Vec<Plan>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookPlan {
    pub step: Box<Plan>,
    pub hook: Box<Plan>,
}

/// A get bound to one concrete version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetPlan {
    pub name: String,
    pub resource: String,
    pub resource_type: String,
    pub source: Source,
    pub params: Params,
    pub scope_id: ScopeId,
    pub version_id: VersionId,
    pub version: Version,
    pub policy: VersionPolicy,
    pub image: ImageSpec,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PutPlan {
    pub name: String,
    pub resource: String,
    pub resource_type: String,
    pub source: Source,
    pub params: Params,
    pub inputs: Option<Vec<String>>,
    /// Scope the produced version is saved into.
    pub scope: ScopeSpec,
    pub image: ImageSpec,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPlan {
    pub name: String,
    pub config: TaskConfig,
    /// Task config params overlaid with step params.
    pub params: BTreeMap<String, String>,
    pub image: ImageSpec,
    pub tags: Vec<String>,
    /// Prefix of task cache keys; `None` disables cache reuse.
    pub cache_scope: Option<String>,
}

impl TaskPlan {
    pub fn cache_key(&self, path: &str) -> Option<String> {
        self.cache_scope
            .as_ref()
            .map(|scope| format!("{scope}/{}/{path}", self.name))
    }
}

/// Where a leaf step's container image comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ImageSpec {
    /// Image shipped with workers for a base resource type.
    BaseType { resource_type: String },
    /// Custom resource type resolved to a concrete version.
    CustomType {
        name: String,
        base_type: String,
        source: Source,
        version: Version,
    },
    /// Task image fetched through a base resource type.
    ImageResource {
        resource_type: String,
        source: Source,
        version: Option<Version>,
    },
    /// Task rootfs provided directly by the worker.
    Rootfs { uri: Option<String> },
}

impl ImageSpec {
    /// The base resource type a worker must support to run this image.
    pub fn base_type(&self) -> Option<&str> {
        match self {
            ImageSpec::BaseType { resource_type } => Some(resource_type),
            ImageSpec::CustomType { base_type, .. } => Some(base_type),
            ImageSpec::ImageResource { resource_type, .. } => Some(resource_type),
            ImageSpec::Rootfs { .. } => None,
        }
    }
}

impl Plan {
    pub fn new(id: PlanId, step: PlanStep) -> Self {
        Self { id, step }
    }

    /// Immediate children in execution order.
    pub fn children(&self) -> Vec<&Plan> {
        match &self.step {
            PlanStep::Get(_) | PlanStep::Put(_) | PlanStep::Task(_) => Vec::new(),
            PlanStep::Do(steps) | PlanStep::Aggregate(steps) | PlanStep::Retry(steps) => {
                steps.iter().collect()
            }
            PlanStep::InParallel { steps, .. } => steps.iter().collect(),
            PlanStep::OnSuccess(h)
            | PlanStep::OnFailure(h)
            | PlanStep::OnError(h)
            | PlanStep::OnAbort(h)
            | PlanStep::Ensure(h) => vec![h.step.as_ref(), h.hook.as_ref()],
            PlanStep::Try(step) => vec![step.as_ref()],
            PlanStep::Timeout { step, .. } => vec![step.as_ref()],
        }
    }

    /// Pre-order traversal of the tree.
    pub fn walk(&self) -> Vec<&Plan> {
        let mut out = vec![self];
        for child in self.children() {
            out.extend(child.walk());
        }
        out
    }

    pub fn find(&self, id: &PlanId) -> Option<&Plan> {
        self.walk().into_iter().find(|p| &p.id == id)
    }

    pub fn is_leaf(&self) -> bool {
        matches!(
            self.step,
            PlanStep::Get(_) | PlanStep::Put(_) | PlanStep::Task(_)
        )
    }

    /// Short name of the step kind, as reported in events.
    pub fn kind(&self) -> &'static str {
        match &self.step {
            PlanStep::Get(_) => "get",
            PlanStep::Put(_) => "put",
            PlanStep::Task(_) => "task",
            PlanStep::Do(_) => "do",
            PlanStep::InParallel { .. } => "in_parallel",
            PlanStep::Aggregate(_) => "aggregate",
            PlanStep::OnSuccess(_) => "on_success",
            PlanStep::OnFailure(_) => "on_failure",
            PlanStep::OnError(_) => "on_error",
            PlanStep::OnAbort(_) => "on_abort",
            PlanStep::Ensure(_) => "ensure",
            PlanStep::Try(_) => "try",
            PlanStep::Timeout { .. } => "timeout",
            PlanStep::Retry(_) => "retry",
        }
    }

    /// Name of a leaf step.
    pub fn step_name(&self) -> Option<&str> {
        match &self.step {
            PlanStep::Get(g) => Some(&g.name),
            PlanStep::Put(p) => Some(&p.name),
            PlanStep::Task(t) => Some(&t.name),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::TaskRun;

    fn task(id: PlanId, name: &str) -> Plan {
        Plan::new(
            id,
            PlanStep::Task(TaskPlan {
                name: name.to_string(),
                config: TaskConfig::new(TaskRun::new("true", vec![])),
                params: BTreeMap::new(),
                image: ImageSpec::Rootfs { uri: None },
                tags: vec![],
                cache_scope: Some("pip/job".to_string()),
            }),
        )
    }

    #[test]
    fn test_walk_is_preorder() {
        let root = PlanId::root();
        let plan = Plan::new(
            root.clone(),
            PlanStep::Do(vec![
                task(root.child(0), "a"),
                Plan::new(
                    root.child(1),
                    PlanStep::Try(Box::new(task(root.child(1).child(0), "b"))),
                ),
            ]),
        );

        let ids: Vec<_> = plan.walk().iter().map(|p| p.id.to_string()).collect();
        assert_eq!(ids, vec!["0", "0.0", "0.1", "0.1.0"]);
        assert_eq!(
            plan.find(&PlanId::new("0.1.0")).and_then(|p| p.step_name()),
            Some("b")
        );
    }

    #[test]
    fn test_task_cache_key() {
        let plan = task(PlanId::root(), "build");
        let PlanStep::Task(t) = &plan.step else {
            panic!("expected task");
        };
        assert_eq!(t.cache_key("deps").as_deref(), Some("pip/job/build/deps"));
    }
}
