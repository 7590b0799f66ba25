//! Compiles a job's step tree into an executable plan.
//!
//! Compilation is pure: the same job compiled against the same resolved
//! versions always yields an identical plan, ids included. The root is `0`
//! and the i-th child of `p` is `p.i`; hook steps put the primary step at
//! `p.0` and the hook at `p.1`, and retry attempt k lives at `p.k`.

use conveyor_core::Error;
use conveyor_core::ids::{PipelineId, PlanId};
use conveyor_core::pipeline::{
    GetStep, HookStep, JobConfig, MAX_RETRY_ATTEMPTS, PipelineConfig, PutStep, StepConfig,
    TaskConfig, TaskStep, VersionPolicy,
};
use conveyor_core::plan::{GetPlan, HookPlan, ImageSpec, Plan, PlanStep, PutPlan, TaskPlan};
use conveyor_core::version::{ResourceVersion, ScopeSpec, Version};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CompileError {
    #[error("unknown resource {0}")]
    UnknownResource(String),

    #[error("no version resolved for input {0}")]
    UnresolvedInput(String),

    #[error("resource type {0} has no version")]
    MissingTypeVersion(String),

    #[error("step {0} uses a resource, which one-off builds cannot")]
    ResourceInOneOff(String),

    #[error("retry of {attempts} attempts exceeds the limit of {max}", max = MAX_RETRY_ATTEMPTS)]
    TooManyAttempts { attempts: u32 },
}

impl From<CompileError> for Error {
    fn from(e: CompileError) -> Self {
        Error::Compile(e.to_string())
    }
}

/// A job input with its effective version policy.
#[derive(Debug, Clone, PartialEq)]
pub struct JobInput {
    pub name: String,
    pub resource: String,
    pub passed: Vec<String>,
    pub trigger: bool,
    /// A step pin wins over a resource config pin, which wins over the
    /// step's own latest/every policy.
    pub policy: VersionPolicy,
}

/// Inputs of a job, one per distinct get step name.
pub fn job_inputs(config: &PipelineConfig, job: &JobConfig) -> Vec<JobInput> {
    job.inputs()
        .into_iter()
        .map(|get| {
            let config_pin = config
                .resource(get.resource())
                .and_then(|r| r.version.clone());
            let policy = match (&get.version, config_pin) {
                (VersionPolicy::Pinned(v), _) => VersionPolicy::Pinned(v.clone()),
                (_, Some(pin)) => VersionPolicy::Pinned(pin),
                (policy, None) => policy.clone(),
            };
            JobInput {
                name: get.name.clone(),
                resource: get.resource().to_string(),
                passed: get.passed.clone(),
                trigger: get.trigger,
                policy,
            }
        })
        .collect()
}

/// Resolved data a job compiles against.
#[derive(Debug, Clone, Copy)]
pub struct CompileInputs<'a> {
    pub pipeline_id: PipelineId,
    pub config: &'a PipelineConfig,
    /// Chosen version per input name.
    pub versions: &'a BTreeMap<String, ResourceVersion>,
    /// Latest version of each custom resource type.
    pub type_versions: &'a BTreeMap<String, Version>,
}

pub fn compile_job(job: &JobConfig, inputs: &CompileInputs<'_>) -> Result<Plan, CompileError> {
    let compiler = Compiler {
        inputs: Some(inputs),
        cache_scope: Some(format!("{}/{}", inputs.pipeline_id, job.name)),
    };
    compiler.compile(&job_step_tree(job), PlanId::root())
}

/// Compile a pipeline-less step tree. Only task-based trees are allowed.
pub fn compile_one_off(steps: &[StepConfig]) -> Result<Plan, CompileError> {
    let compiler = Compiler {
        inputs: None,
        cache_scope: None,
    };
    compiler.compile(&StepConfig::Do(steps.to_vec()), PlanId::root())
}

/// The job plan wrapped in its job-level hooks, `ensure` outermost.
fn job_step_tree(job: &JobConfig) -> StepConfig {
    let hooks: [(&Option<Box<StepConfig>>, fn(HookStep) -> StepConfig); 5] = [
        (&job.on_abort, StepConfig::OnAbort),
        (&job.on_error, StepConfig::OnError),
        (&job.on_failure, StepConfig::OnFailure),
        (&job.on_success, StepConfig::OnSuccess),
        (&job.ensure, StepConfig::Ensure),
    ];

    let mut tree = StepConfig::Do(job.plan.clone());
    for (hook, wrap) in hooks {
        if let Some(hook) = hook {
            tree = wrap(HookStep {
                step: Box::new(tree),
                hook: hook.clone(),
            });
        }
    }
    tree
}

struct Compiler<'a> {
    inputs: Option<&'a CompileInputs<'a>>,
    cache_scope: Option<String>,
}

impl Compiler<'_> {
    fn compile(&self, step: &StepConfig, id: PlanId) -> Result<Plan, CompileError> {
        let compiled = match step {
            StepConfig::Get(get) => PlanStep::Get(self.get(get)?),
            StepConfig::Put(put) => PlanStep::Put(self.put(put)?),
            StepConfig::Task(task) => PlanStep::Task(self.task(task)),
            StepConfig::Do(steps) => PlanStep::Do(self.children(steps, &id)?),
            StepConfig::InParallel(p) => PlanStep::InParallel {
                steps: self.children(&p.steps, &id)?,
                limit: p.limit,
                fail_fast: p.fail_fast,
            },
            StepConfig::Aggregate(steps) => PlanStep::Aggregate(self.children(steps, &id)?),
            StepConfig::OnSuccess(h) => PlanStep::OnSuccess(self.hook(h, &id)?),
            StepConfig::OnFailure(h) => PlanStep::OnFailure(self.hook(h, &id)?),
            StepConfig::OnError(h) => PlanStep::OnError(self.hook(h, &id)?),
            StepConfig::OnAbort(h) => PlanStep::OnAbort(self.hook(h, &id)?),
            StepConfig::Ensure(h) => PlanStep::Ensure(self.hook(h, &id)?),
            StepConfig::Try(step) => PlanStep::Try(Box::new(self.compile(step, id.child(0))?)),
            StepConfig::Timeout(t) => PlanStep::Timeout {
                step: Box::new(self.compile(&t.step, id.child(0))?),
                duration_secs: t.duration_secs,
            },
            StepConfig::Retry(r) if r.attempts > MAX_RETRY_ATTEMPTS => {
                return Err(CompileError::TooManyAttempts {
                    attempts: r.attempts,
                });
            }
            StepConfig::Retry(r) => PlanStep::Retry(
                (0..r.attempts.max(1) as usize)
                    .map(|k| self.compile(&r.step, id.child(k)))
                    .collect::<Result<_, _>>()?,
            ),
        };
        Ok(Plan::new(id, compiled))
    }

    fn children(&self, steps: &[StepConfig], parent: &PlanId) -> Result<Vec<Plan>, CompileError> {
        steps
            .iter()
            .enumerate()
            .map(|(i, step)| self.compile(step, parent.child(i)))
            .collect()
    }

    fn hook(&self, hook: &HookStep, id: &PlanId) -> Result<HookPlan, CompileError> {
        Ok(HookPlan {
            step: Box::new(self.compile(&hook.step, id.child(0))?),
            hook: Box::new(self.compile(&hook.hook, id.child(1))?),
        })
    }

    fn resolved(&self, step: &str) -> Result<&CompileInputs<'_>, CompileError> {
        self.inputs
            .ok_or_else(|| CompileError::ResourceInOneOff(step.to_string()))
    }

    fn get(&self, get: &GetStep) -> Result<GetPlan, CompileError> {
        let inputs = self.resolved(&get.name)?;
        let resource = inputs
            .config
            .resource(get.resource())
            .ok_or_else(|| CompileError::UnknownResource(get.resource().to_string()))?;
        let image = image_for(inputs, &resource.resource_type)?;
        let version = inputs
            .versions
            .get(&get.name)
            .ok_or_else(|| CompileError::UnresolvedInput(get.name.clone()))?;

        Ok(GetPlan {
            name: get.name.clone(),
            resource: resource.name.clone(),
            resource_type: resource.resource_type.clone(),
            source: resource.source.clone(),
            params: get.params.clone(),
            scope_id: version.scope_id.clone(),
            version_id: version.id,
            version: version.version.clone(),
            policy: get.version.clone(),
            image,
            tags: step_tags(&get.tags, &resource.tags),
        })
    }

    fn put(&self, put: &PutStep) -> Result<PutPlan, CompileError> {
        let inputs = self.resolved(&put.name)?;
        let resource = inputs
            .config
            .resource(put.resource())
            .ok_or_else(|| CompileError::UnknownResource(put.resource().to_string()))?;
        let image = image_for(inputs, &resource.resource_type)?;
        let type_version = match &image {
            ImageSpec::CustomType { version, .. } => Some(version.clone()),
            _ => None,
        };

        Ok(PutPlan {
            name: put.name.clone(),
            resource: resource.name.clone(),
            resource_type: resource.resource_type.clone(),
            source: resource.source.clone(),
            params: put.params.clone(),
            inputs: put.inputs.clone(),
            scope: ScopeSpec::new(
                resource.resource_type.clone(),
                resource.source.clone(),
                type_version,
            ),
            image,
            tags: step_tags(&put.tags, &resource.tags),
        })
    }

    fn task(&self, task: &TaskStep) -> TaskPlan {
        let mut params = task.config.params.clone();
        params.extend(task.params.clone());
        TaskPlan {
            name: task.name.clone(),
            config: task.config.clone(),
            params,
            image: task_image(&task.config),
            tags: task.tags.clone(),
            cache_scope: self.cache_scope.clone(),
        }
    }
}

fn image_for(inputs: &CompileInputs<'_>, resource_type: &str) -> Result<ImageSpec, CompileError> {
    inputs
        .config
        .image_for(resource_type, inputs.type_versions)
        .ok_or_else(|| CompileError::MissingTypeVersion(resource_type.to_string()))
}

fn task_image(config: &TaskConfig) -> ImageSpec {
    match &config.image_resource {
        Some(image) => ImageSpec::ImageResource {
            resource_type: image.resource_type.clone(),
            source: image.source.clone(),
            version: image.version.clone(),
        },
        None => ImageSpec::Rootfs {
            uri: config.rootfs_uri.clone(),
        },
    }
}

/// Step tags, falling back to the resource's.
fn step_tags(step: &[String], resource: &[String]) -> Vec<String> {
    if step.is_empty() {
        resource.to_vec()
    } else {
        step.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use conveyor_core::ids::{ScopeId, VersionId};
    use conveyor_core::pipeline::{
        InParallelStep, ResourceConfig, ResourceTypeConfig, RetryStep, TaskRun,
    };
    use conveyor_core::version::Source;
    use pretty_assertions::assert_eq;

    fn version(r: &str) -> Version {
        Version::from([("ref".to_string(), r.to_string())])
    }

    fn row(scope: &str, r: &str) -> ResourceVersion {
        ResourceVersion {
            id: VersionId::new(),
            scope_id: ScopeId::new(scope),
            version: version(r),
            digest: r.to_string(),
            metadata: vec![],
            check_order: 1,
            enabled: true,
            created_at: Utc::now(),
        }
    }

    fn resource(name: &str, resource_type: &str) -> ResourceConfig {
        ResourceConfig {
            name: name.to_string(),
            resource_type: resource_type.to_string(),
            source: Source::new(),
            check_every_secs: None,
            version: None,
            tags: vec!["internal".to_string()],
        }
    }

    fn task(name: &str) -> StepConfig {
        StepConfig::Task(TaskStep {
            name: name.to_string(),
            config: TaskConfig::new(TaskRun::new("make", vec!["test".to_string()])),
            params: BTreeMap::new(),
            tags: vec![],
        })
    }

    fn pipeline() -> PipelineConfig {
        let job = JobConfig::new(
            "unit",
            vec![
                StepConfig::InParallel(InParallelStep {
                    steps: vec![
                        StepConfig::Get(GetStep::new("repo")),
                        StepConfig::Get(GetStep::new("notify")),
                    ],
                    limit: Some(1),
                    fail_fast: false,
                }),
                StepConfig::OnFailure(HookStep {
                    step: Box::new(StepConfig::Retry(RetryStep {
                        step: Box::new(task("test")),
                        attempts: 3,
                    })),
                    hook: Box::new(StepConfig::Put(PutStep::new("notify"))),
                }),
            ],
        );
        PipelineConfig {
            jobs: vec![job],
            resources: vec![resource("repo", "git"), resource("notify", "slack")],
            resource_types: vec![ResourceTypeConfig {
                name: "slack".to_string(),
                resource_type: "registry-image".to_string(),
                source: Source::new(),
                check_every_secs: None,
                tags: vec![],
            }],
        }
    }

    #[test]
    fn test_compile_is_deterministic_with_positional_ids() {
        let config = pipeline();
        let versions = BTreeMap::from([
            ("repo".to_string(), row("s1", "abc")),
            ("notify".to_string(), row("s2", "n1")),
        ]);
        let type_versions = BTreeMap::from([("slack".to_string(), version("img"))]);
        let inputs = CompileInputs {
            pipeline_id: PipelineId::new(),
            config: &config,
            versions: &versions,
            type_versions: &type_versions,
        };

        let first = compile_job(&config.jobs[0], &inputs).unwrap();
        let second = compile_job(&config.jobs[0], &inputs).unwrap();
        assert_eq!(first, second);

        let ids: Vec<String> = first.walk().iter().map(|p| p.id.to_string()).collect();
        assert_eq!(
            ids,
            vec![
                "0", "0.0", "0.0.0", "0.0.1", "0.1", "0.1.0", "0.1.0.0", "0.1.0.1", "0.1.0.2",
                "0.1.1"
            ]
        );

        let Some(Plan {
            step: PlanStep::Get(get),
            ..
        }) = first.find(&PlanId::new("0.0.0"))
        else {
            panic!("expected get at 0.0.0");
        };
        assert_eq!(get.version, version("abc"));
        assert_eq!(get.version_id, versions["repo"].id);
        assert_eq!(get.tags, vec!["internal".to_string()]);

        let Some(Plan {
            step: PlanStep::Put(put),
            ..
        }) = first.find(&PlanId::new("0.1.1"))
        else {
            panic!("expected put at 0.1.1");
        };
        assert_eq!(put.scope.type_version, Some(version("img")));
        assert_eq!(put.image.base_type(), Some("registry-image"));
    }

    #[test]
    fn test_unresolved_input_and_missing_type_version() {
        let config = pipeline();
        let versions = BTreeMap::from([("repo".to_string(), row("s1", "abc"))]);
        let type_versions = BTreeMap::new();
        let inputs = CompileInputs {
            pipeline_id: PipelineId::new(),
            config: &config,
            versions: &versions,
            type_versions: &type_versions,
        };
        assert_eq!(
            compile_job(&config.jobs[0], &inputs).unwrap_err(),
            CompileError::MissingTypeVersion("slack".to_string())
        );

        let type_versions = BTreeMap::from([("slack".to_string(), version("img"))]);
        let inputs = CompileInputs {
            type_versions: &type_versions,
            ..inputs
        };
        assert_eq!(
            compile_job(&config.jobs[0], &inputs).unwrap_err(),
            CompileError::UnresolvedInput("notify".to_string())
        );
    }

    #[test]
    fn test_job_hooks_wrap_plan() {
        let mut job = JobConfig::new("deploy", vec![task("ship")]);
        job.on_success = Some(Box::new(task("announce")));
        job.ensure = Some(Box::new(task("cleanup")));
        let config = PipelineConfig {
            jobs: vec![job.clone()],
            ..Default::default()
        };
        let versions = BTreeMap::new();
        let type_versions = BTreeMap::new();
        let pipeline_id = PipelineId::new();
        let plan = compile_job(
            &job,
            &CompileInputs {
                pipeline_id,
                config: &config,
                versions: &versions,
                type_versions: &type_versions,
            },
        )
        .unwrap();

        assert_eq!(plan.kind(), "ensure");
        assert_eq!(plan.find(&PlanId::new("0.0")).unwrap().kind(), "on_success");
        assert_eq!(plan.find(&PlanId::new("0.0.0.0")).unwrap().step_name(), Some("ship"));
        assert_eq!(plan.find(&PlanId::new("0.0.1")).unwrap().step_name(), Some("announce"));
        assert_eq!(plan.find(&PlanId::new("0.1")).unwrap().step_name(), Some("cleanup"));

        let Some(Plan {
            step: PlanStep::Task(ship),
            ..
        }) = plan.find(&PlanId::new("0.0.0.0"))
        else {
            panic!("expected task");
        };
        assert_eq!(
            ship.cache_key("deps"),
            Some(format!("{pipeline_id}/deploy/ship/deps"))
        );
    }

    #[test]
    fn test_one_off_rejects_resources() {
        let plan = compile_one_off(&[task("hello")]).unwrap();
        let Some(Plan {
            step: PlanStep::Task(t),
            ..
        }) = plan.find(&PlanId::new("0.0"))
        else {
            panic!("expected task");
        };
        assert_eq!(t.cache_scope, None);
        assert_eq!(t.image, ImageSpec::Rootfs { uri: None });

        assert_eq!(
            compile_one_off(&[StepConfig::Get(GetStep::new("repo"))]).unwrap_err(),
            CompileError::ResourceInOneOff("repo".to_string())
        );

        let unbounded = StepConfig::Retry(RetryStep {
            step: Box::new(task("hello")),
            attempts: u32::MAX,
        });
        assert_eq!(
            compile_one_off(&[unbounded]).unwrap_err(),
            CompileError::TooManyAttempts { attempts: u32::MAX }
        );
    }

    #[test]
    fn test_job_inputs_pin_precedence() {
        let mut config = pipeline();
        config.resources[0].version = Some(version("config-pin"));

        let mut get = GetStep::new("repo");
        get.version = VersionPolicy::Every;
        let job = JobConfig::new("j", vec![StepConfig::Get(get.clone())]);
        assert_eq!(
            job_inputs(&config, &job)[0].policy,
            VersionPolicy::Pinned(version("config-pin"))
        );

        get.version = VersionPolicy::Pinned(version("step-pin"));
        let job = JobConfig::new("j", vec![StepConfig::Get(get)]);
        assert_eq!(
            job_inputs(&config, &job)[0].policy,
            VersionPolicy::Pinned(version("step-pin"))
        );
    }
}
