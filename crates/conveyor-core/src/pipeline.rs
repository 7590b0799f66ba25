//! Pipeline configuration and persisted pipeline state.
//!
//! A pipeline is an arena of jobs, resources and resource types indexed by
//! name. Steps refer to resources and jobs by name only, so the job/resource
//! graph never forms ownership cycles.

use crate::ids::{PipelineId, VersionId};
use crate::plan::ImageSpec;
use crate::version::{Params, ScopeSpec, Source, Version};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// A saved pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: PipelineId,
    pub team: String,
    pub name: String,
    pub config: PipelineConfig,
    /// Incremented on every save.
    pub config_version: i64,
    pub paused: bool,
    pub archived: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Pipeline {
    /// Whether scheduler and checker contexts should run for this pipeline.
    pub fn is_active(&self) -> bool {
        !self.paused && !self.archived
    }
}

/// Declarative pipeline configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
    #[serde(default)]
    pub resource_types: Vec<ResourceTypeConfig>,
}

impl PipelineConfig {
    pub fn job(&self, name: &str) -> Option<&JobConfig> {
        self.jobs.iter().find(|j| j.name == name)
    }

    pub fn resource(&self, name: &str) -> Option<&ResourceConfig> {
        self.resources.iter().find(|r| r.name == name)
    }

    pub fn resource_type(&self, name: &str) -> Option<&ResourceTypeConfig> {
        self.resource_types.iter().find(|t| t.name == name)
    }

    /// Validate name uniqueness and cross references.
    pub fn validate(&self) -> Result<()> {
        unique_names("job", self.jobs.iter().map(|j| j.name.as_str()))?;
        unique_names("resource", self.resources.iter().map(|r| r.name.as_str()))?;
        unique_names(
            "resource type",
            self.resource_types.iter().map(|t| t.name.as_str()),
        )?;

        for rt in &self.resource_types {
            let mut seen = HashSet::from([rt.name.as_str()]);
            let mut parent = self.resource_type(&rt.resource_type);
            while let Some(p) = parent {
                if !seen.insert(p.name.as_str()) {
                    return Err(Error::InvalidConfig(format!(
                        "resource type {} has a cyclic type chain",
                        rt.name
                    )));
                }
                parent = self.resource_type(&p.resource_type);
            }
        }

        for job in &self.jobs {
            job.validate(self)?;
        }
        Ok(())
    }

    /// Jobs sharing at least one serial group with `job`, excluding itself.
    pub fn serial_group_peers(&self, job: &JobConfig) -> Vec<&JobConfig> {
        if job.serial_groups.is_empty() {
            return Vec::new();
        }
        self.jobs
            .iter()
            .filter(|other| other.name != job.name)
            .filter(|other| {
                other
                    .serial_groups
                    .iter()
                    .any(|g| job.serial_groups.contains(g))
            })
            .collect()
    }
}

impl PipelineConfig {
    /// Everything that gets checked: resource types with parents before
    /// children, then resources.
    pub fn checkables(&self) -> Vec<Checkable> {
        let mut types: Vec<(usize, Checkable)> = self
            .resource_types
            .iter()
            .map(|t| (self.type_depth(&t.resource_type), Checkable::from_type(t)))
            .collect();
        types.sort_by_key(|(depth, _)| *depth);

        let mut all: Vec<Checkable> = types.into_iter().map(|(_, c)| c).collect();
        all.extend(self.resources.iter().map(Checkable::from_resource));
        all
    }

    pub fn checkable(&self, kind: CheckableKind, name: &str) -> Option<Checkable> {
        match kind {
            CheckableKind::Resource => self.resource(name).map(Checkable::from_resource),
            CheckableKind::ResourceType => self.resource_type(name).map(Checkable::from_type),
        }
    }

    /// Number of custom types between `type_name` and its base type.
    pub fn type_depth(&self, type_name: &str) -> usize {
        let mut depth = 0;
        let mut current = type_name;
        while let Some(custom) = self.resource_type(current) {
            depth += 1;
            if depth > self.resource_types.len() {
                break;
            }
            current = &custom.resource_type;
        }
        depth
    }

    /// Base type at the bottom of `type_name`'s custom type chain.
    pub fn base_type_of<'a>(&'a self, type_name: &'a str) -> &'a str {
        let mut current = type_name;
        for _ in 0..=self.resource_types.len() {
            match self.resource_type(current) {
                Some(custom) => current = &custom.resource_type,
                None => break,
            }
        }
        current
    }

    /// Image for steps of `type_name`.
    ///
    /// `type_versions` maps custom resource types to their latest version;
    /// `None` if `type_name` is a custom type without one.
    pub fn image_for(
        &self,
        type_name: &str,
        type_versions: &BTreeMap<String, Version>,
    ) -> Option<ImageSpec> {
        match self.resource_type(type_name) {
            Some(custom) => Some(ImageSpec::CustomType {
                name: custom.name.clone(),
                base_type: self.base_type_of(type_name).to_string(),
                source: custom.source.clone(),
                version: type_versions.get(type_name)?.clone(),
            }),
            None => Some(ImageSpec::BaseType {
                resource_type: type_name.to_string(),
            }),
        }
    }
}

/// A resource or resource type as seen by the checker.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkable {
    pub kind: CheckableKind,
    pub name: String,
    /// Type whose check capability discovers versions.
    pub resource_type: String,
    pub source: Source,
    pub check_every_secs: Option<u64>,
    pub tags: Vec<String>,
}

impl Checkable {
    fn from_resource(r: &ResourceConfig) -> Self {
        Self {
            kind: CheckableKind::Resource,
            name: r.name.clone(),
            resource_type: r.resource_type.clone(),
            source: r.source.clone(),
            check_every_secs: r.check_every_secs,
            tags: r.tags.clone(),
        }
    }

    fn from_type(t: &ResourceTypeConfig) -> Self {
        Self {
            kind: CheckableKind::ResourceType,
            name: t.name.clone(),
            resource_type: t.resource_type.clone(),
            source: t.source.clone(),
            check_every_secs: t.check_every_secs,
            tags: t.tags.clone(),
        }
    }

    /// Scope identity when checked with `image`. A custom type's version is
    /// part of the identity.
    pub fn scope_spec(&self, image: &ImageSpec) -> ScopeSpec {
        let type_version = match image {
            ImageSpec::CustomType { version, .. } => Some(version.clone()),
            _ => None,
        };
        ScopeSpec::new(self.resource_type.clone(), self.source.clone(), type_version)
    }
}

fn unique_names<'a>(kind: &str, names: impl Iterator<Item = &'a str>) -> Result<()> {
    let mut seen = HashSet::new();
    for name in names {
        if name.is_empty() {
            return Err(Error::InvalidConfig(format!("{kind} with empty name")));
        }
        if !seen.insert(name) {
            return Err(Error::InvalidConfig(format!("duplicate {kind} name: {name}")));
        }
    }
    Ok(())
}

/// A resource declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default)]
    pub source: Source,
    /// Check interval in seconds.
    #[serde(default)]
    pub check_every_secs: Option<u64>,
    /// Version pinned by configuration.
    #[serde(default)]
    pub version: Option<Version>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A custom resource type declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceTypeConfig {
    pub name: String,
    /// The type that provides this type's image, usually a base type.
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default)]
    pub source: Source,
    #[serde(default)]
    pub check_every_secs: Option<u64>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A job declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,
    pub plan: Vec<StepConfig>,
    #[serde(default)]
    pub serial: bool,
    #[serde(default)]
    pub serial_groups: Vec<String>,
    #[serde(default)]
    pub max_in_flight: Option<u32>,
    #[serde(default)]
    pub disable_manual_trigger: bool,
    #[serde(default)]
    pub on_success: Option<Box<StepConfig>>,
    #[serde(default)]
    pub on_failure: Option<Box<StepConfig>>,
    #[serde(default)]
    pub on_error: Option<Box<StepConfig>>,
    #[serde(default)]
    pub on_abort: Option<Box<StepConfig>>,
    #[serde(default)]
    pub ensure: Option<Box<StepConfig>>,
}

impl JobConfig {
    pub fn new(name: impl Into<String>, plan: Vec<StepConfig>) -> Self {
        Self {
            name: name.into(),
            plan,
            serial: false,
            serial_groups: Vec::new(),
            max_in_flight: None,
            disable_manual_trigger: false,
            on_success: None,
            on_failure: None,
            on_error: None,
            on_abort: None,
            ensure: None,
        }
    }

    /// Effective in-flight limit. `None` is unlimited.
    ///
    /// `serial` and serial groups force a limit of one.
    pub fn max_in_flight(&self) -> Option<u32> {
        if self.serial || !self.serial_groups.is_empty() {
            return Some(1);
        }
        self.max_in_flight.filter(|n| *n > 0)
    }

    /// All get steps in the plan and job hooks, in tree order.
    pub fn get_steps(&self) -> Vec<&GetStep> {
        let mut gets = Vec::new();
        for step in &self.plan {
            step.collect_gets(&mut gets);
        }
        for hook in self.hooks() {
            hook.collect_gets(&mut gets);
        }
        gets
    }

    /// Get steps that are inputs of the job (deduplicated by name).
    pub fn inputs(&self) -> Vec<&GetStep> {
        let mut seen = HashSet::new();
        self.get_steps()
            .into_iter()
            .filter(|g| seen.insert(g.name.as_str()))
            .collect()
    }

    /// All put steps in the plan and job hooks.
    pub fn put_steps(&self) -> Vec<&PutStep> {
        let mut puts = Vec::new();
        for step in &self.plan {
            step.collect_puts(&mut puts);
        }
        for hook in self.hooks() {
            hook.collect_puts(&mut puts);
        }
        puts
    }

    fn hooks(&self) -> impl Iterator<Item = &StepConfig> {
        [
            &self.on_success,
            &self.on_failure,
            &self.on_error,
            &self.on_abort,
            &self.ensure,
        ]
        .into_iter()
        .filter_map(|h| h.as_deref())
    }

    /// Whether this job reads or writes `resource`.
    pub fn uses_resource(&self, resource: &str) -> bool {
        self.get_steps().iter().any(|g| g.resource() == resource)
            || self.put_steps().iter().any(|p| p.resource() == resource)
    }

    fn validate(&self, pipeline: &PipelineConfig) -> Result<()> {
        let mut retries = Vec::new();
        for step in self.plan.iter().chain(self.hooks()) {
            step.collect_retries(&mut retries);
        }
        if let Some(retry) = retries.iter().find(|r| r.attempts > MAX_RETRY_ATTEMPTS) {
            return Err(Error::InvalidConfig(format!(
                "job {} retries a step {} times, at most {MAX_RETRY_ATTEMPTS} allowed",
                self.name, retry.attempts
            )));
        }

        for get in self.get_steps() {
            if pipeline.resource(get.resource()).is_none() {
                return Err(Error::InvalidConfig(format!(
                    "job {} gets unknown resource {}",
                    self.name,
                    get.resource()
                )));
            }
            for upstream in &get.passed {
                let Some(job) = pipeline.job(upstream) else {
                    return Err(Error::InvalidConfig(format!(
                        "job {} input {} is constrained by unknown job {}",
                        self.name, get.name, upstream
                    )));
                };
                if !job.uses_resource(get.resource()) {
                    return Err(Error::InvalidConfig(format!(
                        "job {} input {} is constrained by job {} which does not use resource {}",
                        self.name,
                        get.name,
                        upstream,
                        get.resource()
                    )));
                }
            }
        }
        for put in self.put_steps() {
            if pipeline.resource(put.resource()).is_none() {
                return Err(Error::InvalidConfig(format!(
                    "job {} puts unknown resource {}",
                    self.name,
                    put.resource()
                )));
            }
        }
        Ok(())
    }
}

/// One node of a job's declared step tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepConfig {
    Get(GetStep),
    Put(PutStep),
    Task(TaskStep),
    Do(Vec<StepConfig>),
    InParallel(InParallelStep),
    /// Legacy form of `in_parallel`: concurrent and never fail-fast.
    Aggregate(Vec<StepConfig>),
    OnSuccess(HookStep),
    OnFailure(HookStep),
    OnError(HookStep),
    OnAbort(HookStep),
    Ensure(HookStep),
    Try(Box<StepConfig>),
    Timeout(TimeoutStep),
    Retry(RetryStep),
}

impl StepConfig {
    fn children(&self) -> Vec<&StepConfig> {
        match self {
            StepConfig::Get(_) | StepConfig::Put(_) | StepConfig::Task(_) => Vec::new(),
            StepConfig::Do(steps) | StepConfig::Aggregate(steps) => steps.iter().collect(),
            StepConfig::InParallel(p) => p.steps.iter().collect(),
            StepConfig::OnSuccess(h)
            | StepConfig::OnFailure(h)
            | StepConfig::OnError(h)
            | StepConfig::OnAbort(h)
            | StepConfig::Ensure(h) => vec![h.step.as_ref(), h.hook.as_ref()],
            StepConfig::Try(step) => vec![step.as_ref()],
            StepConfig::Timeout(t) => vec![t.step.as_ref()],
            StepConfig::Retry(r) => vec![r.step.as_ref()],
        }
    }

    fn collect_gets<'a>(&'a self, out: &mut Vec<&'a GetStep>) {
        if let StepConfig::Get(get) = self {
            out.push(get);
        }
        for child in self.children() {
            child.collect_gets(out);
        }
    }

    fn collect_retries<'a>(&'a self, out: &mut Vec<&'a RetryStep>) {
        if let StepConfig::Retry(retry) = self {
            out.push(retry);
        }
        for child in self.children() {
            child.collect_retries(out);
        }
    }

    fn collect_puts<'a>(&'a self, out: &mut Vec<&'a PutStep>) {
        if let StepConfig::Put(put) = self {
            out.push(put);
        }
        for child in self.children() {
            child.collect_puts(out);
        }
    }
}

/// How a get step picks its version.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionPolicy {
    #[default]
    Latest,
    Every,
    Pinned(Version),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetStep {
    /// Artifact name the fetched bits are exposed under.
    pub name: String,
    /// Resource to fetch; defaults to `name`.
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(default)]
    pub passed: Vec<String>,
    #[serde(default)]
    pub trigger: bool,
    #[serde(default)]
    pub version: VersionPolicy,
    #[serde(default)]
    pub params: Params,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl GetStep {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resource: None,
            passed: Vec::new(),
            trigger: false,
            version: VersionPolicy::Latest,
            params: Params::new(),
            tags: Vec::new(),
        }
    }

    pub fn resource(&self) -> &str {
        self.resource.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PutStep {
    pub name: String,
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(default)]
    pub params: Params,
    /// Artifacts mounted into the put; all known artifacts when absent.
    #[serde(default)]
    pub inputs: Option<Vec<String>>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl PutStep {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resource: None,
            params: Params::new(),
            inputs: None,
            tags: Vec::new(),
        }
    }

    pub fn resource(&self) -> &str {
        self.resource.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStep {
    pub name: String,
    pub config: TaskConfig,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// What a task runs and which artifacts it consumes and produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    #[serde(default = "default_platform")]
    pub platform: String,
    #[serde(default)]
    pub image_resource: Option<ImageResource>,
    #[serde(default)]
    pub rootfs_uri: Option<String>,
    #[serde(default)]
    pub inputs: Vec<TaskInput>,
    #[serde(default)]
    pub outputs: Vec<TaskOutput>,
    #[serde(default)]
    pub caches: Vec<TaskCache>,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    pub run: TaskRun,
}

fn default_platform() -> String {
    "linux".to_string()
}

impl TaskConfig {
    pub fn new(run: TaskRun) -> Self {
        Self {
            platform: default_platform(),
            image_resource: None,
            rootfs_uri: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            caches: Vec::new(),
            params: BTreeMap::new(),
            run,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageResource {
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default)]
    pub source: Source,
    #[serde(default)]
    pub version: Option<Version>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInput {
    pub name: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub optional: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub name: String,
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCache {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRun {
    pub path: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub dir: Option<String>,
}

impl TaskRun {
    pub fn new(path: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            path: path.into(),
            args,
            dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InParallelStep {
    pub steps: Vec<StepConfig>,
    /// Maximum concurrently running children.
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub fail_fast: bool,
}

/// A primary step with a companion hook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookStep {
    pub step: Box<StepConfig>,
    pub hook: Box<StepConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutStep {
    pub step: Box<StepConfig>,
    pub duration_secs: u64,
}

/// Upper bound on `retry` attempts; each attempt is compiled up front.
pub const MAX_RETRY_ATTEMPTS: u32 = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryStep {
    pub step: Box<StepConfig>,
    pub attempts: u32,
}

/// Resources and resource types are both checked; this distinguishes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckableKind {
    Resource,
    ResourceType,
}

impl CheckableKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckableKind::Resource => "resource",
            CheckableKind::ResourceType => "resource_type",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "resource" => Some(CheckableKind::Resource),
            "resource_type" => Some(CheckableKind::ResourceType),
            _ => None,
        }
    }
}

/// Runtime state of a resource or resource type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    pub pipeline_id: PipelineId,
    pub kind: CheckableKind,
    pub name: String,
    /// Scope the checkable currently points at; changes when config changes.
    pub scope_id: Option<crate::ids::ScopeId>,
    /// Version pinned through the API.
    pub pinned_version: Option<VersionId>,
    pub pin_comment: Option<String>,
    /// Errors that prevent checking at all, e.g. a parent type with no version.
    pub check_error: Option<String>,
}

/// Runtime state of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    pub pipeline_id: PipelineId,
    pub name: String,
    pub paused: bool,
    /// Manual triggers waiting for the job to become ready.
    pub pending_triggers: u32,
    /// Last allocated build number.
    pub build_number_seq: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn get(name: &str) -> StepConfig {
        StepConfig::Get(GetStep::new(name))
    }

    fn resource(name: &str) -> ResourceConfig {
        ResourceConfig {
            name: name.to_string(),
            resource_type: "git".to_string(),
            source: Source::new(),
            check_every_secs: None,
            version: None,
            tags: Vec::new(),
        }
    }

    fn custom_type(name: &str, parent: &str) -> ResourceTypeConfig {
        ResourceTypeConfig {
            name: name.to_string(),
            resource_type: parent.to_string(),
            source: Source::new(),
            check_every_secs: None,
            tags: Vec::new(),
        }
    }

    #[test]
    fn test_checkables_order_types_first() {
        let config = PipelineConfig {
            jobs: vec![],
            resources: vec![resource("repo")],
            resource_types: vec![
                custom_type("child", "parent"),
                custom_type("parent", "registry-image"),
            ],
        };
        let names: Vec<String> = config.checkables().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["parent", "child", "repo"]);
        assert_eq!(config.base_type_of("child"), "registry-image");
        assert_eq!(config.base_type_of("git"), "git");
    }

    #[test]
    fn test_image_for_custom_type_needs_version() {
        let config = PipelineConfig {
            jobs: vec![],
            resources: vec![],
            resource_types: vec![custom_type("slack", "registry-image")],
        };
        let mut versions = BTreeMap::new();
        assert_eq!(config.image_for("slack", &versions), None);
        assert_eq!(
            config.image_for("git", &versions),
            Some(ImageSpec::BaseType {
                resource_type: "git".to_string()
            })
        );

        let mut v = Version::new();
        v.insert("digest".to_string(), "sha256:1".to_string());
        versions.insert("slack".to_string(), v.clone());
        let image = config.image_for("slack", &versions).unwrap();
        let checkable = config.checkable(CheckableKind::ResourceType, "slack").unwrap();
        assert_eq!(image.base_type(), Some("registry-image"));

        // The type's own version feeds the identity of things using it.
        let spec = Checkable {
            kind: CheckableKind::Resource,
            name: "notify".to_string(),
            resource_type: "slack".to_string(),
            source: Source::new(),
            check_every_secs: None,
            tags: vec![],
        }
        .scope_spec(&image);
        assert_eq!(spec.type_version, Some(v));
        assert_eq!(checkable.resource_type, "registry-image");
    }

    #[test]
    fn test_max_in_flight_serial_groups() {
        let mut job = JobConfig::new("unit", vec![]);
        assert_eq!(job.max_in_flight(), None);

        job.max_in_flight = Some(3);
        assert_eq!(job.max_in_flight(), Some(3));

        job.serial_groups = vec!["deploy".to_string()];
        assert_eq!(job.max_in_flight(), Some(1));
    }

    #[test]
    fn test_inputs_deduplicated_across_hooks() {
        let mut job = JobConfig::new(
            "unit",
            vec![StepConfig::Do(vec![get("repo"), get("tools")])],
        );
        job.ensure = Some(Box::new(get("repo")));

        let names: Vec<_> = job.inputs().iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["repo", "tools"]);
    }

    #[test]
    fn test_validate_unknown_passed_job() {
        let mut step = GetStep::new("repo");
        step.passed = vec!["missing".to_string()];
        let config = PipelineConfig {
            jobs: vec![JobConfig::new("unit", vec![StepConfig::Get(step)])],
            resources: vec![resource("repo")],
            resource_types: vec![],
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_retry_attempts_are_bounded() {
        let retry = |attempts| {
            StepConfig::Retry(RetryStep {
                step: Box::new(StepConfig::Get(GetStep::new("repo"))),
                attempts,
            })
        };
        let mut job = JobConfig::new("unit", vec![retry(3)]);
        job.ensure = Some(Box::new(StepConfig::Do(vec![retry(4_000_000_000)])));
        let config = PipelineConfig {
            jobs: vec![job],
            resources: vec![resource("repo")],
            resource_types: vec![],
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(msg)) if msg.contains("4000000000")));

        let config = PipelineConfig {
            jobs: vec![JobConfig::new("unit", vec![retry(MAX_RETRY_ATTEMPTS)])],
            resources: vec![resource("repo")],
            resource_types: vec![],
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_cyclic_resource_types() {
        let config = PipelineConfig {
            jobs: vec![],
            resources: vec![],
            resource_types: vec![
                ResourceTypeConfig {
                    name: "a".into(),
                    resource_type: "b".into(),
                    source: Source::new(),
                    check_every_secs: None,
                    tags: vec![],
                },
                ResourceTypeConfig {
                    name: "b".into(),
                    resource_type: "a".into(),
                    source: Source::new(),
                    check_every_secs: None,
                    tags: vec![],
                },
            ],
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_serial_group_peers() {
        let mut a = JobConfig::new("a", vec![]);
        a.serial_groups = vec!["g".into()];
        let mut b = JobConfig::new("b", vec![]);
        b.serial_groups = vec!["g".into(), "h".into()];
        let c = JobConfig::new("c", vec![]);
        let config = PipelineConfig {
            jobs: vec![a.clone(), b, c],
            ..Default::default()
        };
        let peers: Vec<_> = config
            .serial_group_peers(&a)
            .iter()
            .map(|j| j.name.clone())
            .collect();
        assert_eq!(peers, vec!["b".to_string()]);
    }
}
