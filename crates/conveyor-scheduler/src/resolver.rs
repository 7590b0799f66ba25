//! Picks the input versions for the next build of a job.

use crate::compiler::{JobInput, job_inputs};
use conveyor_core::Result;
use conveyor_core::ids::{ScopeId, VersionId};
use conveyor_core::pipeline::{CheckableKind, JobConfig, Pipeline, VersionPolicy};
use conveyor_core::ports::{BuildRepository, PipelineRepository, VersionStore};
use conveyor_core::version::ResourceVersion;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedInput {
    pub name: String,
    pub resource: String,
    pub scope_id: ScopeId,
    pub version: ResourceVersion,
    /// The job has never run with this version for this input.
    pub first_occurrence: bool,
    pub trigger: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Ready(Vec<ResolvedInput>),
    NotReady(String),
}

/// Candidate versions of one input before `passed` narrowing.
enum Allowed {
    Any,
    Only(VersionId),
}

pub struct InputResolver {
    pipelines: Arc<dyn PipelineRepository>,
    versions: Arc<dyn VersionStore>,
    builds: Arc<dyn BuildRepository>,
}

impl InputResolver {
    pub fn new(
        pipelines: Arc<dyn PipelineRepository>,
        versions: Arc<dyn VersionStore>,
        builds: Arc<dyn BuildRepository>,
    ) -> Self {
        Self {
            pipelines,
            versions,
            builds,
        }
    }

    /// Resolve every input of `job`, or explain why it cannot run yet.
    pub async fn resolve(&self, pipeline: &Pipeline, job: &JobConfig) -> Result<Resolution> {
        let inputs = job_inputs(&pipeline.config, job);
        let mut scopes = HashMap::new();
        let mut allowed = HashMap::new();

        for input in &inputs {
            let state = self
                .pipelines
                .resource_state(pipeline.id, CheckableKind::Resource, &input.resource)
                .await?;
            let Some(state) = state else {
                return Ok(not_ready(format!("resource {} is unknown", input.resource)));
            };
            let Some(scope_id) = state.scope_id else {
                return Ok(not_ready(format!(
                    "resource {} has not been checked",
                    input.resource
                )));
            };

            let pin = match &input.policy {
                VersionPolicy::Pinned(version) => {
                    match self.versions.find_version(&scope_id, version).await? {
                        Some(row) if row.enabled => Some(row.id),
                        _ => {
                            return Ok(not_ready(format!(
                                "pinned version of {} is not available",
                                input.resource
                            )));
                        }
                    }
                }
                _ => match state.pinned_version {
                    Some(id) => match self.versions.get_version(id).await? {
                        Some(row) if row.enabled && row.scope_id == scope_id => Some(row.id),
                        _ => {
                            return Ok(not_ready(format!(
                                "pinned version of {} is not available",
                                input.resource
                            )));
                        }
                    },
                    None => None,
                },
            };

            allowed.insert(
                input.name.clone(),
                pin.map_or(Allowed::Any, Allowed::Only),
            );
            scopes.insert(input.name.clone(), scope_id);
        }

        let mut chosen: BTreeMap<String, ResourceVersion> = BTreeMap::new();
        if let Some(reason) = self
            .resolve_passed(pipeline, &inputs, &scopes, &allowed, &mut chosen)
            .await?
        {
            return Ok(not_ready(reason));
        }

        let unresolved: Vec<_> = inputs
            .iter()
            .filter(|i| !chosen.contains_key(&i.name))
            .collect();
        for input in unresolved {
            let scope_id = &scopes[&input.name];
            let version = match &allowed[&input.name] {
                Allowed::Only(id) => self.versions.get_version(*id).await?,
                Allowed::Any if input.policy == VersionPolicy::Every => {
                    self.next_every(pipeline, job, input, scope_id).await?
                }
                Allowed::Any => self.versions.latest_enabled(scope_id).await?,
            };
            let Some(version) = version else {
                return Ok(not_ready(format!(
                    "no versions of {} are available",
                    input.resource
                )));
            };
            chosen.insert(input.name.clone(), version);
        }

        let mut resolved = Vec::with_capacity(inputs.len());
        for input in &inputs {
            let Some(version) = chosen.remove(&input.name) else {
                continue;
            };
            let used = self
                .builds
                .version_used(pipeline.id, &job.name, &input.name, version.id)
                .await?;
            resolved.push(ResolvedInput {
                name: input.name.clone(),
                resource: input.resource.clone(),
                scope_id: version.scope_id.clone(),
                version,
                first_occurrence: !used,
                trigger: input.trigger,
            });
        }
        Ok(Resolution::Ready(resolved))
    }

    /// Narrow `passed` inputs to versions that went through the upstream
    /// jobs together.
    ///
    /// Upstream jobs are visited by name. For each, the newest succeeded
    /// build consistent with every choice made so far fixes the versions
    /// of the inputs it constrains. Earlier choices are never revisited.
    async fn resolve_passed(
        &self,
        pipeline: &Pipeline,
        inputs: &[JobInput],
        scopes: &HashMap<String, ScopeId>,
        allowed: &HashMap<String, Allowed>,
        chosen: &mut BTreeMap<String, ResourceVersion>,
    ) -> Result<Option<String>> {
        let upstream: BTreeSet<&str> = inputs
            .iter()
            .flat_map(|i| i.passed.iter().map(String::as_str))
            .collect();
        let mut rows: HashMap<VersionId, Option<ResourceVersion>> = HashMap::new();

        for upstream_job in upstream {
            let constrained: Vec<&JobInput> = inputs
                .iter()
                .filter(|i| i.passed.iter().any(|p| p == upstream_job))
                .collect();
            let builds = self
                .builds
                .succeeded_build_versions(pipeline.id, upstream_job)
                .await?;

            let mut satisfied = false;
            'builds: for build in &builds {
                let mut picks = Vec::with_capacity(constrained.len());
                for input in &constrained {
                    let mut pick = None;
                    for id in build.versions_of(&input.resource) {
                        if let Some(existing) = chosen.get(&input.name) {
                            if existing.id == id {
                                pick = Some(existing.clone());
                                break;
                            }
                            continue;
                        }
                        if let Allowed::Only(pinned) = &allowed[&input.name] {
                            if *pinned != id {
                                continue;
                            }
                        }
                        if !rows.contains_key(&id) {
                            rows.insert(id, self.versions.get_version(id).await?);
                        }
                        match &rows[&id] {
                            Some(row) if row.enabled && row.scope_id == scopes[&input.name] => {
                                pick = Some(row.clone());
                                break;
                            }
                            _ => {}
                        }
                    }
                    match pick {
                        Some(row) => picks.push((input.name.clone(), row)),
                        None => continue 'builds,
                    }
                }

                debug!(
                    job = %upstream_job,
                    build_id = %build.build_id,
                    "Passed constraint satisfied"
                );
                for (name, row) in picks {
                    chosen.insert(name, row);
                }
                satisfied = true;
                break;
            }

            if !satisfied {
                let names: Vec<&str> = constrained.iter().map(|i| i.name.as_str()).collect();
                return Ok(Some(format!(
                    "no build of {upstream_job} satisfies inputs {}",
                    names.join(", ")
                )));
            }
        }
        Ok(None)
    }

    /// The oldest enabled version newer than the one the job last used,
    /// falling back to the latest.
    async fn next_every(
        &self,
        pipeline: &Pipeline,
        job: &JobConfig,
        input: &JobInput,
        scope_id: &ScopeId,
    ) -> Result<Option<ResourceVersion>> {
        let last_used = match self
            .builds
            .last_used_version(pipeline.id, &job.name, &input.name)
            .await?
        {
            Some(id) => self.versions.get_version(id).await?,
            None => None,
        };
        let Some(last_used) = last_used.filter(|v| &v.scope_id == scope_id) else {
            return self.versions.latest_enabled(scope_id).await;
        };

        let next = self
            .versions
            .versions(scope_id, None)
            .await?
            .into_iter()
            .filter(|v| v.enabled && v.check_order > last_used.check_order)
            .min_by_key(|v| v.check_order);
        match next {
            Some(version) => Ok(Some(version)),
            None => self.versions.latest_enabled(scope_id).await,
        }
    }
}

fn not_ready(reason: String) -> Resolution {
    Resolution::NotReady(reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::build::{BuildInput, BuildOutput, BuildStatus, NewBuild};
    use conveyor_core::ids::PlanId;
    use conveyor_core::pipeline::{GetStep, PipelineConfig, PutStep, ResourceConfig, StepConfig};
    use conveyor_core::plan::{Plan, PlanStep};
    use crate::testing::discover;
    use conveyor_core::version::Source;
    use conveyor_db::MemoryStore;
    use pretty_assertions::assert_eq;

    fn resource(name: &str) -> ResourceConfig {
        let mut source = Source::new();
        source.insert("uri".to_string(), serde_json::json!(name));
        ResourceConfig {
            name: name.to_string(),
            resource_type: "git".to_string(),
            source,
            check_every_secs: None,
            version: None,
            tags: vec![],
        }
    }

    fn get(name: &str, passed: &[&str]) -> StepConfig {
        let mut step = GetStep::new(name);
        step.passed = passed.iter().map(|s| s.to_string()).collect();
        step.trigger = true;
        StepConfig::Get(step)
    }

    fn config(downstream: Vec<StepConfig>) -> PipelineConfig {
        PipelineConfig {
            jobs: vec![
                JobConfig::new("build", vec![get("repo", &[]), get("lib", &[])]),
                JobConfig::new("deploy", downstream),
            ],
            resources: vec![resource("repo"), resource("lib")],
            resource_types: vec![],
        }
    }

    struct Fixture {
        store: MemoryStore,
        resolver: InputResolver,
        pipeline: Pipeline,
    }

    impl Fixture {
        async fn new(config: PipelineConfig) -> Self {
            let store = MemoryStore::new();
            let pipeline = store.save("main", "ci", &config, None).await.unwrap();
            let resolver = InputResolver::new(
                Arc::new(store.clone()),
                Arc::new(store.clone()),
                Arc::new(store.clone()),
            );
            Self {
                store,
                resolver,
                pipeline,
            }
        }

        async fn discover(&self, resource: &str, refs: &[&str]) -> Vec<ResourceVersion> {
            discover(&self.store, &self.pipeline, resource, refs).await
        }

        async fn finish_build(&self, job: &str, inputs: &[(&str, &ResourceVersion)], status: BuildStatus) {
            let plan = Plan::new(PlanId::root(), PlanStep::Do(vec![]));
            let inputs = inputs
                .iter()
                .map(|(name, v)| BuildInput {
                    name: name.to_string(),
                    resource: name.to_string(),
                    version_id: v.id,
                    first_occurrence: true,
                })
                .collect();
            let build = self
                .store
                .create(NewBuild::for_job("main", self.pipeline.id, job, plan, inputs))
                .await
                .unwrap();
            self.store
                .transition(build.id, BuildStatus::Pending, BuildStatus::Started)
                .await
                .unwrap();
            self.store
                .transition(build.id, BuildStatus::Started, status)
                .await
                .unwrap();
        }

        async fn resolve(&self, job: &str) -> Resolution {
            let job = self.pipeline.config.job(job).unwrap();
            self.resolver.resolve(&self.pipeline, job).await.unwrap()
        }
    }

    fn refs(resolution: &Resolution) -> Vec<(String, String, bool)> {
        let Resolution::Ready(inputs) = resolution else {
            panic!("expected ready, got {resolution:?}");
        };
        inputs
            .iter()
            .map(|i| (i.name.clone(), i.version.version["ref"].clone(), i.first_occurrence))
            .collect()
    }

    #[tokio::test]
    async fn test_unchecked_resource_not_ready() {
        let fixture = Fixture::new(config(vec![get("repo", &[])])).await;
        assert_eq!(
            fixture.resolve("deploy").await,
            Resolution::NotReady("resource repo has not been checked".to_string())
        );
    }

    #[tokio::test]
    async fn test_latest_skips_disabled_and_tracks_first_occurrence() {
        let fixture = Fixture::new(config(vec![get("repo", &[])])).await;
        let rows = fixture.discover("repo", &["a", "b"]).await;
        fixture.store.set_version_enabled(rows[1].id, false).await.unwrap();

        let resolution = fixture.resolve("deploy").await;
        assert_eq!(refs(&resolution), vec![("repo".to_string(), "a".to_string(), true)]);

        fixture
            .finish_build("deploy", &[("repo", &rows[0])], BuildStatus::Succeeded)
            .await;
        let resolution = fixture.resolve("deploy").await;
        assert_eq!(refs(&resolution), vec![("repo".to_string(), "a".to_string(), false)]);
    }

    #[tokio::test]
    async fn test_passed_uses_versions_from_one_upstream_build() {
        let fixture = Fixture::new(config(vec![get("repo", &["build"]), get("lib", &["build"])])).await;
        let repo = fixture.discover("repo", &["r1", "r2"]).await;
        let lib = fixture.discover("lib", &["l1", "l2"]).await;

        assert!(matches!(fixture.resolve("deploy").await, Resolution::NotReady(_)));

        fixture
            .finish_build("build", &[("repo", &repo[0]), ("lib", &lib[1])], BuildStatus::Succeeded)
            .await;
        fixture
            .finish_build("build", &[("repo", &repo[1]), ("lib", &lib[1])], BuildStatus::Failed)
            .await;

        let resolution = fixture.resolve("deploy").await;
        assert_eq!(
            refs(&resolution),
            vec![
                ("repo".to_string(), "r1".to_string(), true),
                ("lib".to_string(), "l2".to_string(), true),
            ]
        );
    }

    #[tokio::test]
    async fn test_api_pin_overrides_latest_and_passed() {
        let fixture = Fixture::new(config(vec![get("repo", &["build"])])).await;
        let repo = fixture.discover("repo", &["r1", "r2", "r3"]).await;
        fixture.finish_build("build", &[("repo", &repo[0])], BuildStatus::Succeeded).await;
        fixture.finish_build("build", &[("repo", &repo[2])], BuildStatus::Succeeded).await;

        fixture
            .store
            .pin_version(fixture.pipeline.id, "repo", Some(repo[0].id), Some("hold"))
            .await
            .unwrap();
        assert_eq!(
            refs(&fixture.resolve("deploy").await),
            vec![("repo".to_string(), "r1".to_string(), true)]
        );

        fixture
            .store
            .pin_version(fixture.pipeline.id, "repo", Some(repo[1].id), None)
            .await
            .unwrap();
        assert!(matches!(fixture.resolve("deploy").await, Resolution::NotReady(_)));
    }

    #[tokio::test]
    async fn test_every_walks_versions_in_order() {
        let mut step = GetStep::new("repo");
        step.version = VersionPolicy::Every;
        let fixture = Fixture::new(config(vec![StepConfig::Get(step)])).await;
        let repo = fixture.discover("repo", &["r1", "r2", "r3"]).await;

        assert_eq!(refs(&fixture.resolve("deploy").await)[0].1, "r3");

        fixture.finish_build("deploy", &[("repo", &repo[0])], BuildStatus::Succeeded).await;
        assert_eq!(refs(&fixture.resolve("deploy").await)[0].1, "r2");

        fixture.store.set_version_enabled(repo[1].id, false).await.unwrap();
        assert_eq!(refs(&fixture.resolve("deploy").await)[0].1, "r3");

        fixture.finish_build("deploy", &[("repo", &repo[2])], BuildStatus::Succeeded).await;
        assert_eq!(
            refs(&fixture.resolve("deploy").await)[0],
            ("repo".to_string(), "r3".to_string(), false)
        );
    }

    #[tokio::test]
    async fn test_put_outputs_satisfy_passed() {
        let mut cfg = config(vec![get("repo", &["build"])]);
        cfg.jobs[0] = JobConfig::new("build", vec![StepConfig::Put(PutStep::new("repo"))]);
        let fixture = Fixture::new(cfg).await;
        let repo = fixture.discover("repo", &["r1"]).await;

        let plan = Plan::new(PlanId::root(), PlanStep::Do(vec![]));
        let build = fixture
            .store
            .create(NewBuild::for_job("main", fixture.pipeline.id, "build", plan, vec![]))
            .await
            .unwrap();
        fixture
            .store
            .save_output(
                build.id,
                &BuildOutput {
                    name: "repo".to_string(),
                    resource: "repo".to_string(),
                    version_id: repo[0].id,
                },
            )
            .await
            .unwrap();
        fixture.store.transition(build.id, BuildStatus::Pending, BuildStatus::Succeeded).await.unwrap();

        assert_eq!(
            refs(&fixture.resolve("deploy").await),
            vec![("repo".to_string(), "r1".to_string(), true)]
        );
    }
}
