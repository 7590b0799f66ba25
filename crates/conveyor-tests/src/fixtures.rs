//! Pipeline configs shared by the integration tests.

use conveyor_core::pipeline::PipelineConfig;

/// One git resource feeding a single unit-test job.
pub const SIMPLE_PIPELINE: &str = r#"
resources:
  - name: repo
    type: git
    source:
      uri: https://example.com/app.git
jobs:
  - name: unit
    plan:
      - get:
          name: repo
          trigger: true
      - task:
          name: test
          config:
            inputs:
              - name: repo
            run:
              path: "true"
"#;

/// `unit` then `deploy`, with `deploy` only taking versions that passed `unit`.
pub const CHAINED_PIPELINE: &str = r#"
resources:
  - name: repo
    type: git
    source:
      uri: https://example.com/app.git
jobs:
  - name: unit
    plan:
      - get:
          name: repo
          trigger: true
      - task:
          name: test
          config:
            inputs:
              - name: repo
            run:
              path: "true"
  - name: deploy
    plan:
      - get:
          name: repo
          trigger: true
          passed: [unit]
      - task:
          name: ship
          config:
            inputs:
              - name: repo
            run:
              path: ship
"#;

/// A job that fetches every version and fails its task.
pub const EVERY_FAILING_PIPELINE: &str = r#"
resources:
  - name: repo
    type: git
    source:
      uri: https://example.com/app.git
jobs:
  - name: lint
    plan:
      - get:
          name: repo
          trigger: true
          version: every
      - task:
          name: lint
          config:
            run:
              path: "false"
"#;

/// A job that puts a release and a job that can only run through the scheduler.
pub const RELEASE_PIPELINE: &str = r#"
resources:
  - name: repo
    type: git
    source:
      uri: https://example.com/app.git
  - name: release
    type: git
    source:
      uri: https://example.com/releases.git
jobs:
  - name: publish
    plan:
      - get:
          name: repo
      - put:
          name: release
          params:
            ref: v1.0.0
  - name: nightly
    disable_manual_trigger: true
    plan:
      - get:
          name: repo
          trigger: true
"#;

/// A single long-running task, for abort tests.
pub const SLOW_PIPELINE: &str = r#"
jobs:
  - name: soak
    plan:
      - task:
          name: soak
          config:
            run:
              path: sleep
"#;

/// Parse one of the fixtures.
pub fn pipeline_config(yaml: &str) -> PipelineConfig {
    serde_yaml::with::singleton_map_recursive::deserialize(serde_yaml::Deserializer::from_str(yaml)).expect("Fixture pipeline does not parse")
}
