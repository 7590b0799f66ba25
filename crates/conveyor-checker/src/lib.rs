//! Resource checking for Conveyor CI.
//!
//! A [`PipelineChecker`] runs per active pipeline and asks the [`Checker`] to
//! discover versions for each resource and resource type. Checks are keyed by
//! scope, so checkables with identical configuration share one history and
//! one check. [`CheckerRunner`] starts and stops the per-pipeline loops.

pub mod checker;
pub mod config;
pub mod pipeline;
pub mod runner;

pub use checker::{CheckOutcome, Checker};
pub use config::CheckerConfig;
pub use pipeline::{PipelineChecker, TickSummary};
pub use runner::CheckerRunner;

#[cfg(test)]
pub(crate) mod testing {
    use async_trait::async_trait;
    use conveyor_core::ports::{CheckCapability, CheckRequest};
    use conveyor_core::version::Version;
    use conveyor_core::{Error, Result};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    pub fn version(r: &str) -> Version {
        Version::from([("ref".to_string(), r.to_string())])
    }

    /// Check capability answering per resource type; unknown types have no versions.
    #[derive(Default)]
    pub struct FakeCapability {
        responses: Mutex<HashMap<String, std::result::Result<Vec<Version>, String>>>,
        requests: Mutex<Vec<CheckRequest>>,
        delay: Option<Duration>,
    }

    impl FakeCapability {
        pub fn with_delay(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Default::default()
            }
        }

        pub fn respond(&self, resource_type: &str, versions: Vec<Version>) {
            self.responses
                .lock()
                .unwrap()
                .insert(resource_type.to_string(), Ok(versions));
        }

        pub fn fail(&self, resource_type: &str, message: &str) {
            self.responses
                .lock()
                .unwrap()
                .insert(resource_type.to_string(), Err(message.to_string()));
        }

        pub fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        pub fn last_request(&self) -> Option<CheckRequest> {
            self.requests.lock().unwrap().last().cloned()
        }
    }

    #[async_trait]
    impl CheckCapability for FakeCapability {
        async fn check(&self, request: &CheckRequest) -> Result<Vec<Version>> {
            self.requests.lock().unwrap().push(request.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            match self.responses.lock().unwrap().get(&request.resource_type) {
                Some(Ok(versions)) => Ok(versions.clone()),
                Some(Err(message)) => Err(Error::CheckFailed(message.clone())),
                None => Ok(Vec::new()),
            }
        }
    }
}
