//! Smoke gate: wait until every instance of a group passes its probe.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use asiaq_state::{Instance, InstanceId};

use crate::cloud::{Cloud, SmokeProbe, SmokeStatus};
use crate::error::{SchedulerError, SchedulerResult};

/// Polls each instance of a group concurrently until all pass, one fails,
/// or the timeout elapses.
#[derive(Clone)]
pub struct SmokeGate {
    cloud: Arc<dyn Cloud>,
    probe: Arc<dyn SmokeProbe>,
    timeout: Duration,
    poll: Duration,
}

impl SmokeGate {
    pub fn new(cloud: Arc<dyn Cloud>, probe: Arc<dyn SmokeProbe>, timeout: Duration, poll: Duration) -> Self {
        Self {
            cloud,
            probe,
            timeout,
            poll,
        }
    }

    /// Returns the number of instances that passed. An empty group passes.
    pub async fn wait_for_group(&self, environment: &str, group: &str) -> SchedulerResult<usize> {
        let instances = self.cloud.list_instances(environment, Some(group)).await?;
        let Some(hostclass) = instances.first().map(|i| i.hostclass.clone()) else {
            debug!(%group, "no instances to smoke test");
            return Ok(0);
        };

        let mut remaining: BTreeSet<InstanceId> = instances.iter().map(|i| i.id.clone()).collect();
        let mut tasks = JoinSet::new();
        for instance in instances {
            tasks.spawn(watch_instance(
                Arc::clone(&self.cloud),
                Arc::clone(&self.probe),
                instance,
                self.poll,
            ));
        }

        let total = remaining.len();
        let outcome = tokio::time::timeout(self.timeout, async {
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(Ok(id)) => {
                        remaining.remove(&id);
                    }
                    Ok(Err(e)) => return Err(e),
                    Err(e) => {
                        return Err(SchedulerError::SmokeTestFailure {
                            hostclass: hostclass.clone(),
                            instance: "?".to_string(),
                            reason: format!("smoke task failed: {e}"),
                        });
                    }
                }
            }
            Ok(())
        })
        .await;

        match outcome {
            Ok(Ok(())) => {
                info!(%group, instances = total, "smoke tests passed");
                Ok(total)
            }
            Ok(Err(e)) => {
                warn!(%group, error = %e, "smoke test failed");
                Err(e)
            }
            Err(_) => {
                let pending: Vec<&str> = remaining.iter().map(String::as_str).collect();
                warn!(%group, pending = pending.len(), "smoke tests timed out");
                Err(SchedulerError::SmokeTestFailure {
                    hostclass,
                    instance: pending.join(","),
                    reason: format!("not passing after {}s", self.timeout.as_secs()),
                })
            }
        }
    }
}

async fn watch_instance(
    cloud: Arc<dyn Cloud>,
    probe: Arc<dyn SmokeProbe>,
    instance: Instance,
    poll: Duration,
) -> SchedulerResult<InstanceId> {
    let failure = |reason: String| SchedulerError::SmokeTestFailure {
        hostclass: instance.hostclass.clone(),
        instance: instance.id.clone(),
        reason,
    };
    loop {
        let current = cloud
            .list_instances(&instance.environment, Some(&instance.group))
            .await?
            .into_iter()
            .find(|i| i.id == instance.id);
        let Some(current) = current else {
            return Err(failure("instance disappeared".to_string()));
        };
        if current.status.is_terminal() {
            return Err(failure(format!("instance entered {:?} state", current.status)));
        }
        match probe.probe(&current).await {
            SmokeStatus::Passed => {
                debug!(instance = %instance.id, "smoke passed");
                return Ok(current.id);
            }
            SmokeStatus::Failed(reason) => return Err(failure(reason)),
            SmokeStatus::Pending => tokio::time::sleep(poll).await,
        }
    }
}
