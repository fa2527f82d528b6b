//! Container-job (Kubernetes) Workload Executor adapter.
//!
//! Submits a batch `Job` for each node, follows its pod's log stream, and
//! parses each line per the shared [`crate::log_follow`] contract. On
//! `CancelNode`, deletes the job (and its pods, via `propagation_policy`).
//!
//! The Kubernetes control plane itself is out of scope here — this adapter
//! only ever speaks through `kube::Api<Job>`/`kube::Api<Pod>`, never
//! reimplements scheduling, and treats the cluster as an opaque workload
//! runner.

use crate::error::ExecutorError;
use crate::executor::{NodeHandle, NodeOutcome, TerminalNodeStatus, WorkloadExecutor};
use crate::log_follow;
use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, EnvVar, Pod, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{DeleteParams, ListParams, LogParams, Api, PostParams, Preconditions, PropagationPolicy};
use mentatlab_core::RunId;
use mentatlab_plan::NodeSpec;
use mentatlab_runstore::RunStore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Configuration for the container-job adapter.
#[derive(Debug, Clone)]
pub struct ContainerJobConfig {
    /// Namespace jobs are submitted into.
    pub namespace: String,
    /// Prefix applied to generated job names (`{prefix}-{runId}-{nodeID}`).
    pub job_name_prefix: String,
}

impl ContainerJobConfig {
    /// Creates a config for `namespace` with the default job name prefix.
    #[must_use]
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            job_name_prefix: "mentatlab-node".to_string(),
        }
    }

    fn job_name(&self, run_id: RunId, node: &NodeSpec) -> String {
        let raw = format!("{}-{run_id}-{}", self.job_name_prefix, node.id);
        raw.to_lowercase().replace(['_', ':'], "-")
    }
}

struct Handle {
    job_name: String,
    join: JoinHandle<Result<NodeOutcome, ExecutorError>>,
}

/// The Kubernetes [`WorkloadExecutor`] adapter.
pub struct ContainerJobExecutor {
    client: kube::Client,
    config: ContainerJobConfig,
    run_store: Arc<dyn RunStore>,
}

impl ContainerJobExecutor {
    /// Creates an adapter using `client` to talk to the cluster.
    #[must_use]
    pub fn new(client: kube::Client, config: ContainerJobConfig, run_store: Arc<dyn RunStore>) -> Self {
        Self {
            client,
            config,
            run_store,
        }
    }

    fn build_job(&self, job_name: &str, node: &NodeSpec, env: HashMap<String, String>) -> Job {
        let image = node.image.clone().unwrap_or_else(|| "busybox:latest".to_string());
        let command = node.command.clone();
        let env_vars: Vec<EnvVar> = env
            .into_iter()
            .map(|(name, value)| EnvVar {
                name,
                value: Some(value),
                ..Default::default()
            })
            .collect();

        Job {
            metadata: ObjectMeta {
                name: Some(job_name.to_string()),
                labels: Some(
                    [("app.kubernetes.io/managed-by".to_string(), "mentatlab".to_string())]
                        .into_iter()
                        .collect(),
                ),
                ..Default::default()
            },
            spec: Some(JobSpec {
                backoff_limit: Some(0), // the scheduler owns retries, not Kubernetes
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        restart_policy: Some("Never".to_string()),
                        containers: vec![Container {
                            name: "node".to_string(),
                            image: Some(image),
                            command,
                            env: Some(env_vars),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Waits for the job's pod to appear, then returns its name.
    async fn wait_for_pod(pods: &Api<Pod>, job_name: &str) -> Result<String, ExecutorError> {
        let list_params = ListParams::default().labels(&format!("job-name={job_name}"));
        for _ in 0..300 {
            let list = pods.list(&list_params).await.map_err(|e| {
                ExecutorError::StartFailed(format!("listing pods for job {job_name}: {e}"))
            })?;
            if let Some(pod) = list.items.into_iter().next() {
                if let Some(name) = pod.metadata.name {
                    return Ok(name);
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }
        Err(ExecutorError::StartFailed(format!(
            "no pod appeared for job {job_name} within timeout"
        )))
    }
}

#[async_trait]
impl WorkloadExecutor for ContainerJobExecutor {
    async fn start_node(
        &self,
        run_id: RunId,
        node: &NodeSpec,
        env: HashMap<String, String>,
    ) -> Result<NodeHandle, ExecutorError> {
        let job_name = self.config.job_name(run_id, node);
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let job = self.build_job(&job_name, node, env);
        jobs.create(&PostParams::default(), &job)
            .await
            .map_err(|e| ExecutorError::StartFailed(format!("creating job {job_name}: {e}")))?;

        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        let client = self.client.clone();
        let namespace = self.config.namespace.clone();
        let node_id = node.id.to_string();
        let run_store = Arc::clone(&self.run_store);
        let job_name_owned = job_name.clone();

        let join = tokio::spawn(async move {
            let jobs: Api<Job> = Api::namespaced(client.clone(), &namespace);
            let pods: Api<Pod> = Api::namespaced(client.clone(), &namespace);

            let pod_name = tokio::select! {
                biased;
                _ = &mut cancel_rx => {
                    return Ok(NodeOutcome { status: TerminalNodeStatus::Cancelled, error: None, result: None });
                }
                result = Self::wait_for_pod(&pods, &job_name_owned) => result?,
            };

            let log_params = LogParams {
                follow: true,
                ..Default::default()
            };
            match pods.log_stream(&pod_name, &log_params).await {
                Ok(stream) => {
                    let reader = tokio_util_compat(stream);
                    tokio::select! {
                        biased;
                        _ = &mut cancel_rx => {
                            let _ = jobs
                                .delete(
                                    &job_name_owned,
                                    &DeleteParams {
                                        propagation_policy: Some(PropagationPolicy::Foreground),
                                        preconditions: None::<Preconditions>,
                                        ..Default::default()
                                    },
                                )
                                .await;
                            return Ok(NodeOutcome { status: TerminalNodeStatus::Cancelled, error: None, result: None });
                        }
                        () = log_follow::follow_stdout(&run_store, run_id, &node_id, reader) => {}
                    }
                }
                Err(e) => {
                    tracing::warn!(job = %job_name_owned, error = %e, "could not attach to pod log stream");
                }
            }

            // Poll job status until it reaches a terminal condition.
            loop {
                let current = jobs.get(&job_name_owned).await.map_err(|e| {
                    ExecutorError::WaitFailed(format!("getting job {job_name_owned}: {e}"))
                })?;
                let status = current.status.unwrap_or_default();
                if status.succeeded.unwrap_or(0) > 0 {
                    return Ok(NodeOutcome {
                        status: TerminalNodeStatus::Succeeded,
                        error: None,
                        result: None,
                    });
                }
                if status.failed.unwrap_or(0) > 0 {
                    let message = status
                        .conditions
                        .unwrap_or_default()
                        .into_iter()
                        .find(|c| c.type_ == "Failed")
                        .and_then(|c| c.message)
                        .unwrap_or_else(|| "job failed".to_string());
                    return Ok(NodeOutcome {
                        status: TerminalNodeStatus::Failed,
                        error: Some(message),
                        result: None,
                    });
                }
                tokio::select! {
                    biased;
                    _ = &mut cancel_rx => {
                        let _ = jobs
                            .delete(
                                &job_name_owned,
                                &DeleteParams {
                                    propagation_policy: Some(PropagationPolicy::Foreground),
                                    preconditions: None::<Preconditions>,
                                    ..Default::default()
                                },
                            )
                            .await;
                        return Ok(NodeOutcome { status: TerminalNodeStatus::Cancelled, error: None, result: None });
                    }
                    () = tokio::time::sleep(std::time::Duration::from_millis(500)) => {}
                }
            }
        });

        Ok(NodeHandle::new(
            Handle {
                job_name,
                join,
            },
            cancel_tx,
        ))
    }

    async fn wait_node(&self, handle: &NodeHandle) -> Result<NodeOutcome, ExecutorError> {
        let Handle { join, .. } = handle.take_payload::<Handle>().ok_or_else(|| {
            ExecutorError::WaitFailed("handle already waited on or from a different adapter".to_string())
        })?;
        join.await
            .map_err(|e| ExecutorError::WaitFailed(format!("job watcher task panicked: {e}")))?
    }

    async fn cancel_node(&self, handle: &NodeHandle) {
        handle.signal_cancel();
    }
}

/// Adapts kube's byte stream into an `AsyncRead` the shared log-follower
/// understands.
fn tokio_util_compat(
    stream: impl tokio_stream::Stream<Item = kube::Result<bytes::Bytes>> + Unpin,
) -> impl tokio::io::AsyncRead + Unpin {
    tokio_util::io::StreamReader::new(tokio_stream::StreamExt::map(stream, |item| {
        item.map_err(std::io::Error::other)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_name_is_lowercase_and_stable() {
        let config = ContainerJobConfig::new("default");
        let run_id = RunId::new();
        let node = NodeSpec::builtin("Fetch_Data", vec!["echo".to_string(), "hi".to_string()]);
        let name = config.job_name(run_id, &node);
        assert_eq!(name, name.to_lowercase());
        assert!(!name.contains('_'));
    }
}
