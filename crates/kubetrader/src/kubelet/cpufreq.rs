//! Fallback CPU frequency getter.
//!
//! When the kubelet cannot provide the node CPU frequency, a one-shot
//! job pinned to the node reads `/proc/cpuinfo` with a busybox image and
//! the frequency is parsed from the pod log.

use core::error::Error;
use std::time::Duration;

use derive_more::Display;
use error_stack::Report;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::batch::v1::JobSpec;
use k8s_openapi::api::core::v1::Container;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::PodSpec;
use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::DeleteParams;
use kube::api::ListParams;
use kube::api::LogParams;
use kube::api::PostParams;
use kube::Api;
use tracing::debug;
use tracing::warn;
use utils::retry_during;

const JOB_NAME_PREFIX: &str = "kubetrader-cpufreq-";
const WAIT_ATTEMPTS: usize = 30;
const WAIT_TIMEOUT: Duration = Duration::from_secs(90);
const WAIT_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Debug, Display)]
pub enum CpuFreqError {
    #[display("cpufreq job for node {node} failed: {message}")]
    JobFailed { node: String, message: String },
    #[display("cpufreq job log for node {node} had no parsable frequency: {log}")]
    ParseFailed { node: String, log: String },
}

impl Error for CpuFreqError {}

pub struct CpuFreqJob {
    client: kube::Client,
    namespace: String,
    image: String,
}

impl CpuFreqJob {
    pub fn new(client: kube::Client, namespace: String, image: String) -> Self {
        Self {
            client,
            namespace,
            image,
        }
    }

    /// Runs the getter job on the node and returns the parsed frequency
    /// in MHz. The job is deleted afterwards regardless of outcome.
    pub async fn node_frequency_mhz(&self, node: &str) -> Result<f64, Report<CpuFreqError>> {
        let job_name = job_name_for(node);
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), &self.namespace);

        // A leftover job from an aborted run would make create fail.
        let _ = jobs.delete(&job_name, &DeleteParams::background()).await;

        jobs.create(&PostParams::default(), &self.build_job(&job_name, node))
            .await
            .map_err(|e| {
                Report::new(CpuFreqError::JobFailed {
                    node: node.to_string(),
                    message: format!("create failed: {e}"),
                })
            })?;

        let result = self.await_log(&job_name, node).await;

        if let Err(e) = jobs.delete(&job_name, &DeleteParams::background()).await {
            warn!(job = %job_name, "failed to delete cpufreq job: {e}");
        }

        let log = result?;
        parse_frequency_mhz(&log).ok_or_else(|| {
            Report::new(CpuFreqError::ParseFailed {
                node: node.to_string(),
                log,
            })
        })
    }

    async fn await_log(&self, job_name: &str, node: &str) -> Result<String, Report<CpuFreqError>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let selector = format!("job-name={job_name}");

        let log = retry_during(WAIT_ATTEMPTS, WAIT_TIMEOUT, WAIT_INTERVAL, || async {
            let list = pods
                .list(&ListParams::default().labels(&selector))
                .await
                .map_err(|e| format!("listing job pods: {e}"))?;

            let pod = list
                .items
                .iter()
                .find(|p| {
                    p.status
                        .as_ref()
                        .and_then(|s| s.phase.as_deref())
                        .map(|phase| phase == "Succeeded")
                        .unwrap_or(false)
                })
                .ok_or_else(|| "job pod not finished yet".to_string())?;

            let name = pod.metadata.name.clone().unwrap_or_default();
            pods.logs(&name, &LogParams::default())
                .await
                .map_err(|e| format!("reading job pod log: {e}"))
        })
        .await
        .map_err(|e| {
            Report::new(CpuFreqError::JobFailed {
                node: node.to_string(),
                message: e.to_string(),
            })
        })?;

        debug!(node, "cpufreq job log: {}", log.trim());
        Ok(log)
    }

    fn build_job(&self, job_name: &str, node: &str) -> Job {
        Job {
            metadata: ObjectMeta {
                name: Some(job_name.to_string()),
                ..Default::default()
            },
            spec: Some(JobSpec {
                backoff_limit: Some(0),
                ttl_seconds_after_finished: Some(600),
                template: PodTemplateSpec {
                    metadata: None,
                    spec: Some(PodSpec {
                        node_name: Some(node.to_string()),
                        restart_policy: Some("Never".to_string()),
                        containers: vec![Container {
                            name: "cpufreq".to_string(),
                            image: Some(self.image.clone()),
                            command: Some(vec![
                                "sh".to_string(),
                                "-c".to_string(),
                                "grep -i -m1 'cpu mhz' /proc/cpuinfo".to_string(),
                            ]),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            status: None,
        }
    }
}

fn job_name_for(node: &str) -> String {
    let mut name = format!("{JOB_NAME_PREFIX}{node}");
    name.truncate(63);
    name.trim_end_matches('-').to_string()
}

/// Parses a `/proc/cpuinfo` frequency line such as
/// `cpu MHz         : 2400.000`.
fn parse_frequency_mhz(log: &str) -> Option<f64> {
    for line in log.lines() {
        let lower = line.to_ascii_lowercase();
        if !lower.contains("mhz") {
            continue;
        }
        if let Some((_, value)) = line.split_once(':') {
            if let Ok(freq) = value.trim().parse::<f64>() {
                if freq > 0.0 {
                    return Some(freq);
                }
            }
        }
    }
    None
}
