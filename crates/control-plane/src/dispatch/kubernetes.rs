//! Kubernetes Job launcher.
//!
//! Each run becomes one `batch/v1` Job with `backoffLimit: 0` and
//! `parallelism: 1`, so the platform never starts a second worker. The
//! callback token travels in a per-run Secret rather than in the Job spec.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, EnvVarSource, Pod, PodSpec, PodTemplateSpec,
    ResourceRequirements, Secret, SecretKeySelector, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, PostParams};
use kube::runtime::wait::await_condition;
use kube::Client;
use serde::Deserialize;

use super::{ComputeLauncher, DispatchError, LaunchSpec, WorkerExit, WorkerHandle};
use crate::contract::env;

const RUN_ID_LABEL: &str = "pg-dd.io/run-id";
const SUBNET_LABEL: &str = "pg-dd.io/subnet";
const GRANT_ANNOTATION: &str = "pg-dd.io/capability-grant";
const SECURITY_GROUPS_ANNOTATION: &str = "pg-dd.io/security-groups";
const CONTAINER_NAME: &str = "worker";
const SCRATCH_VOLUME: &str = "tmp";
const TOKEN_KEY: &str = "task-token";

/// Kubernetes placement settings.
#[derive(Debug, Clone, Deserialize)]
pub struct KubernetesSettings {
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Worker container image.
    #[serde(default = "default_image")]
    pub image: String,

    /// Execution identity of the worker pod.
    #[serde(default)]
    pub service_account: Option<String>,

    #[serde(default = "default_pull_policy")]
    pub image_pull_policy: String,

    /// How long finished Jobs are kept for inspection.
    #[serde(default = "default_ttl")]
    pub ttl_seconds_after_finished: i32,
}

fn default_namespace() -> String {
    "pg-dd".to_string()
}

fn default_image() -> String {
    "ghcr.io/umccr/pg-dd:latest".to_string()
}

fn default_pull_policy() -> String {
    "IfNotPresent".to_string()
}

fn default_ttl() -> i32 {
    3600
}

impl Default for KubernetesSettings {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            image: default_image(),
            service_account: None,
            image_pull_policy: default_pull_policy(),
            ttl_seconds_after_finished: default_ttl(),
        }
    }
}

impl KubernetesSettings {
    /// Load from `PG_DD_NAMESPACE`, `PG_DD_IMAGE`, `PG_DD_SERVICE_ACCOUNT`,
    /// `PG_DD_IMAGE_PULL_POLICY` and `PG_DD_TTL_SECONDS_AFTER_FINISHED`.
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("PG_DD_").from_env::<KubernetesSettings>()
    }
}

/// Launches workers as Kubernetes Jobs.
pub struct KubernetesLauncher {
    client: Client,
    settings: KubernetesSettings,
}

impl KubernetesLauncher {
    /// Connect using the in-cluster or kubeconfig defaults.
    pub async fn connect(settings: KubernetesSettings) -> Result<Self, kube::Error> {
        let client = Client::try_default().await?;
        Ok(Self::with_client(client, settings))
    }

    pub fn with_client(client: Client, settings: KubernetesSettings) -> Self {
        Self { client, settings }
    }

    fn jobs(&self) -> Api<Job> {
        Api::namespaced(self.client.clone(), &self.settings.namespace)
    }

    fn secrets(&self) -> Api<Secret> {
        Api::namespaced(self.client.clone(), &self.settings.namespace)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.settings.namespace)
    }

    async fn delete_token_secret(&self, job_name: &str) {
        let name = secret_name(job_name);
        if let Err(e) = self.secrets().delete(&name, &DeleteParams::default()).await {
            if !is_not_found(&e) {
                tracing::warn!(secret = %name, error = %e, "Failed to delete token secret");
            }
        }
    }

    /// Inspect the Job's pod to find out how the worker ended.
    async fn resolve_exit(&self, job_name: &str, job: Option<Job>) -> WorkerExit {
        let Some(job) = job else {
            return WorkerExit::Lost {
                reason: format!("job {job_name} was deleted"),
            };
        };

        let lp = ListParams::default().labels(&format!("job-name={job_name}"));
        match self.pods().list(&lp).await {
            Ok(pods) => {
                if let Some(exit) = pods.items.iter().find_map(pod_exit) {
                    return exit;
                }
            }
            Err(e) => {
                tracing::warn!(job = %job_name, error = %e, "Failed to list worker pods");
            }
        }

        job_exit(&job)
    }
}

fn job_name(spec: &LaunchSpec) -> String {
    format!("pg-dd-{}", spec.run_id)
}

fn secret_name(job_name: &str) -> String {
    format!("{job_name}-token")
}

fn job_finished(job: Option<&Job>) -> bool {
    match job {
        None => true,
        Some(job) => job.status.as_ref().is_some_and(|s| {
            s.succeeded.unwrap_or(0) > 0 || s.failed.unwrap_or(0) > 0
        }),
    }
}

fn pod_exit(pod: &Pod) -> Option<WorkerExit> {
    let status = pod.status.as_ref()?;
    if status.reason.as_deref() == Some("Evicted") {
        return Some(WorkerExit::Evicted {
            reason: status.message.clone().unwrap_or_else(|| "evicted".to_string()),
        });
    }

    status
        .container_statuses
        .as_ref()?
        .iter()
        .find(|c| c.name == CONTAINER_NAME)
        .and_then(|c| c.state.as_ref()?.terminated.as_ref())
        .map(|t| WorkerExit::Exited { code: t.exit_code })
}

fn job_exit(job: &Job) -> WorkerExit {
    let status = job.status.as_ref();
    if status.and_then(|s| s.succeeded).unwrap_or(0) > 0 {
        return WorkerExit::Exited { code: 0 };
    }

    let reason = status
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conditions| conditions.iter().find(|c| c.type_ == "Failed"))
        .map(|c| {
            format!(
                "{}: {}",
                c.reason.as_deref().unwrap_or("Failed"),
                c.message.as_deref().unwrap_or("job failed")
            )
        })
        .unwrap_or_else(|| "job failed without a terminated pod".to_string());

    WorkerExit::Lost { reason }
}

fn is_not_found(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(resp) if resp.code == 404)
}

fn map_kube_error(e: kube::Error) -> DispatchError {
    match e {
        kube::Error::Api(resp) if resp.code == 429 => DispatchError::Capacity(resp.message),
        kube::Error::Api(resp) if resp.code == 403 && resp.message.contains("quota") => {
            DispatchError::Capacity(resp.message)
        }
        kube::Error::Api(resp) => {
            DispatchError::Launch(format!("{} ({} {})", resp.message, resp.code, resp.reason))
        }
        other => DispatchError::Network(other.to_string()),
    }
}

fn quantities(spec: &LaunchSpec) -> BTreeMap<String, Quantity> {
    let compute = spec.descriptor.compute();
    let scratch = spec.descriptor.scratch();
    BTreeMap::from([
        ("cpu".to_string(), Quantity(format!("{}m", compute.millicores()))),
        ("memory".to_string(), Quantity(format!("{}Mi", compute.memory_mib))),
        (
            "ephemeral-storage".to_string(),
            Quantity(format!("{}Gi", scratch.size_gib)),
        ),
    ])
}

/// Build the per-run token Secret.
fn build_secret(spec: &LaunchSpec, namespace: &str, job_name: &str) -> Secret {
    let token = spec.task_token().unwrap_or_default().to_string();
    Secret {
        metadata: ObjectMeta {
            name: Some(secret_name(job_name)),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                RUN_ID_LABEL.to_string(),
                spec.run_id.to_string(),
            )])),
            ..Default::default()
        },
        string_data: Some(BTreeMap::from([(TOKEN_KEY.to_string(), token)])),
        ..Default::default()
    }
}

/// Build the Job for a run.
fn build_job(spec: &LaunchSpec, settings: &KubernetesSettings, job_name: &str) -> Job {
    let descriptor = &spec.descriptor;
    let network = descriptor.network();

    let labels = BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), "pg-dd".to_string()),
        (RUN_ID_LABEL.to_string(), spec.run_id.to_string()),
        (SUBNET_LABEL.to_string(), network.subnet.as_str().to_string()),
    ]);

    let mut annotations = BTreeMap::from([(
        GRANT_ANNOTATION.to_string(),
        spec.grant.policy_document().to_string(),
    )]);
    if !network.security_groups.is_empty() {
        annotations.insert(
            SECURITY_GROUPS_ANNOTATION.to_string(),
            network.security_groups.join(","),
        );
    }

    let mut env_vars: Vec<EnvVar> = spec
        .public_env()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..Default::default()
        })
        .collect();
    env_vars.push(EnvVar {
        name: env::TASK_TOKEN.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret_name(job_name),
                key: TOKEN_KEY.to_string(),
                optional: Some(false),
            }),
            ..Default::default()
        }),
        ..Default::default()
    });

    let scratch = descriptor.scratch();
    let resources = quantities(spec);
    let stop_grace = descriptor.stop_timeout().as_secs() as i64;

    Job {
        metadata: ObjectMeta {
            name: Some(job_name.to_string()),
            namespace: Some(settings.namespace.clone()),
            labels: Some(labels.clone()),
            annotations: Some(annotations.clone()),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            parallelism: Some(1),
            completions: Some(1),
            ttl_seconds_after_finished: Some(settings.ttl_seconds_after_finished),
            active_deadline_seconds: Some(spec.timeout.as_secs() as i64 + stop_grace),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: Some(annotations),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    service_account_name: settings.service_account.clone(),
                    termination_grace_period_seconds: Some(stop_grace),
                    node_selector: Some(BTreeMap::from([(
                        "kubernetes.io/arch".to_string(),
                        descriptor.compute().architecture.node_label().to_string(),
                    )])),
                    containers: vec![Container {
                        name: CONTAINER_NAME.to_string(),
                        image: Some(settings.image.clone()),
                        image_pull_policy: Some(settings.image_pull_policy.clone()),
                        args: Some(spec.commands.clone()),
                        env: Some(env_vars),
                        resources: Some(ResourceRequirements {
                            requests: Some(resources.clone()),
                            limits: Some(resources),
                            ..Default::default()
                        }),
                        security_context: Some(SecurityContext {
                            read_only_root_filesystem: Some(true),
                            allow_privilege_escalation: Some(false),
                            ..Default::default()
                        }),
                        volume_mounts: Some(vec![VolumeMount {
                            name: SCRATCH_VOLUME.to_string(),
                            mount_path: scratch.dir.clone(),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    volumes: Some(vec![Volume {
                        name: SCRATCH_VOLUME.to_string(),
                        empty_dir: Some(EmptyDirVolumeSource {
                            size_limit: Some(Quantity(format!("{}Gi", scratch.size_gib))),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[async_trait]
impl ComputeLauncher for KubernetesLauncher {
    fn kind(&self) -> &'static str {
        "kubernetes"
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<WorkerHandle, DispatchError> {
        let name = job_name(spec);
        let pp = PostParams::default();

        let secret = build_secret(spec, &self.settings.namespace, &name);
        self.secrets()
            .create(&pp, &secret)
            .await
            .map_err(map_kube_error)?;

        let job = build_job(spec, &self.settings, &name);
        if let Err(e) = self.jobs().create(&pp, &job).await {
            self.delete_token_secret(&name).await;
            return Err(map_kube_error(e));
        }

        tracing::debug!(
            job = %name,
            namespace = %self.settings.namespace,
            image = %self.settings.image,
            "Created worker job"
        );

        Ok(WorkerHandle {
            run_id: spec.run_id,
            name,
        })
    }

    async fn wait(&self, handle: &WorkerHandle) -> WorkerExit {
        let finished = await_condition(self.jobs(), &handle.name, job_finished).await;
        let exit = match finished {
            Ok(job) => self.resolve_exit(&handle.name, job).await,
            Err(e) => WorkerExit::Lost {
                reason: format!("watch failed: {e}"),
            },
        };
        self.delete_token_secret(&handle.name).await;
        exit
    }

    async fn terminate(&self, handle: &WorkerHandle) -> Result<(), DispatchError> {
        let result = self
            .jobs()
            .delete(&handle.name, &DeleteParams::background())
            .await;
        self.delete_token_secret(&handle.name).await;

        match result {
            Ok(_) => {
                tracing::info!(job = %handle.name, "Deleted worker job");
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(DispatchError::Terminate(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{DatabaseExport, OutputLocation, WorkerContract};
    use crate::ids::RunId;
    use crate::provisioner::grant_for;
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateTerminated, ContainerStatus, PodStatus,
    };
    use std::sync::Arc;
    use std::time::Duration;

    fn launch_spec() -> LaunchSpec {
        let descriptor = WorkerContract {
            databases: vec![DatabaseExport::new("db", "SELECT 1", "t1")],
            secret: Some(
                "arn:aws:secretsmanager:ap-southeast-2:123456789012:secret:rds".to_string(),
            ),
            output: OutputLocation {
                bucket: Some("bucket".to_string()),
                prefix: None,
            },
            ..Default::default()
        }
        .freeze()
        .unwrap();
        let run_id = RunId::new();
        let grant = grant_for(&run_id, &descriptor).unwrap();
        let mut env = descriptor.environment();
        env.insert("PG_DD_TASK_TOKEN".to_string(), "secret-token".to_string());

        LaunchSpec {
            run_id,
            commands: vec!["upload".to_string()],
            env,
            descriptor: Arc::new(descriptor),
            grant: Arc::new(grant),
            timeout: Duration::from_secs(43200),
        }
    }

    #[test]
    fn test_build_job_shape() {
        let spec = launch_spec();
        let name = job_name(&spec);
        let job = build_job(&spec, &KubernetesSettings::default(), &name);

        let job_spec = job.spec.as_ref().unwrap();
        assert_eq!(job_spec.backoff_limit, Some(0));
        assert_eq!(job_spec.parallelism, Some(1));
        assert_eq!(job_spec.active_deadline_seconds, Some(43200 + 120));

        let pod = job_spec.template.spec.as_ref().unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
        assert_eq!(pod.termination_grace_period_seconds, Some(120));
        assert_eq!(
            pod.node_selector.as_ref().unwrap().get("kubernetes.io/arch").unwrap(),
            "arm64"
        );

        let container = &pod.containers[0];
        assert_eq!(container.args.as_ref().unwrap(), &vec!["upload".to_string()]);
        let limits = container.resources.as_ref().unwrap().limits.as_ref().unwrap();
        assert_eq!(limits.get("cpu").unwrap().0, "250m");
        assert_eq!(limits.get("memory").unwrap().0, "1024Mi");
        assert_eq!(limits.get("ephemeral-storage").unwrap().0, "100Gi");
        assert_eq!(
            container
                .security_context
                .as_ref()
                .unwrap()
                .read_only_root_filesystem,
            Some(true)
        );
        assert_eq!(container.volume_mounts.as_ref().unwrap()[0].mount_path, "/tmp");
    }

    #[test]
    fn test_build_job_keeps_token_out_of_spec() {
        let spec = launch_spec();
        let name = job_name(&spec);
        let job = build_job(&spec, &KubernetesSettings::default(), &name);

        let serialized = serde_json::to_string(&job).unwrap();
        assert!(!serialized.contains("secret-token"));

        let env = job.spec.unwrap().template.spec.unwrap().containers[0]
            .env
            .clone()
            .unwrap();
        let token_var = env.iter().find(|e| e.name == "PG_DD_TASK_TOKEN").unwrap();
        let selector = token_var
            .value_from
            .as_ref()
            .unwrap()
            .secret_key_ref
            .as_ref()
            .unwrap();
        assert_eq!(selector.name, secret_name(&name));

        let secret = build_secret(&spec, "pg-dd", &name);
        assert_eq!(
            secret.string_data.unwrap().get(TOKEN_KEY).unwrap(),
            "secret-token"
        );
    }

    #[test]
    fn test_build_job_attaches_grant() {
        let spec = launch_spec();
        let name = job_name(&spec);
        let job = build_job(&spec, &KubernetesSettings::default(), &name);
        let annotations = job.metadata.annotations.unwrap();
        let grant: serde_json::Value =
            serde_json::from_str(annotations.get(GRANT_ANNOTATION).unwrap()).unwrap();
        assert_eq!(grant["Statement"].as_array().unwrap().len(), 3);
        assert_eq!(
            job.metadata.labels.unwrap().get(RUN_ID_LABEL).unwrap(),
            &spec.run_id.to_string()
        );
    }

    #[test]
    fn test_job_finished() {
        assert!(job_finished(None));
        assert!(!job_finished(Some(&Job::default())));
    }

    #[test]
    fn test_pod_exit_from_terminated_container() {
        let pod = Pod {
            status: Some(PodStatus {
                container_statuses: Some(vec![ContainerStatus {
                    name: CONTAINER_NAME.to_string(),
                    state: Some(ContainerState {
                        terminated: Some(ContainerStateTerminated {
                            exit_code: 2,
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(pod_exit(&pod), Some(WorkerExit::Exited { code: 2 }));
    }

    #[test]
    fn test_pod_exit_evicted() {
        let pod = Pod {
            status: Some(PodStatus {
                reason: Some("Evicted".to_string()),
                message: Some("node low on ephemeral-storage".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(matches!(pod_exit(&pod), Some(WorkerExit::Evicted { .. })));
    }
}
