//! Run preparation and launch.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use super::{CallbackToken, ComputeLauncher, DispatchError, LaunchSpec, WorkerHandle};
use crate::contract::{env, ContractError, WorkerContract, WorkerDescriptor};
use crate::ids::RunId;
use crate::provisioner::{grant_for, CapabilityGrant};
use crate::store::OutputLayout;
use crate::template::{CommandContext, CommandRenderer};

/// Per-deployment dispatch settings.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// How long a run may wait for its terminal callback.
    pub callback_timeout: Duration,
    /// Base URL workers post callbacks to, exported as `PG_DD_CALLBACK_URL`.
    pub callback_url: Option<String>,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            callback_timeout: Duration::from_secs(12 * 60 * 60),
            callback_url: None,
        }
    }
}

/// A run that passed every check and is ready to launch.
#[derive(Debug, Clone)]
pub struct PreparedRun {
    pub run_id: RunId,
    pub token: CallbackToken,
    pub descriptor: Arc<WorkerDescriptor>,
    pub grant: Arc<CapabilityGrant>,
    pub spec: LaunchSpec,
}

/// Turns a command list and a contract into a launched worker.
pub struct Dispatcher {
    launcher: Arc<dyn ComputeLauncher>,
    renderer: CommandRenderer,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(launcher: Arc<dyn ComputeLauncher>, settings: DispatchSettings) -> Self {
        Self {
            launcher,
            renderer: CommandRenderer::new(),
            settings,
        }
    }

    pub fn launcher(&self) -> &Arc<dyn ComputeLauncher> {
        &self.launcher
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Validate everything and build the launch spec. No compute is touched.
    pub fn prepare(
        &self,
        commands: Vec<String>,
        contract: WorkerContract,
    ) -> Result<PreparedRun, DispatchError> {
        if commands.is_empty() {
            return Err(ContractError::NoCommands.into());
        }

        let descriptor = Arc::new(contract.freeze()?);
        let run_id = RunId::new();
        let grant = Arc::new(grant_for(&run_id, &descriptor)?);

        let layout = OutputLayout::for_descriptor(&descriptor);
        let output_prefix = layout.run_prefix(&run_id);
        let ctx = CommandContext {
            run_id: run_id.to_string(),
            bucket: descriptor.bucket().to_string(),
            prefix: descriptor.prefix().unwrap_or_default().to_string(),
            scratch_dir: descriptor.scratch().dir.clone(),
            output_prefix: output_prefix.clone(),
        };
        let commands = self.renderer.render_all(&commands, &ctx)?;

        let token = CallbackToken::generate();
        let env = self.environment(&run_id, &token, &descriptor, output_prefix);

        let spec = LaunchSpec {
            run_id,
            commands,
            env,
            descriptor: descriptor.clone(),
            grant: grant.clone(),
            timeout: self.settings.callback_timeout,
        };

        Ok(PreparedRun {
            run_id,
            token,
            descriptor,
            grant,
            spec,
        })
    }

    fn environment(
        &self,
        run_id: &RunId,
        token: &CallbackToken,
        descriptor: &WorkerDescriptor,
        output_prefix: String,
    ) -> BTreeMap<String, String> {
        let mut vars = descriptor.environment();
        vars.insert(env::RUN_ID.to_string(), run_id.to_string());
        vars.insert(env::TASK_TOKEN.to_string(), token.as_str().to_string());
        vars.insert(env::OUTPUT_PREFIX.to_string(), output_prefix);
        if let Some(url) = &self.settings.callback_url {
            vars.insert(env::CALLBACK_URL.to_string(), url.clone());
        }
        vars
    }

    /// Start exactly one worker for a prepared run.
    pub async fn launch(&self, prepared: &PreparedRun) -> Result<WorkerHandle, DispatchError> {
        tracing::info!(
            run_id = %prepared.run_id,
            launcher = self.launcher.kind(),
            commands = ?prepared.spec.commands,
            "Launching worker"
        );

        match self.launcher.launch(&prepared.spec).await {
            Ok(handle) => {
                tracing::info!(run_id = %prepared.run_id, worker = %handle.name, "Worker launched");
                Ok(handle)
            }
            Err(e) => {
                tracing::error!(run_id = %prepared.run_id, error = %e, "Worker launch failed");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{DatabaseExport, OutputLocation};
    use crate::dispatch::WorkerExit;
    use async_trait::async_trait;

    struct NeverLauncher;

    #[async_trait]
    impl ComputeLauncher for NeverLauncher {
        fn kind(&self) -> &'static str {
            "never"
        }

        async fn launch(&self, _spec: &LaunchSpec) -> Result<WorkerHandle, DispatchError> {
            Err(DispatchError::Capacity("none".to_string()))
        }

        async fn wait(&self, _handle: &WorkerHandle) -> WorkerExit {
            WorkerExit::Lost {
                reason: "never launched".to_string(),
            }
        }

        async fn terminate(&self, _handle: &WorkerHandle) -> Result<(), DispatchError> {
            Ok(())
        }
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(
            Arc::new(NeverLauncher),
            DispatchSettings {
                callback_url: Some("http://control-plane:8082/api/callbacks".to_string()),
                ..Default::default()
            },
        )
    }

    fn contract() -> WorkerContract {
        WorkerContract {
            databases: vec![DatabaseExport::new("db", "SELECT 1", "t1")],
            secret: Some(
                "arn:aws:secretsmanager:ap-southeast-2:123456789012:secret:rds".to_string(),
            ),
            output: OutputLocation {
                bucket: Some("bucket".to_string()),
                prefix: Some("pg-dd".to_string()),
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_prepare_builds_environment() {
        let prepared = dispatcher()
            .prepare(vec!["upload".to_string()], contract())
            .unwrap();
        let env = &prepared.spec.env;

        assert_eq!(env.get("PG_DD_RUN_ID").unwrap(), &prepared.run_id.to_string());
        assert_eq!(env.get("PG_DD_TASK_TOKEN").unwrap(), prepared.token.as_str());
        assert_eq!(
            env.get("PG_DD_OUTPUT_PREFIX").unwrap(),
            &format!("pg-dd/{}", prepared.run_id)
        );
        assert_eq!(
            env.get("PG_DD_CALLBACK_URL").unwrap(),
            "http://control-plane:8082/api/callbacks"
        );
        assert_eq!(env.get("PG_DD_DATABASE_DB_SQL_DUMP").unwrap(), "SELECT 1");
        assert!(prepared.spec.public_env().all(|(k, _)| k != "PG_DD_TASK_TOKEN"));
    }

    #[test]
    fn test_prepare_renders_commands() {
        let prepared = dispatcher()
            .prepare(vec!["--out={{ output_prefix }}".to_string()], contract())
            .unwrap();
        assert_eq!(
            prepared.spec.commands,
            vec![format!("--out=pg-dd/{}", prepared.run_id)]
        );
    }

    #[test]
    fn test_prepare_rejects_empty_commands() {
        let err = dispatcher().prepare(vec![], contract()).unwrap_err();
        assert!(matches!(err, DispatchError::Contract(ContractError::NoCommands)));
    }

    #[test]
    fn test_prepare_rejects_incomplete_contract() {
        let mut c = contract();
        c.databases[0].destination = None;
        let err = dispatcher().prepare(vec!["upload".to_string()], c).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_prepared_runs_get_fresh_tokens() {
        let d = dispatcher();
        let a = d.prepare(vec!["upload".to_string()], contract()).unwrap();
        let b = d.prepare(vec!["upload".to_string()], contract()).unwrap();
        assert_ne!(a.run_id, b.run_id);
        assert!(!a.token.matches(b.token.as_str()));
    }

    #[tokio::test]
    async fn test_launch_propagates_capacity_error() {
        let d = dispatcher();
        let prepared = d.prepare(vec!["upload".to_string()], contract()).unwrap();
        let err = d.launch(&prepared).await.unwrap_err();
        assert!(matches!(err, DispatchError::Capacity(_)));
    }
}
