//! Shared wiring for every command: config, state store and backends.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Args, ValueEnum};
use tracing::debug;

use asiaq_config::{AsiaqConfig, PipelineSpec};
use asiaq_core::StdRandom;
use asiaq_rollout::{DeploymentOrchestrator, LocalExec, RemoteExec, SshExec};
use asiaq_scheduler::{
    EnvironmentManager, LocalCloud, ProvisioningScheduler, SmokeProbe, SshProbe, StatusProbe,
};
use asiaq_state::{EnvironmentRegistry, StateStore};

const STATE_FILE: &str = "asiaq.redb";
const DEFAULT_CONFIG: &str = "asiaq.toml";

/// How smoke checks and integration tests reach instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExecMode {
    /// Instance status from the state store; tests run on this machine.
    Local,
    /// Over ssh to each instance's private address.
    Ssh,
}

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Configuration file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG)]
    pub config: PathBuf,

    /// Directory holding the state database.
    #[arg(long, global = true, default_value = ".asiaq")]
    pub data_dir: PathBuf,

    /// Environment to operate on (default: [asiaq] default_environment).
    #[arg(long, global = true)]
    pub env: Option<String>,

    /// Log at debug level.
    #[arg(long, global = true)]
    pub debug: bool,

    /// Smoke and integration test transport.
    #[arg(long, global = true, value_enum, default_value_t = ExecMode::Local)]
    pub exec: ExecMode,
}

/// Everything a command needs, opened once per invocation.
pub struct App {
    pub config: AsiaqConfig,
    pub store: StateStore,
    pub cloud: Arc<LocalCloud>,
    env: Option<String>,
    exec: ExecMode,
}

impl App {
    pub fn open(opts: &GlobalOpts) -> anyhow::Result<Self> {
        let config = load_config(&opts.config)?;
        std::fs::create_dir_all(&opts.data_dir)
            .with_context(|| format!("creating data dir {}", opts.data_dir.display()))?;
        let db = opts.data_dir.join(STATE_FILE);
        let store = StateStore::open(&db).with_context(|| format!("opening {}", db.display()))?;
        debug!(config = %opts.config.display(), db = %db.display(), "state opened");

        Ok(Self {
            config,
            cloud: Arc::new(LocalCloud::new(store.clone())),
            store,
            env: opts.env.clone(),
            exec: opts.exec,
        })
    }

    /// The target environment: `--env`, else the configured default.
    pub fn environment(&self) -> anyhow::Result<String> {
        if let Some(env) = &self.env {
            return Ok(env.clone());
        }
        match self.config.settings(None)?.default_environment {
            Some(env) => Ok(env),
            None => bail!("no environment given: pass --env or set [asiaq] default_environment"),
        }
    }

    pub fn manager(&self) -> EnvironmentManager {
        EnvironmentManager::new(
            EnvironmentRegistry::new(self.store.clone()),
            self.cloud.clone(),
            self.config.clone(),
        )
    }

    pub fn scheduler(&self) -> anyhow::Result<Arc<ProvisioningScheduler>> {
        let probe: Arc<dyn SmokeProbe> = match self.exec {
            ExecMode::Local => Arc::new(StatusProbe::new(self.store.clone())),
            ExecMode::Ssh => {
                let settings = self.config.settings(self.env.as_deref())?;
                Arc::new(SshProbe::new(&settings.ssh_user, "true"))
            }
        };
        Ok(Arc::new(ProvisioningScheduler::new(
            self.cloud.clone(),
            probe,
            self.store.clone(),
            self.config.clone(),
        )))
    }

    pub fn orchestrator(&self) -> anyhow::Result<DeploymentOrchestrator> {
        let settings = self.config.settings(self.env.as_deref())?;
        let remote: Arc<dyn RemoteExec> = match self.exec {
            ExecMode::Local => Arc::new(LocalExec::new(settings.smoke_timeout)),
            ExecMode::Ssh => Arc::new(SshExec::new(settings.smoke_timeout)),
        };
        Ok(DeploymentOrchestrator::new(
            self.scheduler()?,
            remote,
            Box::new(StdRandom::from_os()),
        ))
    }
}

/// The config file, or built-in defaults when the default path is absent.
fn load_config(path: &Path) -> anyhow::Result<AsiaqConfig> {
    if path.exists() {
        return AsiaqConfig::from_file(path).with_context(|| format!("loading {}", path.display()));
    }
    if path != Path::new(DEFAULT_CONFIG) {
        bail!("config file not found: {}", path.display());
    }
    debug!("no {DEFAULT_CONFIG}, using defaults");
    Ok(AsiaqConfig::default())
}

pub fn load_pipeline(path: &Path, hostclasses: &[String]) -> anyhow::Result<PipelineSpec> {
    let pipeline =
        PipelineSpec::from_file(path).with_context(|| format!("loading pipeline {}", path.display()))?;
    if hostclasses.is_empty() {
        return Ok(pipeline);
    }
    let restricted = pipeline.restricted_to(hostclasses);
    if restricted.is_empty() {
        bail!("none of {} in {}", hostclasses.join(", "), path.display());
    }
    Ok(restricted)
}
