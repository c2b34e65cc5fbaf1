use std::path::PathBuf;

use clap::{Parser, Subcommand};

use asiaq_core::ImageStage;
use asiaq_rollout::DeployFilter;
use asiaq_scheduler::RunOptions;

mod commands;

use commands::context::{App, GlobalOpts};
use commands::deploy::Mode;
use commands::provision::Overrides;

#[derive(Parser)]
#[command(
    name = "asiaq",
    about = "Asiaq: environments, ordered provisioning, deployments and chaos",
    version,
    propagate_version = true,
)]
struct Cli {
    #[command(flatten)]
    global: GlobalOpts,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create, update, destroy and list environments
    Environment {
        #[command(subcommand)]
        action: EnvironmentAction,
    },
    /// Launch or resize the group of a single hostclass.
    ///
    /// Sizes take a bare count or `count@cron` segments joined by `:`,
    /// e.g. `1@0 20 * * *:3@0 8 * * *`.
    Provision {
        #[arg(long)]
        hostclass: String,
        #[arg(long)]
        min_size: Option<String>,
        #[arg(long)]
        desired_size: Option<String>,
        #[arg(long)]
        max_size: Option<String>,
        /// Pin an image instead of the newest one at the configured stage.
        #[arg(long)]
        ami: Option<String>,
        #[arg(long)]
        instance_type: Option<String>,
        #[arg(long)]
        extra_disk: Option<u32>,
        #[arg(long)]
        iops: Option<u32>,
        #[arg(long)]
        no_smoke_test: bool,
        /// Keep a failed group for investigation.
        #[arg(long)]
        no_destroy: bool,
    },
    /// Provision every hostclass of a pipeline, one sequence at a time
    Spinup {
        #[arg(long)]
        pipeline: PathBuf,
        /// Only these hostclasses (repeatable).
        #[arg(long)]
        hostclass: Vec<String>,
        #[arg(long)]
        no_smoke_test: bool,
        #[arg(long)]
        no_destroy: bool,
    },
    /// Destroy the groups of a pipeline, last sequence first
    Spindown {
        #[arg(long)]
        pipeline: PathBuf,
        #[arg(long)]
        hostclass: Vec<String>,
    },
    /// Test or roll out new images
    Deploy {
        #[command(subcommand)]
        action: DeployAction,
    },
    /// Terminate a random share of running instances
    Chaos {
        /// Percentage of eligible instances to kill.
        #[arg(long, default_value_t = 1.0)]
        level: f64,
        /// Percentage of each group that survives.
        #[arg(long, default_value_t = 0.0)]
        retainage: f64,
        #[arg(long)]
        dry_run: bool,
    },
    /// Record and list baked images
    Image {
        #[command(subcommand)]
        action: ImageAction,
    },
    /// Record and list hostclass data-disk snapshots
    Snapshot {
        #[command(subcommand)]
        action: SnapshotAction,
    },
}

#[derive(Subcommand)]
enum EnvironmentAction {
    /// Allocate address space and register a new environment
    Create {
        /// Environment name (default: --env).
        name: Option<String>,
        /// Environment type section to build from.
        #[arg(long = "type")]
        env_type: Option<String>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Recompute routes and rules, keeping allocated ranges
    Update {
        name: Option<String>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Destroy every group and release the address range
    Destroy {
        name: Option<String>,
        #[arg(long)]
        dry_run: bool,
    },
    List {
        #[arg(long)]
        json: bool,
    },
}

#[derive(clap::Args)]
struct DeployArgs {
    #[arg(long)]
    pipeline: PathBuf,
    #[arg(long)]
    hostclass: Option<String>,
    #[arg(long)]
    ami: Option<String>,
    #[arg(long)]
    dry_run: bool,
}

impl From<DeployArgs> for DeployFilter {
    fn from(args: DeployArgs) -> Self {
        DeployFilter {
            hostclass: args.hostclass,
            ami: args.ami,
            dry_run: args.dry_run,
        }
    }
}

#[derive(Subcommand)]
enum DeployAction {
    /// Blue/green test the newest untested image and promote it
    Test(DeployArgs),
    /// Roll the newest tested image out to a deployable hostclass
    Update(DeployArgs),
    /// Roll back deployments left unfinished by an interrupted run
    Recover,
    /// List deployment attempts
    History {
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum ImageAction {
    Register {
        hostclass: String,
        id: String,
        #[arg(long, default_value = "untested")]
        stage: ImageStage,
    },
    List {
        #[arg(long)]
        hostclass: Option<String>,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum SnapshotAction {
    Register {
        hostclass: String,
        id: String,
        #[arg(long, default_value_t = 100)]
        size_gb: u32,
    },
    List {
        hostclass: String,
        #[arg(long)]
        json: bool,
    },
}

fn run_options(no_smoke_test: bool, no_destroy: bool) -> RunOptions {
    RunOptions {
        smoke_test: !no_smoke_test,
        no_destroy,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.global.debug { "asiaq=debug" } else { "asiaq=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(level.parse()?)
        )
        .init();

    let app = App::open(&cli.global)?;

    match cli.command {
        Commands::Environment { action } => match action {
            EnvironmentAction::Create { name, env_type, dry_run } => {
                let name = name.map(Ok).unwrap_or_else(|| app.environment())?;
                commands::environment::create(&app, &name, env_type.as_deref(), dry_run)
            }
            EnvironmentAction::Update { name, dry_run } => {
                let name = name.map(Ok).unwrap_or_else(|| app.environment())?;
                commands::environment::update(&app, &name, dry_run)
            }
            EnvironmentAction::Destroy { name, dry_run } => {
                let name = name.map(Ok).unwrap_or_else(|| app.environment())?;
                commands::environment::destroy(&app, &name, dry_run).await
            }
            EnvironmentAction::List { json } => commands::environment::list(&app, json),
        },
        Commands::Provision {
            hostclass,
            min_size,
            desired_size,
            max_size,
            ami,
            instance_type,
            extra_disk,
            iops,
            no_smoke_test,
            no_destroy,
        } => {
            let overrides = Overrides {
                min_size,
                desired_size,
                max_size,
                ami,
                instance_type,
                extra_disk,
                iops,
            };
            commands::provision::provision(
                &app,
                &hostclass,
                overrides,
                run_options(no_smoke_test, no_destroy),
            )
            .await
        }
        Commands::Spinup {
            pipeline,
            hostclass,
            no_smoke_test,
            no_destroy,
        } => {
            commands::provision::spinup(
                &app,
                &pipeline,
                &hostclass,
                run_options(no_smoke_test, no_destroy),
            )
            .await
        }
        Commands::Spindown { pipeline, hostclass } => {
            commands::provision::spindown(&app, &pipeline, &hostclass).await
        }
        Commands::Deploy { action } => match action {
            DeployAction::Test(args) => {
                let pipeline = args.pipeline.clone();
                commands::deploy::deploy(&app, Mode::Test, &pipeline, args.into()).await
            }
            DeployAction::Update(args) => {
                let pipeline = args.pipeline.clone();
                commands::deploy::deploy(&app, Mode::Update, &pipeline, args.into()).await
            }
            DeployAction::Recover => commands::deploy::recover(&app).await,
            DeployAction::History { json } => commands::deploy::history(&app, json),
        },
        Commands::Chaos {
            level,
            retainage,
            dry_run,
        } => commands::chaos::chaos(&app, level, retainage, dry_run).await,
        Commands::Image { action } => match action {
            ImageAction::Register { hostclass, id, stage } => {
                commands::catalog::register_image(&app, &hostclass, &id, stage)
            }
            ImageAction::List { hostclass, json } => {
                commands::catalog::list_images(&app, hostclass.as_deref(), json)
            }
        },
        Commands::Snapshot { action } => match action {
            SnapshotAction::Register { hostclass, id, size_gb } => {
                commands::catalog::register_snapshot(&app, &hostclass, &id, size_gb)
            }
            SnapshotAction::List { hostclass, json } => {
                commands::catalog::list_snapshots(&app, &hostclass, json)
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_flags_follow_subcommands() {
        let cli = Cli::try_parse_from([
            "asiaq", "chaos", "--env", "ci", "--level", "2", "--retainage", "50", "--dry-run",
        ])
        .unwrap();
        assert_eq!(cli.global.env.as_deref(), Some("ci"));
        match cli.command {
            Commands::Chaos {
                level,
                retainage,
                dry_run,
            } => {
                assert_eq!(level, 2.0);
                assert_eq!(retainage, 50.0);
                assert!(dry_run);
            }
            _ => panic!("expected chaos"),
        }
    }

    #[test]
    fn deploy_args_become_a_filter() {
        let cli = Cli::try_parse_from([
            "asiaq", "deploy", "update", "--pipeline", "p.csv", "--hostclass", "mhcweb",
        ])
        .unwrap();
        let Commands::Deploy {
            action: DeployAction::Update(args),
        } = cli.command
        else {
            panic!("expected deploy update");
        };
        let filter: DeployFilter = args.into();
        assert_eq!(filter.hostclass.as_deref(), Some("mhcweb"));
        assert!(filter.ami.is_none());
        assert!(!filter.dry_run);
    }

    #[test]
    fn image_stage_is_parsed() {
        let cli = Cli::try_parse_from(["asiaq", "image", "register", "mhcweb", "ami-1", "--stage", "tested"])
            .unwrap();
        let Commands::Image {
            action: ImageAction::Register { stage, .. },
        } = cli.command
        else {
            panic!("expected image register");
        };
        assert_eq!(stage, ImageStage::Tested);
    }

    #[test]
    fn spinup_collects_repeated_hostclasses() {
        let cli = Cli::try_parse_from([
            "asiaq", "spinup", "--pipeline", "p.csv", "--hostclass", "a", "--hostclass", "b",
            "--no-smoke-test",
        ])
        .unwrap();
        let Commands::Spinup {
            hostclass,
            no_smoke_test,
            ..
        } = cli.command
        else {
            panic!("expected spinup");
        };
        assert_eq!(hostclass, vec!["a", "b"]);
        assert!(no_smoke_test);
    }
}
