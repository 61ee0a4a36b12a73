//! # Pathweaver CLI (`pathweaver`)
//!
//! Runs learning-path stages against a Postgres database and prints their
//! JSON output.
//!
//! ## Usage
//!
//! ```bash
//! pathweaver --config ./config/pathweaver.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `pathweaver init` | Run schema migrations |
//! | `pathweaver stage <name>` | Run one stage; compensate its saga on failure |
//! | `pathweaver compensate` | Replay a saga's compensating actions |
//! | `pathweaver input-hash` | Print a stage's artifact input hash |
//!
//! ## Examples
//!
//! ```bash
//! pathweaver init
//!
//! pathweaver stage concept_graph_build \
//!     --owner 6c1f... --set 0b7e... --progress json
//!
//! pathweaver compensate --saga 9a02...
//! ```
//!
//! Logging goes to stderr and follows `RUST_LOG` (default `info`).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use pathweaver::config;
use pathweaver::progress::ProgressMode;
use pathweaver::saga::Compensator;
use pathweaver::stages::{deps_from_config, run_stage, StageContext, StageInput, StageName, StageRegistry};
use pathweaver::store::postgres::PgStore;
use pathweaver::store::Store;
use pathweaver::{artifact_cache, db, migrate};

/// Pathweaver — citation-grounded learning paths from uploaded materials.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/pathweaver.toml` for an example.
#[derive(Parser)]
#[command(
    name = "pathweaver",
    about = "Pathweaver — build concept graphs and grounded activities from learning materials",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/pathweaver.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run schema migrations. Idempotent.
    Init,

    /// Run one stage and print its JSON output.
    ///
    /// On failure the saga's compensating actions are executed before the
    /// command exits non-zero.
    Stage {
        /// `embed_chunks`, `concept_graph_build`, `concept_graph_patch` or
        /// `realize_activities`.
        name: String,

        #[arg(long)]
        owner: Uuid,

        /// Material set ID.
        #[arg(long)]
        set: Uuid,

        #[arg(long)]
        path: Option<Uuid>,

        /// Saga ID; a fresh one is generated when omitted.
        #[arg(long)]
        saga: Option<Uuid>,

        /// Progress output. Defaults to `human` on a TTY, otherwise `off`.
        #[arg(long, value_enum)]
        progress: Option<ProgressArg>,
    },

    /// Execute the pending compensations of a saga.
    Compensate {
        #[arg(long)]
        saga: Uuid,
    },

    /// Print the artifact input hash a stage would compute.
    InputHash {
        #[arg(long)]
        owner: Uuid,

        #[arg(long)]
        set: Uuid,

        #[arg(long)]
        path: Option<Uuid>,

        /// `embed_chunks`, `concept_graph`, `concept_graph_patch` or
        /// `realize_activities`.
        #[arg(long)]
        artifact: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ProgressArg {
    Off,
    Human,
    Json,
}

impl From<ProgressArg> for ProgressMode {
    fn from(p: ProgressArg) -> Self {
        match p {
            ProgressArg::Off => ProgressMode::Off,
            ProgressArg::Human => ProgressMode::Human,
            ProgressArg::Json => ProgressMode::Json,
        }
    }
}

fn stage_for_artifact(artifact: &str) -> Option<StageName> {
    match artifact {
        artifact_cache::EMBED_CHUNKS => Some(StageName::EmbedChunks),
        artifact_cache::CONCEPT_GRAPH => Some(StageName::ConceptGraphBuild),
        artifact_cache::CONCEPT_GRAPH_PATCH => Some(StageName::ConceptGraphPatch),
        artifact_cache::REALIZE_ACTIVITIES => Some(StageName::RealizeActivities),
        _ => None,
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn open_store(cfg: &config::Config) -> Result<Arc<dyn Store>> {
    let pool = db::connect(cfg).await?;
    Ok(Arc::new(PgStore::new(pool)))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Stage {
            name,
            owner,
            set,
            path,
            saga,
            progress,
        } => {
            let stage = StageName::parse(&name).with_context(|| format!("unknown stage: {}", name))?;
            let store = open_store(&cfg).await?;
            let deps = deps_from_config(&cfg, store.clone())?;
            let saga_id = saga.unwrap_or_else(Uuid::new_v4);
            let input = StageInput {
                owner_user_id: owner,
                material_set_id: set,
                saga_id,
                path_id: path,
            };
            let mode = progress.map(ProgressMode::from).unwrap_or_else(ProgressMode::default_for_tty);
            let cancel = CancellationToken::new();
            let ctx = StageContext {
                cancel: cancel.clone(),
                progress: mode.sink(),
            };
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupt received; cancelling stage");
                    cancel.cancel();
                }
            });

            match run_stage(stage, &ctx, &deps, &input).await {
                Ok(output) => println!("{}", serde_json::to_string_pretty(&output)?),
                Err(e) => {
                    let compensator = Compensator {
                        store,
                        vectors: deps.vectors.clone(),
                        objects: deps.objects.clone(),
                    };
                    match compensator.compensate(saga_id).await {
                        Ok(report) => tracing::info!(saga_id = %saga_id, ?report, "saga compensated"),
                        Err(ce) => tracing::warn!(saga_id = %saga_id, error = %ce, "saga compensation failed"),
                    }
                    return Err(e.context(format!("stage {} failed (saga {})", stage.as_str(), saga_id)));
                }
            }
        }
        Commands::Compensate { saga } => {
            let store = open_store(&cfg).await?;
            let compensator = Compensator {
                store,
                vectors: pathweaver::vectors::create_store(&cfg.vectors)?,
                objects: Some(Arc::new(pathweaver::object_store::LocalObjectStore::new(
                    &cfg.object_store.root,
                ))),
            };
            let report = compensator.compensate(saga).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::InputHash {
            owner,
            set,
            path,
            artifact,
        } => {
            let stage =
                stage_for_artifact(&artifact).with_context(|| format!("unknown artifact type: {}", artifact))?;
            let store = open_store(&cfg).await?;
            let deps = deps_from_config(&cfg, store)?;
            let input = StageInput {
                owner_user_id: owner,
                material_set_id: set,
                saga_id: Uuid::nil(),
                path_id: path,
            };
            let registry = StageRegistry::with_builtins();
            let runner = registry
                .find(stage)
                .with_context(|| format!("stage not registered: {}", stage.as_str()))?;
            println!("{}", runner.input_hash(&deps, &input).await?);
        }
    }

    Ok(())
}
