//! Command-line interface with clap integration

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use crate::core::engine::Engine;
use crate::core::resource::TaskAction;
use crate::core::source::ActionArgs;
use crate::core::store::Action;
use crate::core::task::Task;
use crate::infra::config::load_settings;

/// Shared application context for global flags
#[derive(Clone, Debug)]
pub struct AppContext {
    pub debug: bool, // global --debug
    pub quiet: bool, // global --quiet
}

#[derive(Parser)]
#[command(name = "gry")]
#[command(
    about = "Materialize archives, release assets and files from hosting platforms and keep them in sync"
)]
#[command(version, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Stop on the first error and show the full error chain
    #[arg(long, global = true)]
    pub debug: bool,

    /// Suppress non-essential output
    #[arg(long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Download resources as single files
    Download(DownloadArgs),

    /// Extract resource archives
    Extract(ExtractArgs),

    /// Install resources (needs a type-specific adapter)
    Install(InstallArgs),

    /// Update installed resources to current remote state
    Update(UpdateArgs),

    /// Remove installed resources and their files
    Remove(RemoveArgs),

    /// List installed resources
    List,

    /// Store an API token for a platform
    Auth(AuthArgs),
}

#[derive(Args)]
pub struct DownloadArgs {
    /// Resources (e.g. github://owner/repo/ref/asset.bin)
    pub resources: Vec<String>,

    /// Output directory
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Always replace destinations, even user-modified ones
    #[arg(short, long)]
    pub force: bool,
}

#[derive(Args)]
pub struct ExtractArgs {
    /// Resources (e.g. github://owner/repo/ref/tarball)
    pub resources: Vec<String>,

    /// Output directory
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Allow extraction of files outside of the output directory
    #[arg(long)]
    pub trusted: bool,

    /// Strip NUMBER leading components from member paths on extraction
    #[arg(long, default_value = "0")]
    pub strip_components: u32,

    /// Always replace destinations, even user-modified ones
    #[arg(short, long)]
    pub force: bool,
}

#[derive(Args)]
pub struct InstallArgs {
    /// Resources
    pub resources: Vec<String>,

    /// Always replace destinations, even user-modified ones
    #[arg(short, long)]
    pub force: bool,
}

#[derive(Args)]
pub struct UpdateArgs {
    /// Resource name globs
    #[arg(default_value = "*")]
    pub resources: Vec<String>,

    /// Always replace destinations, even user-modified ones
    #[arg(short, long)]
    pub force: bool,
}

#[derive(Args)]
pub struct RemoveArgs {
    /// Resource name globs
    pub resources: Vec<String>,
}

#[derive(Args)]
pub struct AuthArgs {
    /// Platform scheme (e.g. github)
    pub platform: String,

    /// API token value
    pub token: String,
}

pub fn run(cli: Cli, ctx: &AppContext) -> Result<()> {
    let settings = load_settings()?;
    if settings.workers > 0 {
        // Best-effort: the global pool may already be initialized.
        let _ = rayon::ThreadPoolBuilder::new()
            .num_threads(settings.workers)
            .build_global();
    }
    let eng = Engine::new(settings)?;

    match cli.command {
        Commands::Download(args) => apply(
            &eng,
            ctx,
            &args.resources,
            TaskAction::Create(Action::Download),
            ActionArgs {
                output: args.output,
                ..ActionArgs::default()
            },
            args.force,
        ),
        Commands::Extract(args) => apply(
            &eng,
            ctx,
            &args.resources,
            TaskAction::Create(Action::Extract),
            ActionArgs {
                output: args.output,
                trusted: args.trusted,
                strip_components: args.strip_components,
            },
            args.force,
        ),
        Commands::Install(args) => apply(
            &eng,
            ctx,
            &args.resources,
            TaskAction::Create(Action::Install),
            ActionArgs::default(),
            args.force,
        ),
        Commands::Update(args) => apply(
            &eng,
            ctx,
            &args.resources,
            TaskAction::Update,
            ActionArgs::default(),
            args.force,
        ),
        Commands::Remove(args) => apply(
            &eng,
            ctx,
            &args.resources,
            TaskAction::Remove,
            ActionArgs::default(),
            false,
        ),
        Commands::List => list(&eng),
        Commands::Auth(args) => {
            eng.secrets
                .set(&format!("platform.{}.token", args.platform), &args.token)?;
            if !ctx.quiet {
                println!("token stored for {}", args.platform);
            }
            Ok(())
        }
    }
}

fn apply(
    eng: &Engine,
    ctx: &AppContext,
    resources: &[String],
    action: TaskAction,
    args: ActionArgs,
    force: bool,
) -> Result<()> {
    if resources.is_empty() {
        anyhow::bail!("at least one resource is required");
    }
    let task = Task::begin(eng)?;
    task.run(resources, action, &args, force, ctx.debug)?;
    Ok(())
}

fn list(eng: &Engine) -> Result<()> {
    for row in eng.store.all_resources()? {
        println!("{}\t{}", row.action, row.name);
    }
    Ok(())
}
