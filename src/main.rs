use clap::Parser;
use granary::cli::{AppContext, Cli};
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new(if cli.quiet { "error" } else { "warn" })
            }),
        )
        .with_writer(std::io::stderr)
        .init();

    // Build a context once, pass everywhere
    let ctx = AppContext {
        debug: cli.debug,
        quiet: cli.quiet,
    };

    if let Err(err) = granary::cli::run(cli, &ctx) {
        if ctx.debug {
            // Full chain for debugging; anyhow carries the context stack.
            eprintln!("{err:?}");
        } else {
            eprintln!("{err:#}");
        }
        std::process::exit(1);
    }
}
