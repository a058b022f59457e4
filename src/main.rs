//! upstack - local product-stack registry cache
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use upstack::cli::{commands, Cli, Commands};
use upstack::config::Settings;
use upstack::error::UpstackResult;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

fn run() -> UpstackResult<()> {
    let cli = Cli::parse();

    // Initialize logging: 0 = warn, 1 = info, 2+ = debug
    let filter = match cli.verbose {
        0 => EnvFilter::new("upstack=warn"),
        1 => EnvFilter::new("upstack=info"),
        _ => EnvFilter::new("upstack=debug"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();

    let config_path = cli.config.unwrap_or_else(Settings::default_path);
    let settings = Settings::load(&config_path)?;

    let ctx = commands::Context {
        settings,
        db_override: cli.db,
    };

    match cli.command {
        Commands::Flavors => commands::flavors(&ctx),
        Commands::List(args) => commands::list(&ctx, args),
        Commands::Declare(args) => commands::declare(&ctx, args),
        Commands::Undeclare(args) => commands::undeclare(&ctx, args),
        Commands::Tag(args) => commands::tag(&ctx, args),
        Commands::Untag(args) => commands::untag(&ctx, args),
        Commands::Tags(args) => commands::tags(&ctx, args),
        Commands::Cache(args) => commands::cache(&ctx, args),
    }
}
