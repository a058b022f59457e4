//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

/// upstack - local product-stack registry cache
///
/// Tracks declared software products (name, version, platform flavor) and
/// the tags pointing at them, backed by per-flavor snapshot files.
#[derive(Parser, Debug)]
#[command(name = "upstack")]
#[command(author, version, long_about = None)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "UPSTACK_CONFIG")]
    pub config: Option<PathBuf>,

    /// Product database directory
    #[arg(long, global = true, env = "UPSTACK_DB")]
    pub db: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List known platform flavors
    Flavors,

    /// List declared products and versions
    List(ListArgs),

    /// Declare a product version in the database and the stack
    Declare(DeclareArgs),

    /// Remove a product version from the database and the stack
    Undeclare(UndeclareArgs),

    /// Assign a tag to a product version
    Tag(TagArgs),

    /// Remove a tag from a product
    Untag(UntagArgs),

    /// List assigned tags
    Tags(TagsArgs),

    /// Manage the snapshot cache
    Cache(CacheArgs),
}

/// Arguments for the list command
#[derive(Parser, Debug)]
pub struct ListArgs {
    /// Restrict to one product
    pub name: Option<String>,

    /// Restrict to one flavor
    #[arg(short, long)]
    pub flavor: Option<String>,
}

/// Arguments for the declare command
#[derive(Parser, Debug)]
pub struct DeclareArgs {
    /// Product name
    pub name: String,

    /// Version string
    pub version: String,

    /// Target flavor (defaults to the native flavor)
    #[arg(short, long)]
    pub flavor: Option<String>,

    /// Install directory
    #[arg(short, long)]
    pub install_dir: Option<PathBuf>,

    /// Table file path
    #[arg(short, long)]
    pub table_file: Option<PathBuf>,

    /// Tags to assign to this version
    #[arg(long = "tag")]
    pub tags: Vec<String>,
}

/// Arguments for the undeclare command
#[derive(Parser, Debug)]
pub struct UndeclareArgs {
    /// Product name
    pub name: String,

    /// Version string
    pub version: String,

    /// Target flavor (defaults to the native flavor)
    #[arg(short, long)]
    pub flavor: Option<String>,
}

/// Arguments for the tag command
#[derive(Parser, Debug)]
pub struct TagArgs {
    /// Tag name; a `user.` prefix makes it user-scoped
    pub tag: String,

    /// Product name
    pub name: String,

    /// Version to point the tag at
    pub version: String,

    /// Flavors to assign within (defaults to all known flavors)
    #[arg(short, long = "flavor")]
    pub flavors: Vec<String>,
}

/// Arguments for the untag command
#[derive(Parser, Debug)]
pub struct UntagArgs {
    /// Tag name
    pub tag: String,

    /// Product name
    pub name: String,

    /// Flavors to unassign within (defaults to all known flavors)
    #[arg(short, long = "flavor")]
    pub flavors: Vec<String>,
}

/// Arguments for the tags command
#[derive(Parser, Debug)]
pub struct TagsArgs {
    /// Restrict to one flavor
    #[arg(short, long)]
    pub flavor: Option<String>,
}

/// Arguments for the cache command
#[derive(Parser, Debug)]
pub struct CacheArgs {
    #[command(subcommand)]
    pub command: CacheCommands,
}

/// Cache management subcommands
#[derive(Subcommand, Debug)]
pub enum CacheCommands {
    /// Show per-flavor snapshot freshness
    Status,

    /// Rebuild every snapshot from the database
    Rebuild,

    /// Delete snapshot files
    Clear,
}
