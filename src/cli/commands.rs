//! Subcommand implementations
//!
//! Every command builds a validated `StackConfig` from the settings file
//! plus CLI overrides, then works through a `ProductStack` loaded from the
//! snapshot cache (falling back to a database rebuild when stale). Mutations
//! rely on the stack's autosave to persist as they go.

use crate::cli::args::{
    CacheArgs, CacheCommands, DeclareArgs, ListArgs, TagArgs, TagsArgs, UndeclareArgs, UntagArgs,
};
use crate::config::{Settings, StackConfig};
use crate::db::Database;
use crate::error::UpstackResult;
use crate::flavor::native_flavor;
use crate::product::Product;
use crate::stack::persist::find_cached_flavors;
use crate::stack::ProductStack;
use std::collections::BTreeSet;
use std::path::PathBuf;

/// Shared per-invocation context
pub struct Context {
    pub settings: Settings,
    pub db_override: Option<PathBuf>,
}

impl Context {
    fn stack_config(&self) -> UpstackResult<StackConfig> {
        StackConfig::from_settings(&self.settings, self.db_override.clone())
    }

    fn native_flavor(&self) -> String {
        self.settings
            .flavor
            .native
            .clone()
            .unwrap_or_else(native_flavor)
    }

    /// Flavors a command should load: the native fallback chain, any flavors
    /// named on the command line, and every flavor already cached on disk
    fn target_flavors(&self, config: &StackConfig, extra: &[String]) -> Vec<String> {
        let mut flavors: BTreeSet<String> = self
            .settings
            .fallback_policy()
            .chain(&self.native_flavor())
            .into_iter()
            .collect();
        flavors.extend(extra.iter().cloned());

        let cache_dir = config
            .persist_dir
            .clone()
            .unwrap_or_else(|| config.db_path.clone());
        if let Ok(cached) = find_cached_flavors(&cache_dir) {
            flavors.extend(cached);
        }
        flavors.into_iter().collect()
    }

    fn load_stack(&self, extra: &[String]) -> UpstackResult<ProductStack> {
        let config = self.stack_config()?;
        let flavors = self.target_flavors(&config, extra);
        ProductStack::from_cache(config, &flavors, true)
    }
}

pub fn flavors(ctx: &Context) -> UpstackResult<()> {
    let stack = ctx.load_stack(&[])?;
    for flavor in stack.flavors() {
        println!("{flavor}");
    }
    Ok(())
}

pub fn list(ctx: &Context, args: ListArgs) -> UpstackResult<()> {
    let extra: Vec<String> = args.flavor.iter().cloned().collect();
    let stack = ctx.load_stack(&extra)?;

    let names = match &args.name {
        Some(name) => vec![name.clone()],
        None => stack.product_names(args.flavor.as_deref()),
    };

    for name in names {
        let flavors = match &args.flavor {
            Some(flavor) => vec![flavor.clone()],
            None => stack.flavors(),
        };
        for flavor in flavors {
            for version in stack.versions(&name, Some(&flavor)) {
                let product = stack.product(&name, &version, &flavor)?;
                let tags = if product.tags.is_empty() {
                    String::new()
                } else {
                    format!("  [{}]", product.tags.join(", "))
                };
                println!("{name:<24} {version:<16} {flavor}{tags}");
            }
        }
    }
    Ok(())
}

pub fn declare(ctx: &Context, args: DeclareArgs) -> UpstackResult<()> {
    let flavor = args.flavor.unwrap_or_else(|| ctx.native_flavor());
    let product = Product {
        name: args.name,
        version: args.version,
        flavor,
        install_dir: args.install_dir,
        table_file: args.table_file,
        table: None,
        db: None,
        tags: args.tags,
    };

    // load before touching the database so cache-resident tags survive,
    // then write the declaration and let autosave refresh the snapshot
    let mut stack = ctx.load_stack(&[product.flavor.clone()])?;
    let db = Database::open(stack.db_path())?;
    db.declare(&product)?;
    stack.add_product(product.clone())?;

    println!(
        "Declared {} {} for {}",
        product.name, product.version, product.flavor
    );
    Ok(())
}

pub fn undeclare(ctx: &Context, args: UndeclareArgs) -> UpstackResult<()> {
    let flavor = args.flavor.unwrap_or_else(|| ctx.native_flavor());

    let mut stack = ctx.load_stack(&[flavor.clone()])?;
    let db = Database::open(stack.db_path())?;
    let in_db = db.undeclare(&args.name, &args.version, &flavor)?;
    let in_stack = stack.remove_product(&args.name, &flavor, &args.version)?;

    if in_db || in_stack {
        println!("Undeclared {} {} for {}", args.name, args.version, flavor);
    } else {
        println!(
            "Nothing to undeclare: {} {} ({})",
            args.name, args.version, flavor
        );
    }
    Ok(())
}

pub fn tag(ctx: &Context, args: TagArgs) -> UpstackResult<()> {
    let mut stack = ctx.load_stack(&args.flavors)?;
    let flavors = if args.flavors.is_empty() {
        None
    } else {
        Some(args.flavors.as_slice())
    };
    stack.assign_tag(&args.tag, &args.name, &args.version, flavors)?;
    println!("Tagged {} {} as {}", args.name, args.version, args.tag);
    Ok(())
}

pub fn untag(ctx: &Context, args: UntagArgs) -> UpstackResult<()> {
    let mut stack = ctx.load_stack(&args.flavors)?;
    let flavors = if args.flavors.is_empty() {
        None
    } else {
        Some(args.flavors.as_slice())
    };
    if stack.unassign_tag(&args.tag, &args.name, flavors)? {
        println!("Removed tag {} from {}", args.tag, args.name);
    } else {
        println!("Tag {} was not assigned to {}", args.tag, args.name);
    }
    Ok(())
}

pub fn tags(ctx: &Context, args: TagsArgs) -> UpstackResult<()> {
    let extra: Vec<String> = args.flavor.iter().cloned().collect();
    let stack = ctx.load_stack(&extra)?;
    for tag in stack.tags(args.flavor.as_deref()) {
        println!("{tag}");
    }
    Ok(())
}

pub fn cache(ctx: &Context, args: CacheArgs) -> UpstackResult<()> {
    match args.command {
        CacheCommands::Status => cache_status(ctx),
        CacheCommands::Rebuild => cache_rebuild(ctx),
        CacheCommands::Clear => cache_clear(ctx),
    }
}

fn cache_status(ctx: &Context) -> UpstackResult<()> {
    let config = ctx.stack_config()?;
    let flavors = ctx.target_flavors(&config, &[]);
    let stack = ProductStack::new(config)?;

    for flavor in flavors {
        let path = stack.persist_path(&flavor, None);
        let state = if !path.exists() {
            "missing"
        } else if stack.cache_is_up_to_date(&flavor)? {
            "fresh"
        } else {
            "stale"
        };
        println!("{flavor:<16} {state:<8} {}", path.display());
    }
    Ok(())
}

fn cache_rebuild(ctx: &Context) -> UpstackResult<()> {
    let mut stack = ProductStack::from_database(ctx.stack_config()?)?;
    let flavors = stack.flavors();
    stack.save(Some(&flavors), None)?;
    println!("Rebuilt snapshots for {} flavors", flavors.len());
    Ok(())
}

fn cache_clear(ctx: &Context) -> UpstackResult<()> {
    let config = ctx.stack_config()?;
    let cache_dir = config
        .persist_dir
        .clone()
        .unwrap_or_else(|| config.db_path.clone());
    let mut stack = ProductStack::new(config)?;

    let cached = find_cached_flavors(&cache_dir)?;
    stack.clear_cache(Some(&cached), None)?;
    println!("Cleared {} snapshots", cached.len());
    Ok(())
}
