use anyhow::{anyhow, Result};
use clap::Parser;
use humantime::Duration;

use crate::Opts;
use stash::pool::PoolAlias;
use stash_server::config::Config;
use stash_server::pool::{self, NewPool};
use stash_server::StateInner;

/// Create a pool.
///
/// For example, to create a pool for chat uploads that forgets files
/// after 30 days and accepts links from other pools:
///
/// $ stashadm create-pool chat --lifecycle 30d --allow-ingress
#[derive(Debug, Parser)]
pub struct CreatePool {
    /// The alias of the pool.
    alias: PoolAlias,

    /// A human-readable name.
    ///
    /// Defaults to the alias.
    #[clap(long)]
    name: Option<String>,

    /// A description of the pool.
    #[clap(long, default_value = "")]
    description: String,

    /// The largest file the pool accepts, in bytes.
    #[clap(long)]
    max_file_size: Option<u64>,

    /// How long attachments live in the pool.
    ///
    /// You can use expressions like "30d" and "1 year".
    #[clap(long)]
    lifecycle: Option<Duration>,

    /// Allow attachments from other pools to link into this pool.
    #[clap(long)]
    allow_ingress: bool,

    /// Allow attachments of this pool to be linked from other pools.
    #[clap(long)]
    allow_egress: bool,

    /// Make attachments of this pool publicly indexable.
    #[clap(long)]
    public_indexable: bool,
}

/// List all pools.
#[derive(Debug, Parser)]
pub struct ListPools {
    /// Print the pools as JSON lines.
    #[clap(long)]
    json: bool,
}

/// Delete a pool.
///
/// Attachments in the pool are kept and stop belonging to any pool.
#[derive(Debug, Parser)]
pub struct DeletePool {
    /// The alias of the pool.
    alias: PoolAlias,
}

pub async fn run_create(config: Config, opts: Opts) -> Result<()> {
    let sub = opts
        .command
        .as_create_pool()
        .ok_or_else(|| anyhow!("Wrong sub-command"))?;

    let exist_lifecycle = match sub.lifecycle {
        Some(lifecycle) => {
            let secs = std::time::Duration::from(lifecycle).as_secs();
            Some(u32::try_from(secs).map_err(|_| anyhow!("Lifecycle is too long"))?)
        }
        None => None,
    };

    let mut new = NewPool::new(sub.alias.clone());
    if let Some(name) = &sub.name {
        new.name = name.to_owned();
    }
    new.description = sub.description.to_owned();
    new.max_file_size = sub.max_file_size;
    new.exist_lifecycle = exist_lifecycle;
    new.allow_cross_pool_ingress = sub.allow_ingress;
    new.allow_cross_pool_egress = sub.allow_egress;
    new.is_public_indexable = sub.public_indexable;

    let state = StateInner::new(config).await;
    let pool = pool::create_pool(&state, new).await?;

    eprintln!("✅ Created pool \"{}\" (id {})", pool.alias, pool.id);

    Ok(())
}

pub async fn run_list(config: Config, opts: Opts) -> Result<()> {
    let sub = opts
        .command
        .as_list_pools()
        .ok_or_else(|| anyhow!("Wrong sub-command"))?;

    let state = StateInner::new(config).await;
    let pools = pool::list_pools(&state).await?;

    for pool in pools {
        if sub.json {
            let value = serde_json::json!({
                "id": pool.id,
                "alias": pool.alias,
                "name": pool.name,
                "description": pool.description,
                "max_file_size": pool.max_file_size,
                "exist_lifecycle": pool.exist_lifecycle,
                "allow_cross_pool_ingress": pool.allow_cross_pool_ingress,
                "allow_cross_pool_egress": pool.allow_cross_pool_egress,
                "is_public_indexable": pool.is_public_indexable,
                "created_at": pool.created_at.to_rfc3339(),
            });
            println!("{}", value);
            continue;
        }

        let lifecycle = pool
            .exist_lifecycle
            .map(|secs| {
                humantime::format_duration(std::time::Duration::from_secs(secs as u64)).to_string()
            })
            .unwrap_or_else(|| "forever".to_string());

        let max_file_size = pool
            .max_file_size
            .map(|size| size.to_string())
            .unwrap_or_else(|| "unlimited".to_string());

        println!(
            "{}\t{}\tmax-file-size={}\tlifecycle={}\tingress={}\tegress={}",
            pool.alias,
            pool.name,
            max_file_size,
            lifecycle,
            pool.allow_cross_pool_ingress,
            pool.allow_cross_pool_egress,
        );
    }

    Ok(())
}

pub async fn run_delete(config: Config, opts: Opts) -> Result<()> {
    let sub = opts
        .command
        .as_delete_pool()
        .ok_or_else(|| anyhow!("Wrong sub-command"))?;

    let state = StateInner::new(config).await;
    let pool = pool::get_pool_by_alias(&state, sub.alias.as_str()).await?;
    pool::delete_pool(&state, pool.id).await?;

    eprintln!("✅ Deleted pool \"{}\"", pool.alias);

    Ok(())
}
