//! Test harness.
//!
//! Every test gets its own SQLite database and four local destinations
//! in a temporary directory:
//!
//! | Index | Role      | Region |
//! |-------|-----------|--------|
//! | 0     | temporary |        |
//! | 1     | permanent | eu     |
//! | 2     | boost     | eu     |
//! | 3     | boost     | us     |

use std::future::Future;
use std::time::Duration;

use tempfile::TempDir;
use tokio::time;

use crate::analysis::analyze_attachment;
use crate::config::load_config_from_str;
use crate::database::entity::attachment::AttachmentModel;
use crate::database::entity::pool::PoolModel;
use crate::pool::{create_pool, NewPool};
use crate::upload::{create_attachment_direct, NewAttachment};
use crate::{run_migrations, transfer, Actor, State, StateInner};

pub const BOOST_EU: usize = 2;
pub const BOOST_US: usize = 3;

pub const ACTOR: Actor = Actor {
    account_id: 1,
    max_upload_size: None,
};

pub struct TestEnv {
    pub state: State,
    pub pool: PoolModel,

    // Dropped last
    _dir: TempDir,
}

pub async fn setup() -> TestEnv {
    setup_with_chunk_size(4).await
}

pub async fn setup_with_chunk_size(chunk_size: u64) -> TestEnv {
    let dir = TempDir::new().unwrap();
    let root = dir.path().display().to_string();

    let toml = format!(
        r#"
        chunk-size = {chunk_size}

        [database]
        url = "sqlite://{root}/stash.db?mode=rwc"
        heartbeat = false

        [[destinations]]
        type = "local"
        path = "{root}/temporary"

        [[destinations]]
        type = "local"
        path = "{root}/permanent"
        region = "eu"

        [[destinations]]
        type = "local"
        path = "{root}/boost-eu"
        region = "eu"
        is-boost = true

        [[destinations]]
        type = "local"
        path = "{root}/boost-us"
        region = "us"
        is-boost = true

        [pools.aliases]
        avatar = "default"
        "#
    );

    let config = load_config_from_str(&toml).unwrap();
    run_migrations(config.clone()).await.unwrap();

    let state = StateInner::new(config).await;
    transfer::spawn_deletion_workers(&state);

    let pool = create_pool(&state, NewPool::new("default".parse().unwrap()))
        .await
        .unwrap();

    TestEnv {
        state,
        pool,
        _dir: dir,
    }
}

/// Uploads a file to the default pool.
pub async fn upload(state: &StateInner, name: &str, bytes: &[u8]) -> AttachmentModel {
    upload_as(state, &ACTOR, name, bytes).await
}

pub async fn upload_as(state: &StateInner, actor: &Actor, name: &str, bytes: &[u8]) -> AttachmentModel {
    upload_to(state, actor, "default", name, bytes).await
}

pub async fn upload_to(
    state: &StateInner,
    actor: &Actor,
    pool: &str,
    name: &str,
    bytes: &[u8],
) -> AttachmentModel {
    let mut stream = bytes;
    create_attachment_direct(
        state,
        actor,
        NewAttachment::new(pool, name),
        bytes.len() as u64,
        &mut stream,
    )
    .await
    .unwrap()
}

/// Uploads a file and runs it through analysis.
pub async fn upload_promoted(state: &StateInner, name: &str, bytes: &[u8]) -> AttachmentModel {
    let attachment = upload(state, name, bytes).await;
    analyze_attachment(state, attachment.id).await.unwrap()
}

pub async fn object_exists(state: &StateInner, destination: usize, name: &str) -> bool {
    let destinations = state.destinations().await.unwrap();
    destinations
        .get(destination)
        .unwrap()
        .backend
        .file_exists(name.to_owned())
        .await
        .unwrap()
}

/// Polls until `f` returns something.
pub async fn wait_for<T, F, Fut>(f: F) -> T
where
    F: Fn() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    for _ in 0..100 {
        if let Some(v) = f().await {
            return v;
        }

        time::sleep(Duration::from_millis(50)).await;
    }

    panic!("Timed out waiting for a condition");
}
