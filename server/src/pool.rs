//! Pool management.

use chrono::Utc;
use sea_orm::entity::prelude::*;
use sea_orm::query::{QueryOrder, QuerySelect};
use sea_orm::sea_query::Expr;
use sea_orm::ActiveValue::Set;
use sea_orm::TransactionTrait;

use crate::database::entity::attachment::{self, Entity as Attachment};
use crate::database::entity::fragment::{self, Entity as Fragment};
use crate::database::entity::pool::{self, Entity as Pool, PoolModel};
use crate::database::StashDatabase;
use crate::error::{ServerError, ServerResult};
use crate::StateInner;
use stash::pool::PoolAlias;

/// A pool to be created.
#[derive(Debug, Clone)]
pub struct NewPool {
    pub alias: PoolAlias,
    pub name: String,
    pub description: String,
    pub max_file_size: Option<u64>,
    pub exist_lifecycle: Option<u32>,
    pub allow_cross_pool_ingress: bool,
    pub allow_cross_pool_egress: bool,
    pub is_public_indexable: bool,
    pub account_id: Option<u64>,
}

/// Changes to a pool.
///
/// Fields that are `None` are left alone.
#[derive(Debug, Clone, Default)]
pub struct PoolUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub max_file_size: Option<Option<u64>>,
    pub exist_lifecycle: Option<Option<u32>>,
    pub allow_cross_pool_ingress: Option<bool>,
    pub allow_cross_pool_egress: Option<bool>,
    pub is_public_indexable: Option<bool>,
}

impl NewPool {
    pub fn new(alias: PoolAlias) -> Self {
        Self {
            name: alias.as_str().to_owned(),
            alias,
            description: String::new(),
            max_file_size: None,
            exist_lifecycle: None,
            allow_cross_pool_ingress: false,
            allow_cross_pool_egress: false,
            is_public_indexable: false,
            account_id: None,
        }
    }
}

/// Resolves an alias through the configured alias map.
pub fn canonical_alias(state: &StateInner, alias: &str) -> ServerResult<PoolAlias> {
    if let Some(target) = state.config.pools.aliases.get(alias) {
        return Ok(target.clone());
    }

    Ok(alias.parse()?)
}

/// Returns the pool an upload addressed with `alias` goes to.
pub async fn resolve_pool(state: &StateInner, alias: &str) -> ServerResult<PoolModel> {
    let alias = canonical_alias(state, alias)?;
    let db = state.database().await?;

    db.find_pool_by_alias(&alias).await
}

/// Creates a pool.
pub async fn create_pool(state: &StateInner, new: NewPool) -> ServerResult<PoolModel> {
    let db = state.database().await?;

    let existing = Pool::find()
        .filter(pool::Column::Alias.eq(new.alias.as_str()))
        .one(db)
        .await
        .map_err(ServerError::database_error)?;

    if existing.is_some() {
        return Err(ServerError::PoolAlreadyExists);
    }

    let pool = pool::ActiveModel {
        alias: Set(new.alias.as_str().to_owned()),
        name: Set(new.name),
        description: Set(new.description),
        max_file_size: Set(new.max_file_size.map(|s| s as i64)),
        exist_lifecycle: Set(new.exist_lifecycle.map(|s| s as i32)),
        allow_cross_pool_ingress: Set(new.allow_cross_pool_ingress),
        allow_cross_pool_egress: Set(new.allow_cross_pool_egress),
        is_public_indexable: Set(new.is_public_indexable),
        account_id: Set(new.account_id.map(|id| id as i64)),
        created_at: Set(Utc::now()),
        ..Default::default()
    }
    .insert(db)
    .await
    .map_err(ServerError::database_error)?;

    tracing::info!("Created pool {}", pool.alias);

    Ok(pool)
}

/// Retrieves a pool by its numeric ID.
pub async fn get_pool(state: &StateInner, id: i64) -> ServerResult<PoolModel> {
    state.database().await?.find_pool(id).await
}

/// Retrieves a pool by alias, after alias mapping.
pub async fn get_pool_by_alias(state: &StateInner, alias: &str) -> ServerResult<PoolModel> {
    resolve_pool(state, alias).await
}

/// Lists all pools.
pub async fn list_pools(state: &StateInner) -> ServerResult<Vec<PoolModel>> {
    let db = state.database().await?;

    Pool::find()
        .order_by_asc(pool::Column::Alias)
        .all(db)
        .await
        .map_err(ServerError::database_error)
}

/// Updates a pool.
pub async fn update_pool(state: &StateInner, id: i64, update: PoolUpdate) -> ServerResult<PoolModel> {
    let db = state.database().await?;
    let mut model: pool::ActiveModel = db.find_pool(id).await?.into();

    if let Some(name) = update.name {
        model.name = Set(name);
    }

    if let Some(description) = update.description {
        model.description = Set(description);
    }

    if let Some(max_file_size) = update.max_file_size {
        model.max_file_size = Set(max_file_size.map(|s| s as i64));
    }

    if let Some(exist_lifecycle) = update.exist_lifecycle {
        model.exist_lifecycle = Set(exist_lifecycle.map(|s| s as i32));
    }

    if let Some(ingress) = update.allow_cross_pool_ingress {
        model.allow_cross_pool_ingress = Set(ingress);
    }

    if let Some(egress) = update.allow_cross_pool_egress {
        model.allow_cross_pool_egress = Set(egress);
    }

    if let Some(indexable) = update.is_public_indexable {
        model.is_public_indexable = Set(indexable);
    }

    model.update(db).await.map_err(ServerError::database_error)
}

/// Deletes a pool.
///
/// Attachments and fragments of the pool are kept and lose their pool.
pub async fn delete_pool(state: &StateInner, id: i64) -> ServerResult<()> {
    let db = state.database().await?;
    let txn = db.begin().await.map_err(ServerError::database_error)?;

    let attachment_rids: Vec<String> = Attachment::find()
        .select_only()
        .column(attachment::Column::Rid)
        .filter(attachment::Column::PoolId.eq(id))
        .into_tuple()
        .all(&txn)
        .await
        .map_err(ServerError::database_error)?;

    let fragment_rids: Vec<String> = Fragment::find()
        .select_only()
        .column(fragment::Column::Rid)
        .filter(fragment::Column::PoolId.eq(id))
        .into_tuple()
        .all(&txn)
        .await
        .map_err(ServerError::database_error)?;

    Attachment::update_many()
        .col_expr(attachment::Column::PoolId, Expr::value(Option::<i64>::None))
        .filter(attachment::Column::PoolId.eq(id))
        .exec(&txn)
        .await
        .map_err(ServerError::database_error)?;

    Fragment::update_many()
        .col_expr(fragment::Column::PoolId, Expr::value(Option::<i64>::None))
        .filter(fragment::Column::PoolId.eq(id))
        .exec(&txn)
        .await
        .map_err(ServerError::database_error)?;

    let deletion = Pool::delete_by_id(id)
        .exec(&txn)
        .await
        .map_err(ServerError::database_error)?;

    if deletion.rows_affected == 0 {
        return Err(ServerError::NoSuchPool);
    }

    txn.commit().await.map_err(ServerError::database_error)?;

    for rid in attachment_rids.iter() {
        state.cache.invalidate_attachment(rid).await;
    }
    for rid in fragment_rids.iter() {
        state.cache.invalidate_fragment(rid).await;
    }

    tracing::info!(
        "Deleted pool {}, detaching {} attachments and {} fragments",
        id,
        attachment_rids.len(),
        fragment_rids.len()
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::attachment::get_attachment;
    use crate::testing;
    use crate::upload::{create_fragment, get_fragment, NewAttachment, NewFragment};

    #[tokio::test]
    async fn test_pool_crud() {
        let env = testing::setup().await;
        let state = &env.state;

        let mut new = NewPool::new("media".parse().unwrap());
        new.max_file_size = Some(1024);
        let created = create_pool(state, new.clone()).await.unwrap();
        assert_eq!("media", created.alias);

        assert!(matches!(
            create_pool(state, new).await,
            Err(ServerError::PoolAlreadyExists)
        ));

        let updated = update_pool(
            state,
            created.id,
            PoolUpdate {
                description: Some("Media files".to_string()),
                max_file_size: Some(None),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!("Media files", updated.description);
        assert_eq!(None, updated.max_file_size);

        let aliases: Vec<String> = list_pools(state)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.alias)
            .collect();
        assert_eq!(vec!["default".to_string(), "media".to_string()], aliases);

        delete_pool(state, created.id).await.unwrap();
        assert!(matches!(
            get_pool(state, created.id).await,
            Err(ServerError::NoSuchPool)
        ));
        assert!(matches!(
            delete_pool(state, created.id).await,
            Err(ServerError::NoSuchPool)
        ));
    }

    #[tokio::test]
    async fn test_delete_pool_detaches_cached_records() {
        let env = testing::setup().await;
        let state = &env.state;

        let created = create_pool(state, NewPool::new("media".parse().unwrap()))
            .await
            .unwrap();
        let attachment = testing::upload_to(state, &testing::ACTOR, "media", "a.txt", b"abc").await;

        // Warm the cache
        let cached = get_attachment(state, &attachment.rid).await.unwrap();
        assert_eq!(Some(created.id), cached.pool_id);

        let fragment = create_fragment(
            state,
            &testing::ACTOR,
            NewFragment {
                file: NewAttachment::new("media", "b.bin"),
                size: 10,
                fingerprint: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(Some(created.id), get_fragment(state, &fragment.rid).await.unwrap().pool_id);

        delete_pool(state, created.id).await.unwrap();

        assert_eq!(None, get_attachment(state, &attachment.rid).await.unwrap().pool_id);
        assert_eq!(None, get_fragment(state, &fragment.rid).await.unwrap().pool_id);

        // Other pools are untouched
        let other = testing::upload(state, "c.txt", b"def").await;
        delete_pool(state, created.id).await.unwrap_err();
        assert_eq!(
            Some(env.pool.id),
            get_attachment(state, &other.rid).await.unwrap().pool_id
        );
    }

    #[tokio::test]
    async fn test_alias_mapping() {
        let env = testing::setup().await;

        // "avatar" maps to "default"
        let pool = get_pool_by_alias(&env.state, "avatar").await.unwrap();
        assert_eq!(env.pool.id, pool.id);

        assert!(matches!(
            get_pool_by_alias(&env.state, "nothing").await,
            Err(ServerError::NoSuchPool)
        ));

        assert!(matches!(
            get_pool_by_alias(&env.state, "_bad").await,
            Err(ServerError::StashError(_))
        ));
    }
}
