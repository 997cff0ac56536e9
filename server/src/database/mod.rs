pub mod entity;
pub mod migration;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::query::QueryOrder;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::ActiveValue::Set;
use sea_orm::DatabaseConnection;

use crate::config::TEMPORARY_DESTINATION;
use crate::error::{ServerError, ServerResult};
use entity::attachment::{self, AttachmentModel, Entity as Attachment};
use entity::boost::{self, BoostModel, BoostStatus, Entity as Boost};
use entity::content_claim::{self, Entity as ContentClaim};
use entity::fragment::{self, Entity as Fragment, FragmentModel};
use entity::pool::{self, Entity as Pool, PoolModel};
use stash::hash::Hash;
use stash::pool::PoolAlias;

/// Age after which a content claim is considered abandoned.
///
/// Claims are normally released within seconds. One left behind by a
/// crashed worker must not block that content forever.
pub const CONTENT_CLAIM_TTL: Duration = Duration::from_secs(30 * 60);

#[async_trait]
pub trait StashDatabase: Send + Sync {
    /// Retrieves an attachment by its numeric ID.
    async fn find_attachment(&self, id: i64) -> ServerResult<AttachmentModel>;

    /// Retrieves an attachment by its public identifier.
    async fn find_attachment_by_rid(&self, rid: &str) -> ServerResult<AttachmentModel>;

    /// Retrieves the owner of some content that new uploads can link to.
    ///
    /// Only analyzed, permanently stored owners that aren't marked for
    /// cleanup are eligible.
    async fn find_owner_by_hash(
        &self,
        hash: &Hash,
        exclude_id: i64,
    ) -> ServerResult<Option<AttachmentModel>>;

    /// Retrieves a fragment by its public identifier.
    async fn find_fragment_by_rid(&self, rid: &str) -> ServerResult<FragmentModel>;

    /// Retrieves an unfinished fragment of an account by its fingerprint.
    async fn find_fragment_by_fingerprint(
        &self,
        account_id: i64,
        fingerprint: &str,
    ) -> ServerResult<Option<FragmentModel>>;

    /// Retrieves a pool by its numeric ID.
    async fn find_pool(&self, id: i64) -> ServerResult<PoolModel>;

    /// Retrieves a pool by its alias.
    async fn find_pool_by_alias(&self, alias: &PoolAlias) -> ServerResult<PoolModel>;

    /// Retrieves a boost.
    async fn find_boost(&self, id: i64) -> ServerResult<BoostModel>;

    /// Retrieves all active boosts of an attachment.
    async fn find_active_boosts(&self, attachment_id: i64) -> ServerResult<Vec<BoostModel>>;

    /// Atomically claims a fragment for merging.
    ///
    /// Returns false if somebody else is already merging it.
    async fn claim_fragment_merge(&self, fragment_id: i64) -> ServerResult<bool>;

    /// Releases a merge claim.
    async fn release_fragment_merge(&self, fragment_id: i64) -> ServerResult<()>;

    /// Atomically claims the owner election for some content.
    ///
    /// Returns false if another attachment holds the claim. Abandoned
    /// claims are taken over.
    async fn claim_content(&self, hash: &Hash, attachment_id: i64) -> ServerResult<bool>;

    /// Releases a content claim held by an attachment.
    async fn release_content(&self, hash: &Hash, attachment_id: i64) -> ServerResult<()>;
}

#[async_trait]
impl StashDatabase for DatabaseConnection {
    async fn find_attachment(&self, id: i64) -> ServerResult<AttachmentModel> {
        Attachment::find_by_id(id)
            .one(self)
            .await
            .map_err(ServerError::database_error)?
            .ok_or(ServerError::NoSuchAttachment)
    }

    async fn find_attachment_by_rid(&self, rid: &str) -> ServerResult<AttachmentModel> {
        Attachment::find()
            .filter(attachment::Column::Rid.eq(rid))
            .one(self)
            .await
            .map_err(ServerError::database_error)?
            .ok_or(ServerError::NoSuchAttachment)
    }

    async fn find_owner_by_hash(
        &self,
        hash: &Hash,
        exclude_id: i64,
    ) -> ServerResult<Option<AttachmentModel>> {
        Attachment::find()
            .filter(attachment::Column::Hash.eq(hash.to_typed_base16()))
            .filter(attachment::Column::Id.ne(exclude_id))
            .filter(attachment::Column::RefId.is_null())
            .filter(attachment::Column::IsAnalyzed.eq(true))
            .filter(attachment::Column::Destination.ne(TEMPORARY_DESTINATION as i32))
            .filter(attachment::Column::CleanedAt.is_null())
            .order_by_asc(attachment::Column::Id)
            .one(self)
            .await
            .map_err(ServerError::database_error)
    }

    async fn find_fragment_by_rid(&self, rid: &str) -> ServerResult<FragmentModel> {
        Fragment::find()
            .filter(fragment::Column::Rid.eq(rid))
            .one(self)
            .await
            .map_err(ServerError::database_error)?
            .ok_or(ServerError::NoSuchFragment)
    }

    async fn find_fragment_by_fingerprint(
        &self,
        account_id: i64,
        fingerprint: &str,
    ) -> ServerResult<Option<FragmentModel>> {
        Fragment::find()
            .filter(fragment::Column::AccountId.eq(account_id))
            .filter(fragment::Column::Fingerprint.eq(fingerprint))
            .filter(fragment::Column::IsMerging.eq(false))
            .order_by_desc(fragment::Column::CreatedAt)
            .one(self)
            .await
            .map_err(ServerError::database_error)
    }

    async fn find_pool(&self, id: i64) -> ServerResult<PoolModel> {
        Pool::find_by_id(id)
            .one(self)
            .await
            .map_err(ServerError::database_error)?
            .ok_or(ServerError::NoSuchPool)
    }

    async fn find_pool_by_alias(&self, alias: &PoolAlias) -> ServerResult<PoolModel> {
        Pool::find()
            .filter(pool::Column::Alias.eq(alias.as_str()))
            .one(self)
            .await
            .map_err(ServerError::database_error)?
            .ok_or(ServerError::NoSuchPool)
    }

    async fn find_boost(&self, id: i64) -> ServerResult<BoostModel> {
        Boost::find_by_id(id)
            .one(self)
            .await
            .map_err(ServerError::database_error)?
            .ok_or(ServerError::NoSuchBoost)
    }

    async fn find_active_boosts(&self, attachment_id: i64) -> ServerResult<Vec<BoostModel>> {
        Boost::find()
            .filter(boost::Column::AttachmentId.eq(attachment_id))
            .filter(boost::Column::Status.eq(BoostStatus::Active))
            .order_by_asc(boost::Column::Id)
            .all(self)
            .await
            .map_err(ServerError::database_error)
    }

    async fn claim_fragment_merge(&self, fragment_id: i64) -> ServerResult<bool> {
        let claim = Fragment::update_many()
            .col_expr(fragment::Column::IsMerging, Expr::value(true))
            .filter(fragment::Column::Id.eq(fragment_id))
            .filter(fragment::Column::IsMerging.eq(false))
            .exec(self)
            .await
            .map_err(ServerError::database_error)?;

        Ok(claim.rows_affected == 1)
    }

    async fn release_fragment_merge(&self, fragment_id: i64) -> ServerResult<()> {
        Fragment::update_many()
            .col_expr(fragment::Column::IsMerging, Expr::value(false))
            .filter(fragment::Column::Id.eq(fragment_id))
            .exec(self)
            .await
            .map_err(ServerError::database_error)?;

        Ok(())
    }

    async fn claim_content(&self, hash: &Hash, attachment_id: i64) -> ServerResult<bool> {
        let key = hash.to_typed_base16();
        let now = Utc::now();
        let ttl = ChronoDuration::from_std(CONTENT_CLAIM_TTL).map_err(ServerError::database_error)?;

        ContentClaim::delete_many()
            .filter(content_claim::Column::Hash.eq(key.as_str()))
            .filter(content_claim::Column::ClaimedAt.lt(now - ttl))
            .exec(self)
            .await
            .map_err(ServerError::database_error)?;

        let claim = content_claim::ActiveModel {
            hash: Set(key),
            attachment_id: Set(attachment_id),
            claimed_at: Set(now),
        };

        let insertion = ContentClaim::insert(claim)
            .on_conflict(
                OnConflict::column(content_claim::Column::Hash)
                    .do_nothing()
                    .to_owned(),
            )
            .exec(self)
            .await;

        match insertion {
            Ok(_) => Ok(true),
            Err(DbErr::RecordNotInserted) => Ok(false),
            Err(e) => Err(ServerError::database_error(e)),
        }
    }

    async fn release_content(&self, hash: &Hash, attachment_id: i64) -> ServerResult<()> {
        ContentClaim::delete_many()
            .filter(content_claim::Column::Hash.eq(hash.to_typed_base16()))
            .filter(content_claim::Column::AttachmentId.eq(attachment_id))
            .exec(self)
            .await
            .map_err(ServerError::database_error)?;

        Ok(())
    }
}

