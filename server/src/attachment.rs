//! Attachment operations.
//!
//! Every mutation here writes through to the metadata cache or
//! invalidates the stale entry.

use chrono::Utc;
use sea_orm::entity::prelude::*;
use sea_orm::query::{QueryOrder, QuerySelect};
use sea_orm::sea_query::Expr;
use sea_orm::ActiveValue::Set;
use sea_orm::{Condition, TransactionTrait};
use tracing::instrument;

use crate::database::entity::attachment::{
    self, AttachmentModel, AttachmentType, Entity as Attachment,
};
use crate::database::entity::boost::{self, Entity as Boost};
use crate::database::entity::{Json, Metadata};
use crate::database::StashDatabase;
use crate::error::{ServerError, ServerResult};
use crate::transfer::DeletionTask;
use crate::{boost as boosts, Actor, StateInner};
use stash::rid::validate_rid;

/// Changes to an attachment.
///
/// Fields that are `None` are left alone.
#[derive(Debug, Clone, Default)]
pub struct AttachmentUpdate {
    pub name: Option<String>,
    pub alt: Option<String>,
    pub usage: Option<String>,
    pub usermeta: Option<Metadata>,
    pub is_indexable: Option<bool>,
}

/// Criteria for listing attachments.
#[derive(Debug, Clone, Default)]
pub struct AttachmentFilter {
    /// Only attachments of this account.
    pub account_id: Option<u64>,

    /// Only attachments of this pool.
    pub pool_id: Option<i64>,

    /// Only attachments with this indexable flag.
    pub is_indexable: Option<bool>,
}

/// Retrieves an attachment by its public identifier.
pub async fn get_attachment(state: &StateInner, rid: &str) -> ServerResult<AttachmentModel> {
    validate_rid(rid)?;

    if let Some(attachment) = state.cache.get_attachment(rid).await {
        return Ok(attachment);
    }

    let db = state.database().await?;
    let attachment = db.find_attachment_by_rid(rid).await?;
    state.cache.put_attachment(&attachment).await;

    Ok(attachment)
}

/// Retrieves an attachment by its numeric ID.
pub async fn get_attachment_by_id(state: &StateInner, id: i64) -> ServerResult<AttachmentModel> {
    let db = state.database().await?;
    let attachment = db.find_attachment(id).await?;
    state.cache.put_attachment(&attachment).await;

    Ok(attachment)
}

/// Updates the user-editable fields of an attachment.
pub async fn update_attachment(
    state: &StateInner,
    actor: &Actor,
    rid: &str,
    update: AttachmentUpdate,
) -> ServerResult<AttachmentModel> {
    let db = state.database().await?;
    let existing = db.find_attachment_by_rid(rid).await?;
    check_owner(actor, &existing)?;

    let mut model = attachment::ActiveModel {
        id: Set(existing.id),
        updated_at: Set(Utc::now()),
        ..Default::default()
    };

    if let Some(name) = update.name {
        model.name = Set(name);
    }

    if let Some(alt) = update.alt {
        model.alt = Set(alt);
    }

    if let Some(usage) = update.usage {
        check_usage(state, &usage)?;
        model.usage = Set(usage);
    }

    if let Some(usermeta) = update.usermeta {
        model.usermeta = Set(Json(usermeta));
    }

    if let Some(is_indexable) = update.is_indexable {
        model.is_indexable = Set(is_indexable);
    }

    let updated = Attachment::update(model)
        .exec(db)
        .await
        .map_err(ServerError::database_error)?;

    state.cache.put_attachment(&updated).await;

    Ok(updated)
}

/// Deletes an attachment on behalf of its uploader.
pub async fn delete_attachment(state: &StateInner, actor: &Actor, rid: &str) -> ServerResult<()> {
    let db = state.database().await?;
    let attachment = db.find_attachment_by_rid(rid).await?;
    check_owner(actor, &attachment)?;

    remove_attachment(state, &attachment).await
}

/// Removes an attachment record and queues its bytes for deletion.
pub(crate) async fn remove_attachment(state: &StateInner, attachment: &AttachmentModel) -> ServerResult<()> {
    for task in delete_record(state, attachment).await? {
        state.deletion_queue.publish(task).await?;
    }

    Ok(())
}

/// Removes an attachment record.
///
/// Owners that are still referenced are refused. Removing a link
/// decrements its owner's reference count in the same transaction.
///
/// Returns the objects nothing refers to anymore. The primary object
/// is only among them if the record owned it.
#[instrument(skip_all, fields(rid = %attachment.rid))]
pub(crate) async fn delete_record(
    state: &StateInner,
    attachment: &AttachmentModel,
) -> ServerResult<Vec<DeletionTask>> {
    let db = state.database().await?;

    let boost_copies = Boost::find()
        .filter(boost::Column::AttachmentId.eq(attachment.id))
        .all(db)
        .await
        .map_err(ServerError::database_error)?;

    let companions_of = Attachment::find()
        .filter(
            Condition::any()
                .add(attachment::Column::ThumbnailId.eq(attachment.id))
                .add(attachment::Column::CompressedId.eq(attachment.id)),
        )
        .all(db)
        .await
        .map_err(ServerError::database_error)?;

    let txn = db.begin().await.map_err(ServerError::database_error)?;

    let deletion = Attachment::delete_many()
        .filter(attachment::Column::Id.eq(attachment.id))
        .filter(attachment::Column::RefCount.eq(0))
        .exec(&txn)
        .await
        .map_err(ServerError::database_error)?;

    if deletion.rows_affected == 0 {
        txn.rollback().await.map_err(ServerError::database_error)?;

        let current = db.find_attachment(attachment.id).await?;
        return Err(ServerError::AttachmentStillReferenced {
            ref_count: current.ref_count,
        });
    }

    if let Some(owner_id) = attachment.ref_id {
        Attachment::update_many()
            .col_expr(
                attachment::Column::RefCount,
                Expr::col(attachment::Column::RefCount).sub(1),
            )
            .filter(attachment::Column::Id.eq(owner_id))
            .filter(attachment::Column::RefCount.gt(0))
            .exec(&txn)
            .await
            .map_err(ServerError::database_error)?;
    }

    Boost::delete_many()
        .filter(boost::Column::AttachmentId.eq(attachment.id))
        .exec(&txn)
        .await
        .map_err(ServerError::database_error)?;

    Attachment::update_many()
        .col_expr(attachment::Column::ThumbnailId, Expr::value(Option::<i64>::None))
        .filter(attachment::Column::ThumbnailId.eq(attachment.id))
        .exec(&txn)
        .await
        .map_err(ServerError::database_error)?;

    Attachment::update_many()
        .col_expr(attachment::Column::CompressedId, Expr::value(Option::<i64>::None))
        .filter(attachment::Column::CompressedId.eq(attachment.id))
        .exec(&txn)
        .await
        .map_err(ServerError::database_error)?;

    txn.commit().await.map_err(ServerError::database_error)?;

    state.cache.invalidate_attachment(&attachment.rid).await;
    for companion in companions_of {
        state.cache.invalidate_attachment(&companion.rid).await;
    }

    let mut garbage = Vec::new();

    if let Some(owner_id) = attachment.ref_id {
        match db.find_attachment(owner_id).await {
            Ok(owner) => state.cache.put_attachment(&owner).await,
            Err(ServerError::NoSuchAttachment) => {}
            Err(e) => return Err(e),
        }
    } else {
        garbage.push(DeletionTask {
            destination: attachment.destination as usize,
            name: attachment.uuid.clone(),
        });
    }

    for copy in boost_copies {
        let destination = copy.destination as usize;
        if boosts::copy_unused(state, &attachment.uuid, destination).await? {
            garbage.push(DeletionTask {
                destination,
                name: attachment.uuid.clone(),
            });
        }
    }

    tracing::info!("Removed attachment {}", attachment.rid);

    Ok(garbage)
}

/// Lists attachments, newest first.
pub async fn list_attachments(
    state: &StateInner,
    filter: &AttachmentFilter,
    take: u64,
    offset: u64,
) -> ServerResult<Vec<AttachmentModel>> {
    let db = state.database().await?;

    filtered(filter)?
        .order_by_desc(attachment::Column::Id)
        .limit(take)
        .offset(offset)
        .all(db)
        .await
        .map_err(ServerError::database_error)
}

/// Counts attachments.
pub async fn count_attachments(state: &StateInner, filter: &AttachmentFilter) -> ServerResult<u64> {
    let db = state.database().await?;

    filtered(filter)?
        .count(db)
        .await
        .map_err(ServerError::database_error)
}

/// Makes `thumbnail` the thumbnail of the attachment.
pub async fn set_thumbnail(
    state: &StateInner,
    actor: &Actor,
    rid: &str,
    thumbnail_rid: &str,
) -> ServerResult<AttachmentModel> {
    let db = state.database().await?;
    let thumbnail = db.find_attachment_by_rid(thumbnail_rid).await?;

    let mime = thumbnail
        .detected_mime_type
        .as_deref()
        .unwrap_or(&thumbnail.mime_type);
    if !mime.starts_with("image/") {
        return Err(ServerError::NotThumbnailCandidate);
    }

    set_companion(state, actor, rid, Some(thumbnail), Companion::Thumbnail).await
}

/// Detaches the thumbnail of the attachment.
pub async fn unset_thumbnail(state: &StateInner, actor: &Actor, rid: &str) -> ServerResult<AttachmentModel> {
    set_companion(state, actor, rid, None, Companion::Thumbnail).await
}

/// Makes `compressed` the compressed rendition of the attachment.
pub async fn set_compressed(
    state: &StateInner,
    actor: &Actor,
    rid: &str,
    compressed_rid: &str,
) -> ServerResult<AttachmentModel> {
    let db = state.database().await?;
    let compressed = db.find_attachment_by_rid(compressed_rid).await?;

    set_companion(state, actor, rid, Some(compressed), Companion::Compressed).await
}

/// Detaches the compressed rendition of the attachment.
pub async fn unset_compressed(state: &StateInner, actor: &Actor, rid: &str) -> ServerResult<AttachmentModel> {
    set_companion(state, actor, rid, None, Companion::Compressed).await
}

/// Checks a usage tag against the accepted usages.
pub fn check_usage(state: &StateInner, usage: &str) -> ServerResult<()> {
    if usage_accepted(&state.config.pools.accepted_usages, usage) {
        Ok(())
    } else {
        Err(ServerError::InvalidUsage {
            usage: usage.to_owned(),
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum Companion {
    Thumbnail,
    Compressed,
}

impl Companion {
    fn kind(self) -> AttachmentType {
        match self {
            Self::Thumbnail => AttachmentType::Thumbnail,
            Self::Compressed => AttachmentType::Compressed,
        }
    }

    fn current(self, attachment: &AttachmentModel) -> Option<i64> {
        match self {
            Self::Thumbnail => attachment.thumbnail_id,
            Self::Compressed => attachment.compressed_id,
        }
    }
}

async fn set_companion(
    state: &StateInner,
    actor: &Actor,
    rid: &str,
    companion: Option<AttachmentModel>,
    role: Companion,
) -> ServerResult<AttachmentModel> {
    let db = state.database().await?;
    let attachment = db.find_attachment_by_rid(rid).await?;
    check_owner(actor, &attachment)?;

    if let Some(companion) = &companion {
        check_owner(actor, companion)?;

        if companion.id == attachment.id {
            return Err(ServerError::RequestError(anyhow::anyhow!(
                "An attachment cannot be its own companion"
            )));
        }
    }

    let now = Utc::now();
    let txn = db.begin().await.map_err(ServerError::database_error)?;

    let mut touched = Vec::new();

    // The previous companion goes back to being a regular attachment
    if let Some(previous) = role.current(&attachment) {
        if companion.as_ref().map(|c| c.id) != Some(previous) {
            let reverted = Attachment::update_many()
                .col_expr(attachment::Column::Kind, Expr::value(AttachmentType::Normal))
                .col_expr(attachment::Column::UpdatedAt, Expr::value(now))
                .filter(attachment::Column::Id.eq(previous))
                .exec(&txn)
                .await
                .map_err(ServerError::database_error)?;

            if reverted.rows_affected > 0 {
                touched.push(previous);
            }
        }
    }

    let companion_id = companion.as_ref().map(|c| c.id);
    if let Some(id) = companion_id {
        Attachment::update(attachment::ActiveModel {
            id: Set(id),
            kind: Set(role.kind()),
            updated_at: Set(now),
            ..Default::default()
        })
        .exec(&txn)
        .await
        .map_err(ServerError::database_error)?;

        touched.push(id);
    }

    let mut model = attachment::ActiveModel {
        id: Set(attachment.id),
        updated_at: Set(now),
        ..Default::default()
    };
    match role {
        Companion::Thumbnail => model.thumbnail_id = Set(companion_id),
        Companion::Compressed => model.compressed_id = Set(companion_id),
    }

    let updated = Attachment::update(model)
        .exec(&txn)
        .await
        .map_err(ServerError::database_error)?;

    txn.commit().await.map_err(ServerError::database_error)?;

    state.cache.put_attachment(&updated).await;
    for id in touched {
        let companion = db.find_attachment(id).await?;
        state.cache.put_attachment(&companion).await;
    }

    Ok(updated)
}

fn filtered(filter: &AttachmentFilter) -> ServerResult<Select<Attachment>> {
    let mut query = Attachment::find();

    if let Some(account_id) = filter.account_id {
        let account_id = i64::try_from(account_id).map_err(ServerError::request_error)?;
        query = query.filter(attachment::Column::AccountId.eq(account_id));
    }

    if let Some(pool_id) = filter.pool_id {
        query = query.filter(attachment::Column::PoolId.eq(pool_id));
    }

    if let Some(is_indexable) = filter.is_indexable {
        query = query.filter(attachment::Column::IsIndexable.eq(is_indexable));
    }

    Ok(query)
}

fn check_owner(actor: &Actor, attachment: &AttachmentModel) -> ServerResult<()> {
    if attachment.account_id != actor.db_id()? {
        return Err(ServerError::NotOwner);
    }

    Ok(())
}

fn usage_accepted(accepted: &[String], usage: &str) -> bool {
    accepted.is_empty() || accepted.iter().any(|a| a == usage)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::testing;

    #[test]
    fn test_usage_accepted() {
        assert!(usage_accepted(&[], "anything"));

        let accepted = vec!["avatar".to_string(), "banner".to_string()];
        assert!(usage_accepted(&accepted, "avatar"));
        assert!(!usage_accepted(&accepted, "poster"));
        assert!(!usage_accepted(&accepted, ""));
    }

    #[tokio::test]
    async fn test_update_attachment() {
        let env = testing::setup().await;
        let attachment = testing::upload(&env.state, "a.txt", b"hello").await;

        let mut usermeta = Metadata::new();
        usermeta.insert("caption".to_string(), "hi".into());

        let updated = update_attachment(
            &env.state,
            &testing::ACTOR,
            &attachment.rid,
            AttachmentUpdate {
                alt: Some("greeting".to_string()),
                usermeta: Some(usermeta.clone()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!("a.txt", updated.name);
        assert_eq!("greeting", updated.alt);
        assert_eq!(usermeta, updated.usermeta.0);

        // Written through the cache
        let cached = get_attachment(&env.state, &attachment.rid).await.unwrap();
        assert_eq!("greeting", cached.alt);

        let stranger = Actor::new(99);
        assert!(matches!(
            update_attachment(&env.state, &stranger, &attachment.rid, AttachmentUpdate::default()).await,
            Err(ServerError::NotOwner)
        ));
    }

    #[tokio::test]
    async fn test_list_and_count() {
        let env = testing::setup().await;
        testing::upload(&env.state, "a.txt", b"a").await;
        testing::upload(&env.state, "b.txt", b"b").await;
        let other = testing::upload_as(&env.state, &Actor::new(2), "c.txt", b"c").await;

        let all = AttachmentFilter::default();
        assert_eq!(3, count_attachments(&env.state, &all).await.unwrap());

        let mine = AttachmentFilter {
            account_id: Some(testing::ACTOR.account_id),
            ..Default::default()
        };
        assert_eq!(2, count_attachments(&env.state, &mine).await.unwrap());

        let page = list_attachments(&env.state, &all, 2, 0).await.unwrap();
        assert_eq!(2, page.len());
        assert_eq!(other.rid, page[0].rid);

        let rest = list_attachments(&env.state, &all, 2, 2).await.unwrap();
        assert_eq!(1, rest.len());
        assert_eq!("a.txt", rest[0].name);
    }

    #[tokio::test]
    async fn test_thumbnail() {
        let env = testing::setup().await;
        let attachment = testing::upload(&env.state, "video.mp4", b"video").await;
        let text = testing::upload(&env.state, "notes.txt", b"notes").await;
        let thumbnail = testing::upload(&env.state, "thumb.png", b"png").await;

        assert!(matches!(
            set_thumbnail(&env.state, &testing::ACTOR, &attachment.rid, &text.rid).await,
            Err(ServerError::NotThumbnailCandidate)
        ));

        let updated = set_thumbnail(&env.state, &testing::ACTOR, &attachment.rid, &thumbnail.rid)
            .await
            .unwrap();
        assert_eq!(Some(thumbnail.id), updated.thumbnail_id);

        let thumbnail_now = get_attachment(&env.state, &thumbnail.rid).await.unwrap();
        assert_eq!(AttachmentType::Thumbnail, thumbnail_now.kind);

        let updated = unset_thumbnail(&env.state, &testing::ACTOR, &attachment.rid)
            .await
            .unwrap();
        assert_eq!(None, updated.thumbnail_id);

        let thumbnail_now = get_attachment(&env.state, &thumbnail.rid).await.unwrap();
        assert_eq!(AttachmentType::Normal, thumbnail_now.kind);
    }

    #[tokio::test]
    async fn test_compressed() {
        let env = testing::setup().await;
        let attachment = testing::upload(&env.state, "big.bin", b"big").await;
        let compressed = testing::upload(&env.state, "small.bin", b"small").await;

        let updated = set_compressed(&env.state, &testing::ACTOR, &attachment.rid, &compressed.rid)
            .await
            .unwrap();
        assert_eq!(Some(compressed.id), updated.compressed_id);

        let compressed_now = get_attachment_by_id(&env.state, compressed.id).await.unwrap();
        assert_eq!(AttachmentType::Compressed, compressed_now.kind);

        let updated = unset_compressed(&env.state, &testing::ACTOR, &attachment.rid)
            .await
            .unwrap();
        assert_eq!(None, updated.compressed_id);
        assert_eq!(
            AttachmentType::Normal,
            get_attachment_by_id(&env.state, compressed.id).await.unwrap().kind
        );

        set_compressed(&env.state, &testing::ACTOR, &attachment.rid, &compressed.rid)
            .await
            .unwrap();

        // Removing the companion clears the reference
        remove_attachment(&env.state, &get_attachment(&env.state, &compressed.rid).await.unwrap())
            .await
            .unwrap();

        let attachment = get_attachment(&env.state, &attachment.rid).await.unwrap();
        assert_eq!(None, attachment.compressed_id);
    }
}
