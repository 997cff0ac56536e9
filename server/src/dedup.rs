//! Content deduplication.
//!
//! When an analyzed attachment has the same hash as an existing owner,
//! it becomes a link to that owner instead of keeping its own bytes.

use chrono::Utc;
use sea_orm::entity::prelude::*;
use sea_orm::sea_query::Expr;
use sea_orm::ActiveValue::Set;
use sea_orm::TransactionTrait;
use tracing::instrument;

use crate::database::entity::attachment::{self, AttachmentModel, Entity as Attachment};
use crate::database::StashDatabase;
use crate::error::{ServerError, ServerResult};
use crate::StateInner;
use stash::hash::Hash;

/// The outcome of a link attempt.
#[derive(Debug, Clone)]
pub enum LinkOutcome {
    /// The attachment now shares the bytes of the owner.
    Linked {
        attachment: AttachmentModel,
        owner: AttachmentModel,
    },

    /// No eligible owner exists. The attachment is unchanged.
    NotLinked(AttachmentModel),
}

/// Tries to turn an analyzed attachment into a link.
///
/// The pools of both attachments must allow sharing content between
/// them. The owner's reference count and the attachment's link fields
/// are updated in a single transaction. Besides the link fields, the
/// analysis results carried by `attachment` are persisted as well.
#[instrument(skip_all, fields(rid = %attachment.rid))]
pub async fn try_link(state: &StateInner, attachment: AttachmentModel) -> ServerResult<LinkOutcome> {
    let hash = match &attachment.hash {
        Some(hash) => Hash::from_typed(hash)?,
        None => return Err(ServerError::HashMissing),
    };

    let db = state.database().await?;

    let owner = match db.find_owner_by_hash(&hash, attachment.id).await? {
        Some(owner) => owner,
        None => return Ok(LinkOutcome::NotLinked(attachment)),
    };

    if let (Some(owner_pool), Some(pool)) = (owner.pool_id, attachment.pool_id) {
        if owner_pool != pool {
            let owner_pool = db.find_pool(owner_pool).await?;
            let pool = db.find_pool(pool).await?;

            if !owner_pool.allows_link_into(&pool) {
                tracing::debug!(
                    "Pool {} does not share content with pool {}",
                    owner_pool.alias,
                    pool.alias
                );
                return Ok(LinkOutcome::NotLinked(attachment));
            }
        }
    }

    let txn = db.begin().await.map_err(ServerError::link_error)?;

    let bump = Attachment::update_many()
        .col_expr(
            attachment::Column::RefCount,
            Expr::col(attachment::Column::RefCount).add(1),
        )
        .filter(attachment::Column::Id.eq(owner.id))
        .filter(attachment::Column::RefId.is_null())
        .filter(attachment::Column::CleanedAt.is_null())
        .exec(&txn)
        .await
        .map_err(ServerError::link_error)?;

    if bump.rows_affected == 0 {
        // The owner went away or got marked in the meantime
        txn.rollback().await.map_err(ServerError::link_error)?;
        return Ok(LinkOutcome::NotLinked(attachment));
    }

    let linked = Attachment::update(attachment::ActiveModel {
        id: Set(attachment.id),
        ref_id: Set(Some(owner.id)),
        uuid: Set(owner.uuid.clone()),
        destination: Set(owner.destination),
        is_self_ref: Set(owner.account_id == attachment.account_id),
        hash: Set(attachment.hash.clone()),
        metadata: Set(attachment.metadata.clone()),
        detected_mime_type: Set(attachment.detected_mime_type.clone()),
        mime_type: Set(attachment.mime_type.clone()),
        is_analyzed: Set(attachment.is_analyzed),
        updated_at: Set(Utc::now()),
        ..Default::default()
    })
    .exec(&txn)
    .await
    .map_err(ServerError::link_error)?;

    txn.commit().await.map_err(ServerError::link_error)?;

    let owner = db.find_attachment(owner.id).await?;

    state.cache.put_attachment(&linked).await;
    state.cache.put_attachment(&owner).await;

    tracing::info!(
        "Linked {} to {} (now referenced {} times)",
        linked.rid,
        owner.rid,
        owner.ref_count
    );

    Ok(LinkOutcome::Linked {
        attachment: linked,
        owner,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::analysis::analyze_attachment;
    use crate::attachment::delete_attachment;
    use crate::pool::{create_pool, NewPool};
    use crate::testing;
    use crate::Actor;

    #[tokio::test]
    async fn test_direct_upload_dedup() {
        let env = testing::setup().await;
        let state = &env.state;
        let db = state.database().await.unwrap();

        let first = testing::upload(state, "x.bin", b"file x").await;
        let a1 = analyze_attachment(state, first.id).await.unwrap();
        assert_eq!(0, a1.ref_count);
        assert!(!a1.is_link());

        let other = Actor::new(2);
        let second = testing::upload_as(state, &other, "x-again.bin", b"file x").await;
        let a2 = analyze_attachment(state, second.id).await.unwrap();

        assert_eq!(Some(a1.id), a2.ref_id);
        assert_eq!(a1.uuid, a2.uuid);
        assert_eq!(a1.destination, a2.destination);
        assert!(!a2.is_self_ref);
        assert!(a2.is_analyzed);
        assert_eq!(1, db.find_attachment(a1.id).await.unwrap().ref_count);

        // The owner can't go while it's referenced
        assert!(matches!(
            delete_attachment(state, &testing::ACTOR, &a1.rid).await,
            Err(ServerError::AttachmentStillReferenced { ref_count: 1 })
        ));

        delete_attachment(state, &other, &a2.rid).await.unwrap();
        assert_eq!(0, db.find_attachment(a1.id).await.unwrap().ref_count);
        assert!(testing::object_exists(state, a1.destination as usize, &a1.uuid).await);

        delete_attachment(state, &testing::ACTOR, &a1.rid).await.unwrap();
        testing::wait_for(|| async {
            (!testing::object_exists(state, a1.destination as usize, &a1.uuid).await).then_some(())
        })
        .await;
    }

    #[tokio::test]
    async fn test_self_reference() {
        let env = testing::setup().await;
        let state = &env.state;

        testing::upload_promoted(state, "a.bin", b"same").await;
        let link = testing::upload_promoted(state, "b.bin", b"same").await;

        assert!(link.is_link());
        assert!(link.is_self_ref);

        // Links point at the permanent copy of the owner
        let stored = state.database().await.unwrap().find_attachment(link.id).await.unwrap();
        assert!(!stored.is_temporary());
    }

    #[tokio::test]
    async fn test_cross_pool_policy() {
        let env = testing::setup().await;
        let state = &env.state;

        let mut closed = NewPool::new("closed".parse().unwrap());
        closed.allow_cross_pool_egress = false;
        create_pool(state, closed).await.unwrap();

        let mut open = NewPool::new("open".parse().unwrap());
        open.allow_cross_pool_egress = true;
        open.allow_cross_pool_ingress = true;
        create_pool(state, open).await.unwrap();

        let mut receiving = NewPool::new("receiving".parse().unwrap());
        receiving.allow_cross_pool_ingress = true;
        create_pool(state, receiving).await.unwrap();

        // Egress disabled: stored independently
        let uploaded = testing::upload_to(state, &testing::ACTOR, "closed", "a.bin", b"private").await;
        let owner = analyze_attachment(state, uploaded.id).await.unwrap();

        let uploaded = testing::upload_to(state, &testing::ACTOR, "receiving", "a.bin", b"private").await;
        let copy = analyze_attachment(state, uploaded.id).await.unwrap();
        assert!(!copy.is_link());
        assert_ne!(owner.uuid, copy.uuid);

        // Both flags enabled: linked
        let uploaded = testing::upload_to(state, &testing::ACTOR, "open", "b.bin", b"public").await;
        let owner = analyze_attachment(state, uploaded.id).await.unwrap();

        let uploaded = testing::upload_to(state, &testing::ACTOR, "receiving", "b.bin", b"public").await;
        let link = analyze_attachment(state, uploaded.id).await.unwrap();
        assert_eq!(Some(owner.id), link.ref_id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_analysis_elects_one_owner() {
        let env = testing::setup().await;
        let db = env.state.database().await.unwrap();

        for round in 0..5u8 {
            let content = format!("identical bytes #{}", round);
            let first = testing::upload(&env.state, "a.bin", content.as_bytes()).await;
            let second = testing::upload(&env.state, "b.bin", content.as_bytes()).await;

            let analyses = [first.id, second.id].map(|id| {
                let state = env.state.clone();
                tokio::spawn(async move { analyze_attachment(&state, id).await })
            });

            let mut settled = Vec::new();
            for analysis in futures::future::join_all(analyses).await {
                settled.push(analysis.unwrap().unwrap());
            }

            let owners: Vec<_> = settled.iter().filter(|a| !a.is_link()).collect();
            let links: Vec<_> = settled.iter().filter(|a| a.is_link()).collect();
            assert_eq!(1, owners.len(), "round {}", round);
            assert_eq!(1, links.len(), "round {}", round);

            let owner = db.find_attachment(owners[0].id).await.unwrap();
            assert_eq!(Some(owner.id), links[0].ref_id);
            assert_eq!(owner.uuid, links[0].uuid);
            assert_eq!(1, owner.ref_count);

            let hash = Hash::sha256_from_bytes(content.as_bytes()).to_typed_base16();
            let stored_owners = Attachment::find()
                .filter(attachment::Column::Hash.eq(hash))
                .filter(attachment::Column::RefId.is_null())
                .count(db)
                .await
                .unwrap();
            assert_eq!(1, stored_owners);
        }
    }

    #[tokio::test]
    async fn test_content_claim() {
        let env = testing::setup().await;
        let db = env.state.database().await.unwrap();
        let hash = Hash::sha256_from_bytes(b"contended");

        assert!(db.claim_content(&hash, 1).await.unwrap());
        assert!(!db.claim_content(&hash, 2).await.unwrap());

        // Only the holder can release it
        db.release_content(&hash, 2).await.unwrap();
        assert!(!db.claim_content(&hash, 2).await.unwrap());

        db.release_content(&hash, 1).await.unwrap();
        assert!(db.claim_content(&hash, 2).await.unwrap());

        // Other content is unaffected
        assert!(db
            .claim_content(&Hash::sha256_from_bytes(b"other"), 3)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_hash_missing() {
        let env = testing::setup().await;

        let mut attachment = testing::upload(&env.state, "a.bin", b"whatever").await;
        attachment.hash = None;

        assert!(matches!(
            try_link(&env.state, attachment).await,
            Err(ServerError::HashMissing)
        ));
    }

    #[tokio::test]
    async fn test_unanalyzed_owner_is_ignored() {
        let env = testing::setup().await;

        // Neither is analyzed, so neither is eligible as an owner
        testing::upload(&env.state, "a.bin", b"same").await;
        let second = testing::upload(&env.state, "b.bin", b"same").await;

        assert!(matches!(
            try_link(&env.state, second).await.unwrap(),
            LinkOutcome::NotLinked(_)
        ));
    }
}
