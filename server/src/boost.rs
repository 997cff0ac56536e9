//! Boost replication.
//!
//! A boost is a copy of an attachment's bytes in a secondary
//! destination. Boosts start out `Pending` and are activated in the
//! background:
//!
//! ```text
//! Pending -> Active | Error
//! Active <-> Suspended
//! ```
//!
//! Failed activations are not retried. Callers may delete the boost
//! and create a new one.

use chrono::Utc;
use sea_orm::entity::prelude::*;
use sea_orm::query::{QueryOrder, QuerySelect};
use sea_orm::ActiveValue::Set;
use tracing::instrument;

use crate::database::entity::attachment::{self, AttachmentModel};
use crate::database::entity::boost::{self, BoostModel, BoostStatus, Entity as Boost};
use crate::database::StashDatabase;
use crate::error::{ServerError, ServerResult};
use crate::{transfer, Actor, State, StateInner};

/// Creates a boost of an attachment and starts copying.
///
/// The boost is returned in the `Pending` state.
#[instrument(skip(state, attachment), fields(rid = %attachment.rid))]
pub async fn create_boost(
    state: &State,
    actor: &Actor,
    attachment: &AttachmentModel,
    destination: usize,
) -> ServerResult<BoostModel> {
    let destinations = state.destinations().await?;
    let target = destinations.get(destination)?;

    if !target.config.is_boost() {
        return Err(ServerError::DestinationNotBoostable { index: destination });
    }

    if attachment.is_temporary() {
        return Err(ServerError::NotInPermanentStorage);
    }

    let db = state.database().await?;
    let now = Utc::now();

    let boost = boost::ActiveModel {
        status: Set(BoostStatus::Pending),
        destination: Set(destination as i32),
        attachment_id: Set(attachment.id),
        account_id: Set(actor.db_id()?),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(db)
    .await
    .map_err(ServerError::database_error)?;

    tokio::spawn({
        let state = state.clone();
        let boost = boost.clone();
        let attachment = attachment.clone();
        async move {
            if let Err(e) = activate_boost(&state, &boost, &attachment).await {
                tracing::warn!("Failed to activate boost {}: {}", boost.id, e);
            }
        }
    });

    Ok(boost)
}

/// Copies the bytes of a pending boost.
///
/// The boost ends up `Active` on success and `Error` on failure.
#[instrument(skip_all, fields(boost_id = boost.id, rid = %attachment.rid))]
pub async fn activate_boost(
    state: &StateInner,
    boost: &BoostModel,
    attachment: &AttachmentModel,
) -> ServerResult<BoostModel> {
    let copy = transfer::copy_object(
        state,
        attachment.destination as usize,
        boost.destination as usize,
        &attachment.uuid,
    )
    .await;

    let status = match &copy {
        Ok(()) => BoostStatus::Active,
        Err(e) => {
            tracing::warn!("Copy for boost {} failed: {}", boost.id, e);
            BoostStatus::Error
        }
    };

    let updated = set_status(state, boost.id, status).await?;
    copy?;

    tracing::info!(
        "Boosted {} to destination {}",
        attachment.rid,
        boost.destination
    );

    Ok(updated)
}

/// Changes the status of a boost on behalf of its creator.
///
/// Only `Active` and `Suspended` may be requested, and only from
/// the other of the two.
pub async fn update_boost_status(
    state: &StateInner,
    actor: &Actor,
    id: i64,
    status: BoostStatus,
) -> ServerResult<BoostModel> {
    let db = state.database().await?;
    let boost = db.find_boost(id).await?;
    check_owner(actor, &boost)?;

    if !transition_allowed(boost.status, status) {
        return Err(ServerError::InvalidBoostStatus {
            status: status.to_string(),
        });
    }

    set_status(state, id, status).await
}

/// Deletes a boost and its copy.
///
/// The primary copy and the reference count are untouched.
pub async fn delete_boost(state: &StateInner, actor: &Actor, id: i64) -> ServerResult<()> {
    let db = state.database().await?;
    let boost = db.find_boost(id).await?;
    check_owner(actor, &boost)?;

    let attachment = db.find_attachment(boost.attachment_id).await?;

    Boost::delete_by_id(id)
        .exec(db)
        .await
        .map_err(ServerError::database_error)?;

    let destination = boost.destination as usize;
    if copy_unused(state, &attachment.uuid, destination).await? {
        transfer::enqueue_deletion(state, destination, attachment.uuid.clone()).await?;
    }

    tracing::info!("Deleted boost {}", id);

    Ok(())
}

/// Retrieves a boost.
pub async fn get_boost(state: &StateInner, id: i64) -> ServerResult<BoostModel> {
    state.database().await?.find_boost(id).await
}

/// Lists all boosts of an attachment.
pub async fn list_boosts_by_attachment(
    state: &StateInner,
    attachment_id: i64,
) -> ServerResult<Vec<BoostModel>> {
    let db = state.database().await?;

    Boost::find()
        .filter(boost::Column::AttachmentId.eq(attachment_id))
        .order_by_asc(boost::Column::Id)
        .all(db)
        .await
        .map_err(ServerError::database_error)
}

/// Lists the boosts created by an account, newest first.
pub async fn list_boosts_by_account(
    state: &StateInner,
    account_id: u64,
    take: u64,
    offset: u64,
) -> ServerResult<Vec<BoostModel>> {
    let db = state.database().await?;
    let account_id = i64::try_from(account_id).map_err(ServerError::request_error)?;

    Boost::find()
        .filter(boost::Column::AccountId.eq(account_id))
        .order_by_desc(boost::Column::Id)
        .limit(take)
        .offset(offset)
        .all(db)
        .await
        .map_err(ServerError::database_error)
}

/// Counts the boosts created by an account.
pub async fn count_boosts_by_account(state: &StateInner, account_id: u64) -> ServerResult<u64> {
    let db = state.database().await?;
    let account_id = i64::try_from(account_id).map_err(ServerError::request_error)?;

    Boost::find()
        .filter(boost::Column::AccountId.eq(account_id))
        .count(db)
        .await
        .map_err(ServerError::database_error)
}

/// Returns whether no boost serves the object in the destination anymore.
///
/// Links share the object name of their owner, so two boosts in the
/// same destination can point at one copy.
pub(crate) async fn copy_unused(state: &StateInner, uuid: &str, destination: usize) -> ServerResult<bool> {
    let db = state.database().await?;

    let remaining = Boost::find()
        .inner_join(attachment::Entity)
        .filter(attachment::Column::Uuid.eq(uuid))
        .filter(boost::Column::Destination.eq(destination as i32))
        .count(db)
        .await
        .map_err(ServerError::database_error)?;

    Ok(remaining == 0)
}

async fn set_status(state: &StateInner, id: i64, status: BoostStatus) -> ServerResult<BoostModel> {
    let db = state.database().await?;

    Boost::update(boost::ActiveModel {
        id: Set(id),
        status: Set(status),
        updated_at: Set(Utc::now()),
        ..Default::default()
    })
    .exec(db)
    .await
    .map_err(ServerError::database_error)
}

fn transition_allowed(from: BoostStatus, to: BoostStatus) -> bool {
    matches!(
        (from, to),
        (BoostStatus::Active, BoostStatus::Suspended) | (BoostStatus::Suspended, BoostStatus::Active)
    )
}

fn check_owner(actor: &Actor, boost: &BoostModel) -> ServerResult<()> {
    if boost.account_id != actor.db_id()? {
        return Err(ServerError::NotOwner);
    }

    Ok(())
}
