//! An in-progress owner election for some content.

use sea_orm::entity::prelude::*;

pub type ContentClaimModel = Model;

/// Exclusive right to decide who owns some content.
///
/// An analysis worker holds the claim for a hash while it looks for an
/// owner and, failing that, promotes its own attachment. Others with
/// the same hash wait until the claim is released, so they find the
/// new owner instead of becoming owners themselves.
#[derive(Debug, Clone, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "content_claim")]
pub struct Model {
    /// The typed content hash.
    #[sea_orm(primary_key, auto_increment = false)]
    pub hash: String,

    /// ID of the attachment being analyzed.
    pub attachment_id: i64,

    /// Timestamp when the claim was taken.
    pub claimed_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
