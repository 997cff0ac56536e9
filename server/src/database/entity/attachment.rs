//! An uploaded file.

use sea_orm::entity::prelude::*;

use super::{Json, Metadata};
use crate::config::TEMPORARY_DESTINATION;

pub type AttachmentModel = Model;

/// The role an attachment plays.
#[derive(EnumIter, DeriveActiveEnum, Debug, Clone, Copy, PartialEq, Eq)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(1))")]
pub enum AttachmentType {
    /// A regular attachment.
    #[sea_orm(string_value = "N")]
    Normal,

    /// The thumbnail of another attachment.
    #[sea_orm(string_value = "T")]
    Thumbnail,

    /// The compressed rendition of another attachment.
    #[sea_orm(string_value = "C")]
    Compressed,
}

/// An uploaded file.
///
/// ## Deduplication
///
/// Attachments with identical content share the bytes of a single
/// _owner_. A _link_ has `ref_id` pointing at its owner and copies the
/// owner's `uuid` and `destination`. The owner's `ref_count` is the
/// number of links pointing at it, and an owner is never deleted
/// while it's referenced.
#[derive(Debug, Clone, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "attachment")]
pub struct Model {
    /// Unique numeric ID of the attachment.
    #[sea_orm(primary_key)]
    pub id: i64,

    /// The public identifier.
    #[sea_orm(column_type = "String(StringLen::N(16))", unique, indexed)]
    pub rid: String,

    /// Name of the object holding the bytes.
    ///
    /// For links, this is the name of the owner's object.
    pub uuid: String,

    /// The original file name.
    pub name: String,

    /// Alternative text.
    pub alt: String,

    /// Usage tag (e.g., "avatar").
    pub usage: String,

    /// The MIME type declared or inferred on upload.
    pub mime_type: String,

    /// The MIME type sniffed from the contents.
    pub detected_mime_type: Option<String>,

    /// The size in bytes.
    pub size: i64,

    /// The content hash.
    ///
    /// This always begins with "sha256:" with the hash in the
    /// hexadecimal format. It's only set once the full contents
    /// have been read.
    #[sea_orm(indexed)]
    pub hash: Option<String>,

    /// Index of the destination holding the bytes.
    pub destination: i32,

    /// Number of links pointing at this attachment.
    pub ref_count: i32,

    /// The role of the attachment.
    pub kind: AttachmentType,

    /// Metadata extracted during analysis.
    pub metadata: Json<Metadata>,

    /// Metadata supplied by the uploader.
    pub usermeta: Json<Metadata>,

    /// Whether the bytes have been fully received.
    pub is_uploaded: bool,

    /// Whether analysis has completed.
    pub is_analyzed: bool,

    /// Whether the owner this links to belongs to the same account.
    pub is_self_ref: bool,

    /// Whether the attachment is eligible for public listing.
    pub is_indexable: bool,

    /// ID of the owner, if this is a link.
    #[sea_orm(indexed)]
    pub ref_id: Option<i64>,

    /// ID of the thumbnail companion.
    pub thumbnail_id: Option<i64>,

    /// ID of the compressed companion.
    pub compressed_id: Option<i64>,

    /// ID of the pool the attachment belongs to.
    #[sea_orm(indexed)]
    pub pool_id: Option<i64>,

    /// ID of the account that uploaded the attachment.
    #[sea_orm(indexed)]
    pub account_id: i64,

    /// Timestamp when the attachment is created.
    pub created_at: ChronoDateTimeUtc,

    /// Timestamp when the attachment is last updated.
    pub updated_at: ChronoDateTimeUtc,

    /// Timestamp when the attachment was marked for cleanup.
    ///
    /// Marked attachments are deleted by the next sweep unless
    /// they are still referenced.
    pub cleaned_at: Option<ChronoDateTimeUtc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::pool::Entity",
        from = "Column::PoolId",
        to = "super::pool::Column::Id"
    )]
    Pool,

    #[sea_orm(has_many = "super::boost::Entity")]
    Boost,
}

impl Model {
    /// Returns whether this attachment shares the bytes of another one.
    pub fn is_link(&self) -> bool {
        self.ref_id.is_some()
    }

    /// Returns whether the bytes are still in temporary storage.
    pub fn is_temporary(&self) -> bool {
        self.destination as usize == TEMPORARY_DESTINATION
    }
}

impl Related<super::pool::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Pool.def()
    }
}

impl Related<super::boost::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Boost.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
