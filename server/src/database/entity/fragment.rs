//! A multipart upload in progress.

use std::collections::BTreeMap;

use sea_orm::entity::prelude::*;

use super::{Json, Metadata};

pub type FragmentModel = Model;

/// Chunk IDs mapped to their ordinals.
pub type ChunkMap = BTreeMap<String, i32>;

/// A multipart upload in progress.
///
/// The declared size is split into chunks of the configured chunk size,
/// each of which is addressed by a random ID. Uploaded chunks are stored
/// in the temporary destination as `{uuid}.part{chunk_id}`. Once all
/// chunks are present, they are concatenated into `{uuid}` and the
/// fragment is replaced by an attachment.
#[derive(Debug, Clone, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "fragment")]
pub struct Model {
    /// Unique numeric ID of the fragment.
    #[sea_orm(primary_key)]
    pub id: i64,

    /// The public identifier.
    #[sea_orm(column_type = "String(StringLen::N(16))", unique, indexed)]
    pub rid: String,

    /// Name of the merged object.
    pub uuid: String,

    /// The original file name.
    pub name: String,

    /// Alternative text.
    pub alt: String,

    /// Usage tag.
    pub usage: String,

    /// The declared MIME type.
    pub mime_type: String,

    /// The declared size in bytes.
    pub size: i64,

    /// Client-supplied fingerprint of the file.
    ///
    /// Used to find an unfinished fragment of the same file.
    #[sea_orm(indexed)]
    pub fingerprint: Option<String>,

    /// The chunks making up the file.
    pub chunks: Json<ChunkMap>,

    /// Metadata supplied by the uploader.
    pub usermeta: Json<Metadata>,

    /// Whether the merged attachment is listed in searches.
    pub is_indexable: bool,

    /// Whether the fragment is being merged.
    pub is_merging: bool,

    /// ID of the pool the attachment will belong to.
    pub pool_id: Option<i64>,

    /// ID of the account that created the fragment.
    #[sea_orm(indexed)]
    pub account_id: i64,

    /// Timestamp when the fragment is created.
    pub created_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::pool::Entity",
        from = "Column::PoolId",
        to = "super::pool::Column::Id"
    )]
    Pool,
}

impl Model {
    /// Returns the chunk IDs in the order they make up the file.
    pub fn ordered_chunk_ids(&self) -> Vec<String> {
        let mut chunks: Vec<(&String, &i32)> = self.chunks.0.iter().collect();
        chunks.sort_by_key(|(_, ordinal)| **ordinal);
        chunks.into_iter().map(|(id, _)| id.to_owned()).collect()
    }
}

impl Related<super::pool::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Pool.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
