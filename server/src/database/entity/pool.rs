//! A policy container for attachments.

use sea_orm::entity::prelude::*;

use crate::error::{ServerError, ServerResult};
use stash::pool::PoolAlias;

pub type PoolModel = Model;

/// A policy container for attachments.
#[derive(Debug, Clone, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "pool")]
pub struct Model {
    /// Unique numeric ID of the pool.
    #[sea_orm(primary_key)]
    pub id: i64,

    /// Unique alias of the pool.
    #[sea_orm(column_type = "String(StringLen::N(50))", unique, indexed)]
    pub alias: String,

    /// Human-readable name.
    pub name: String,

    /// Description.
    pub description: String,

    /// Maximum size of a single file in bytes.
    pub max_file_size: Option<i64>,

    /// Seconds after which attachments without boosts expire.
    ///
    /// Expired attachments are marked and later swept by the
    /// garbage collector.
    pub exist_lifecycle: Option<i32>,

    /// Whether content of other pools may be linked into this pool.
    pub allow_cross_pool_ingress: bool,

    /// Whether content of this pool may be linked from other pools.
    pub allow_cross_pool_egress: bool,

    /// Whether attachments of this pool may be listed publicly.
    pub is_public_indexable: bool,

    /// ID of the account that owns the pool.
    pub account_id: Option<i64>,

    /// Timestamp when the pool is created.
    pub created_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::attachment::Entity")]
    Attachment,

    #[sea_orm(has_many = "super::fragment::Entity")]
    Fragment,
}

impl Model {
    /// Returns the validated alias.
    pub fn alias(&self) -> ServerResult<PoolAlias> {
        Ok(PoolAlias::new(self.alias.clone())?)
    }

    /// Returns whether a file of the given size fits.
    pub fn check_file_size(&self, size: u64) -> ServerResult<()> {
        if let Some(limit) = self.max_file_size {
            let limit = limit.max(0) as u64;

            if size > limit {
                return Err(ServerError::PoolSizeExceeded { size, limit });
            }
        }

        Ok(())
    }

    /// Returns whether content of `self` may be shared into `into`.
    pub fn allows_link_into(&self, into: &Self) -> bool {
        self.id == into.id || (self.allow_cross_pool_egress && into.allow_cross_pool_ingress)
    }
}

impl Related<super::attachment::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Attachment.def()
    }
}

impl Related<super::fragment::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Fragment.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
