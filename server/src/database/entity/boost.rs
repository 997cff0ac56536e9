//! A copy of an attachment in a boost destination.

use sea_orm::entity::prelude::*;

pub type BoostModel = Model;

/// The state of a boost.
#[derive(EnumIter, DeriveActiveEnum, Debug, Clone, Copy, PartialEq, Eq)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(1))")]
pub enum BoostStatus {
    /// The copy is being made.
    #[sea_orm(string_value = "P")]
    Pending,

    /// The copy can be served.
    #[sea_orm(string_value = "A")]
    Active,

    /// The copy exists but must not be served.
    #[sea_orm(string_value = "S")]
    Suspended,

    /// Making the copy failed.
    #[sea_orm(string_value = "E")]
    Error,
}

/// A copy of an attachment in a boost destination.
///
/// Boosts let clients fetch popular content from a destination close
/// to them. Only `Active` boosts are ever handed out.
#[derive(Debug, Clone, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "boost")]
pub struct Model {
    /// Unique numeric ID of the boost.
    #[sea_orm(primary_key)]
    pub id: i64,

    /// The state of the copy.
    pub status: BoostStatus,

    /// Index of the boost destination.
    pub destination: i32,

    /// ID of the boosted attachment.
    #[sea_orm(indexed)]
    pub attachment_id: i64,

    /// ID of the account that created the boost.
    #[sea_orm(indexed)]
    pub account_id: i64,

    /// Timestamp when the boost is created.
    pub created_at: ChronoDateTimeUtc,

    /// Timestamp when the boost is last updated.
    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::attachment::Entity",
        from = "Column::AttachmentId",
        to = "super::attachment::Column::Id"
    )]
    Attachment,
}

impl std::fmt::Display for BoostStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::Error => "error",
        };

        f.write_str(s)
    }
}

impl Related<super::attachment::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Attachment.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
