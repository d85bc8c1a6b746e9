//! Stored firmware artifact metadata

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "artifacts")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String, // 64-char hex SHA256
    pub filename: String,
    pub size: i64,
    pub checksum: String, // "sha256:<hex>"
    pub uploaded_at: i64, // unix micros
    pub uploaded_by: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::target_binding::Entity")]
    Bindings,
}

impl Related<super::target_binding::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Bindings.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
