//! Tracked-entity registry
//!
//! Explicit registration of the organizations the engine polls. Deleting an
//! entity is a destructive admin action: the cascade removes its posts,
//! cursor, snapshots, and growth rows.

use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{CreateEntity, TrackedEntity, UpdateEntity};

/// Register a new tracked entity. The slug must be unique.
pub async fn register_entity(pool: &SqlitePool, req: CreateEntity) -> Result<TrackedEntity> {
    if req.slug.is_empty() {
        return Err(Error::validation("entity slug must not be empty"));
    }
    if req.name.is_empty() {
        return Err(Error::validation("entity name must not be empty"));
    }

    let id = Uuid::new_v4().to_string();
    let now = Utc::now();

    sqlx::query(
        r#"
        INSERT INTO tracked_entities (id, name, handle, slug, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(&req.name)
    .bind(&req.handle)
    .bind(&req.slug)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    get_entity(pool, &id).await
}

/// Fetch one entity by id
pub async fn get_entity(pool: &SqlitePool, entity_id: &str) -> Result<TrackedEntity> {
    let entity: Option<TrackedEntity> =
        sqlx::query_as("SELECT * FROM tracked_entities WHERE id = ?")
            .bind(entity_id)
            .fetch_optional(pool)
            .await?;

    entity.ok_or_else(|| Error::not_found(format!("entity {}", entity_id)))
}

/// List all tracked entities, ordered by slug for stable iteration
pub async fn list_entities(pool: &SqlitePool) -> Result<Vec<TrackedEntity>> {
    let entities = sqlx::query_as("SELECT * FROM tracked_entities ORDER BY slug")
        .fetch_all(pool)
        .await?;
    Ok(entities)
}

/// Update an entity's name and/or handle. `None` fields are left unchanged.
pub async fn update_entity(
    pool: &SqlitePool,
    entity_id: &str,
    req: UpdateEntity,
) -> Result<TrackedEntity> {
    let current = get_entity(pool, entity_id).await?;
    let name = req.name.unwrap_or(current.name);
    let handle = req.handle.or(current.handle);
    let now = Utc::now();

    sqlx::query("UPDATE tracked_entities SET name = ?, handle = ?, updated_at = ? WHERE id = ?")
        .bind(&name)
        .bind(&handle)
        .bind(now)
        .bind(entity_id)
        .execute(pool)
        .await?;

    get_entity(pool, entity_id).await
}

/// Delete an entity and all of its history. Destructive; the foreign-key
/// cascade removes posts, cursor, snapshots, and growth periods.
pub async fn delete_entity(pool: &SqlitePool, entity_id: &str) -> Result<()> {
    let result = sqlx::query("DELETE FROM tracked_entities WHERE id = ?")
        .bind(entity_id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(Error::not_found(format!("entity {}", entity_id)));
    }

    log::info!("Deleted entity {} and its history", entity_id);
    Ok(())
}
