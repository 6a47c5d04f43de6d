//! Shared test utilities for database operations

use sqlx::SqlitePool;

use super::Database;

/// In-memory pool with every migration applied
pub async fn test_pool() -> SqlitePool {
    let db = Database::new(None)
        .await
        .expect("Failed to create test database");
    db.pool().clone()
}

/// Insert a character row for prefill tests
pub async fn insert_character(pool: &SqlitePool, id: &str, name: &str, dexterity: i64, max_hp: i64) {
    sqlx::query(
        "INSERT INTO characters (id, name, class, level, dexterity, max_hit_points, current_hit_points, armor_class)
         VALUES (?, ?, 'fighter', 3, ?, ?, ?, 16)",
    )
    .bind(id)
    .bind(name)
    .bind(dexterity)
    .bind(max_hp)
    .bind(max_hp)
    .execute(pool)
    .await
    .expect("Failed to insert character");
}
