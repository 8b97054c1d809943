//! Database query functions for the `texts` table.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::Text;

/// Hex SHA-256 of the trimmed content. Two submissions that differ only in
/// surrounding whitespace share a text row.
pub fn content_hash(content: &str) -> String {
    hex::encode(Sha256::digest(content.trim().as_bytes()))
}

/// Number of whitespace-separated words.
pub fn word_count(content: &str) -> i32 {
    content.split_whitespace().count().try_into().unwrap_or(i32::MAX)
}

/// Return the text row for `content`, inserting it if it is not stored yet.
///
/// Concurrent inserts of the same content resolve through the unique hash
/// constraint: the loser's `ON CONFLICT` turns into a no-op update that
/// still returns the existing row.
pub async fn find_or_create_text(pool: &PgPool, content: &str) -> Result<Text> {
    let hash = content_hash(content);

    let text = sqlx::query_as::<_, Text>(
        "INSERT INTO texts (hash, content, word_count) \
         VALUES ($1, $2, $3) \
         ON CONFLICT (hash) DO UPDATE SET hash = EXCLUDED.hash \
         RETURNING *",
    )
    .bind(&hash)
    .bind(content)
    .bind(word_count(content))
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to find or create text {hash}"))?;

    Ok(text)
}

/// Fetch a text by ID.
pub async fn get_text(pool: &PgPool, id: Uuid) -> Result<Option<Text>> {
    let text = sqlx::query_as::<_, Text>("SELECT * FROM texts WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch text")?;

    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_ignores_surrounding_whitespace() {
        assert_eq!(content_hash("  The sky is blue.\n"), content_hash("The sky is blue."));
        assert_ne!(content_hash("The sky is blue."), content_hash("The sky is green."));
    }

    #[test]
    fn hash_is_64_hex_chars() {
        let hash = content_hash("Paris is in France.");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn word_count_splits_on_any_whitespace() {
        assert_eq!(word_count("The sky\tis\n blue."), 4);
        assert_eq!(word_count("   "), 0);
    }
}
