use crate::{format_timestamp, parse_timestamp, StorageError};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use spacemig_core::{InventoryError, ShardRecords, UploadRef, UploadSource};

/// Legacy upload listing and local shard records, stored next to the ledger tables.
pub struct SqliteInventory<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteInventory<'a> {
    pub(crate) fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn insert_upload(
        &self,
        space: &str,
        root: &str,
        inserted_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StorageError> {
        let changes = self.conn.execute(
            "INSERT OR IGNORE INTO uploads (space, root, inserted_at) VALUES (?1, ?2, ?3)",
            params![space, root, inserted_at.map(format_timestamp)],
        )?;
        Ok(changes > 0)
    }

    pub fn upsert_shard(&self, space: &str, shard: &str, size: u64) -> Result<(), StorageError> {
        self.conn.execute(
            "
            INSERT INTO shards (space, shard, size) VALUES (?1, ?2, ?3)
            ON CONFLICT(space, shard) DO UPDATE SET size=excluded.size
            ",
            params![space, shard, size as i64],
        )?;
        Ok(())
    }

    pub fn upload_count(&self, space: &str) -> Result<u64, StorageError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM uploads WHERE space = ?1",
            [space],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn list_uploads(
        &self,
        space: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Vec<UploadRef>, StorageError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT root, inserted_at
            FROM uploads
            WHERE space = ?1 AND root > ?2
            ORDER BY root ASC
            LIMIT ?3
            ",
        )?;
        let rows = stmt.query_map(
            params![space, cursor.unwrap_or(""), limit.max(1) as i64],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?)),
        )?;

        let mut uploads = Vec::new();
        for row in rows {
            let (root, inserted_at) = row?;
            let inserted_at = inserted_at
                .map(|value| parse_timestamp(&value))
                .transpose()?;
            uploads.push(UploadRef { root, inserted_at });
        }
        Ok(uploads)
    }

    fn lookup_shard(&self, space: &str, shard: &str) -> Result<Option<u64>, StorageError> {
        let size = self
            .conn
            .query_row(
                "SELECT size FROM shards WHERE space = ?1 AND shard = ?2",
                params![space, shard],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(size.map(|size| size as u64))
    }
}

impl UploadSource for SqliteInventory<'_> {
    fn uploads_after(
        &self,
        space: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Vec<UploadRef>, InventoryError> {
        self.list_uploads(space, cursor, limit)
            .map_err(|err| InventoryError::new(err.to_string()))
    }
}

impl ShardRecords for SqliteInventory<'_> {
    fn shard_size(&self, space: &str, shard: &str) -> Result<Option<u64>, InventoryError> {
        self.lookup_shard(space, shard)
            .map_err(|err| InventoryError::new(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use crate::MigrationLedger;
    use spacemig_core::{ShardRecords, UploadSource};

    #[test]
    fn uploads_page_after_cursor_in_root_order() {
        let ledger = MigrationLedger::open_in_memory().expect("open ledger");
        let inventory = ledger.inventory();
        for root in ["bafy3", "bafy1", "bafy2"] {
            assert!(inventory.insert_upload("space-a", root, None).expect("insert"));
        }
        assert!(!inventory.insert_upload("space-a", "bafy1", None).expect("dup"));
        inventory.insert_upload("space-b", "bafy0", None).expect("other space");

        let first = inventory.uploads_after("space-a", None, 2).expect("page");
        let roots: Vec<_> = first.iter().map(|u| u.root.as_str()).collect();
        assert_eq!(roots, vec!["bafy1", "bafy2"]);

        let rest = inventory
            .uploads_after("space-a", Some("bafy2"), 2)
            .expect("page");
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].root, "bafy3");
        assert_eq!(inventory.upload_count("space-a").expect("count"), 3);
    }

    #[test]
    fn shard_sizes_are_scoped_by_space() {
        let ledger = MigrationLedger::open_in_memory().expect("open ledger");
        let inventory = ledger.inventory();
        inventory.upsert_shard("space-a", "bagshard", 100).expect("shard");
        inventory.upsert_shard("space-a", "bagshard", 120).expect("resize");

        assert_eq!(
            inventory.shard_size("space-a", "bagshard").expect("lookup"),
            Some(120)
        );
        assert_eq!(
            inventory.shard_size("space-b", "bagshard").expect("lookup"),
            None
        );
    }
}
