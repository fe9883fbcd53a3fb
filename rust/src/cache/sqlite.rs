use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};

use super::{CacheKey, CacheRecord, DmCache};
use crate::error::CacheError;
use crate::model::now_seconds;

const CACHE_DB_FILE: &str = "dm_cache.sqlite3";

/// One JSON record per `(scope, identity)` row.
pub struct SqliteCache {
    conn: Mutex<Connection>,
}

impl SqliteCache {
    pub fn open(data_dir: &Path) -> Result<Self, CacheError> {
        std::fs::create_dir_all(data_dir)?;
        let conn = Connection::open(data_dir.join(CACHE_DB_FILE))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, CacheError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, CacheError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS dm_cache (
                scope TEXT NOT NULL,
                identity TEXT NOT NULL,
                record TEXT NOT NULL,
                updated_at INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (scope, identity)
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl DmCache for SqliteCache {
    fn read(&self, key: &CacheKey) -> Result<Option<CacheRecord>, CacheError> {
        let raw: Option<String> = self
            .conn
            .lock()
            .query_row(
                "SELECT record FROM dm_cache WHERE scope = ?1 AND identity = ?2",
                rusqlite::params![key.scope, key.identity],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn write(&self, key: &CacheKey, record: &CacheRecord) -> Result<(), CacheError> {
        let json = serde_json::to_string(record)?;
        self.conn.lock().execute(
            "INSERT INTO dm_cache (scope, identity, record, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(scope, identity) DO UPDATE SET
                record = excluded.record,
                updated_at = excluded.updated_at",
            rusqlite::params![key.scope, key.identity, json, now_seconds() as i64],
        )?;
        Ok(())
    }

    fn delete(&self, key: &CacheKey) -> Result<(), CacheError> {
        self.conn.lock().execute(
            "DELETE FROM dm_cache WHERE scope = ?1 AND identity = ?2",
            rusqlite::params![key.scope, key.identity],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::StoredConversation;
    use crate::model::{StoredMessage, SyncCheckpoints};
    use nostr_sdk::prelude::*;

    fn sample_record() -> CacheRecord {
        let keys = Keys::generate();
        let event = EventBuilder::new(Kind::from(4), "ciphertext?iv=abc")
            .tag(Tag::public_key(Keys::generate().public_key()))
            .sign_with_keys(&keys)
            .unwrap();
        let mut record = CacheRecord {
            last_sync: SyncCheckpoints {
                nip04: Some(100),
                nip17: Some(200),
            },
            ..Default::default()
        };
        record.participants.insert(
            keys.public_key().to_hex(),
            StoredConversation {
                messages: vec![StoredMessage {
                    created_at: event.created_at.as_secs(),
                    event,
                    original_gift_wrap_id: None,
                }],
                last_activity: 5,
                has_nip04: true,
                has_nip17: false,
            },
        );
        record
    }

    #[test]
    fn unusable_data_dir_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();
        let err = SqliteCache::open(&blocker).err().expect("open must fail");
        assert!(matches!(err, CacheError::Io(_)), "got {err:?}");
    }

    #[test]
    fn record_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let key = CacheKey::new("default", "me");
        let record = sample_record();
        {
            let cache = SqliteCache::open(dir.path()).unwrap();
            cache.write(&key, &record).unwrap();
        }
        let cache = SqliteCache::open(dir.path()).unwrap();
        assert_eq!(cache.read(&key).unwrap(), Some(record));
    }

    #[test]
    fn scopes_do_not_collide() {
        let cache = SqliteCache::open_in_memory().unwrap();
        let staging = CacheKey::new("staging", "me");
        let prod = CacheKey::new("prod", "me");
        cache.write(&staging, &sample_record()).unwrap();

        assert!(cache.read(&prod).unwrap().is_none());
        cache.delete(&staging).unwrap();
        assert!(cache.read(&staging).unwrap().is_none());
    }

    #[test]
    fn corrupt_row_surfaces_as_error() {
        let cache = SqliteCache::open_in_memory().unwrap();
        cache
            .conn
            .lock()
            .execute(
                "INSERT INTO dm_cache (scope, identity, record) VALUES ('default', 'me', 'not json')",
                [],
            )
            .unwrap();
        let err = cache.read(&CacheKey::new("default", "me")).unwrap_err();
        assert!(matches!(err, CacheError::Serialization(_)));
    }
}
