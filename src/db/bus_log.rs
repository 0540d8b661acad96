//! Durable storage behind the message bus: topic log, consumer offsets, dead letters.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Result as SqlResult};

use super::models::{BusRecord, DeadLetter};
use super::store::{format_db_time, parse_db_time, DbError, Store};

impl Store {
    /// Append a message to a topic partition. Returns the assigned sequence number.
    pub fn append_bus_message(
        &self,
        topic: &str,
        partition: u32,
        key: &str,
        payload: &str,
        published_at: DateTime<Utc>,
    ) -> Result<i64, DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO bus_messages (topic, partition_no, message_key, payload, published_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![topic, partition, key, payload, format_db_time(published_at)],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Last committed sequence number for a consumer group's partition (0 if none).
    pub fn committed_bus_offset(
        &self,
        topic: &str,
        group: &str,
        partition: u32,
    ) -> Result<i64, DbError> {
        let conn = self.conn()?;
        let seq = conn
            .query_row(
                "SELECT committed_seq FROM bus_offsets \
                 WHERE topic = ?1 AND consumer_group = ?2 AND partition_no = ?3",
                params![topic, group, partition],
                |row| row.get(0),
            )
            .optional()?;
        Ok(seq.unwrap_or(0))
    }

    /// Register a consumer group on a partition without moving its offset.
    pub fn ensure_bus_offset(&self, topic: &str, group: &str, partition: u32) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO bus_offsets (topic, consumer_group, partition_no, committed_seq) \
             VALUES (?1, ?2, ?3, 0)",
            params![topic, group, partition],
        )?;
        Ok(())
    }

    /// Messages in a partition after the group's committed offset, oldest first.
    pub fn fetch_bus_messages(
        &self,
        topic: &str,
        group: &str,
        partition: u32,
        limit: usize,
    ) -> Result<Vec<BusRecord>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT m.seq, m.topic, m.partition_no, m.message_key, m.payload, m.published_at \
             FROM bus_messages m \
             WHERE m.topic = ?1 AND m.partition_no = ?3 AND m.seq > COALESCE( \
                (SELECT committed_seq FROM bus_offsets o \
                 WHERE o.topic = ?1 AND o.consumer_group = ?2 AND o.partition_no = ?3), 0) \
             ORDER BY m.seq LIMIT ?4",
        )?;

        let rows = stmt
            .query_map(params![topic, group, partition, limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, u32>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        rows.into_iter()
            .map(|(seq, topic, partition, key, payload, published_at)| {
                Ok(BusRecord {
                    seq,
                    topic,
                    partition,
                    key,
                    payload,
                    published_at: parse_db_time(&published_at).ok_or_else(|| {
                        DbError::InvalidRow(format!("bad published_at '{}'", published_at))
                    })?,
                })
            })
            .collect()
    }

    /// Move a group's offset forward. Never moves it backwards.
    pub fn commit_bus_offset(
        &self,
        topic: &str,
        group: &str,
        partition: u32,
        seq: i64,
    ) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO bus_offsets (topic, consumer_group, partition_no, committed_seq) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT (topic, consumer_group, partition_no) \
             DO UPDATE SET committed_seq = MAX(committed_seq, excluded.committed_seq)",
            params![topic, group, partition, seq],
        )?;
        Ok(())
    }

    /// Copy a message to the dead-letter table and commit past it, atomically.
    pub fn park_bus_message(
        &self,
        record: &BusRecord,
        group: &str,
        error: &str,
        deliveries: u32,
    ) -> Result<(), DbError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO bus_dead_letters (message_seq, topic, consumer_group, partition_no, \
             message_key, payload, error, deliveries, parked_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.seq,
                record.topic,
                group,
                record.partition,
                record.key,
                record.payload,
                error,
                deliveries,
                format_db_time(Utc::now()),
            ],
        )?;
        tx.execute(
            "INSERT INTO bus_offsets (topic, consumer_group, partition_no, committed_seq) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT (topic, consumer_group, partition_no) \
             DO UPDATE SET committed_seq = MAX(committed_seq, excluded.committed_seq)",
            params![record.topic, group, record.partition, record.seq],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn list_dead_letters(&self, topic: &str) -> Result<Vec<DeadLetter>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT message_seq, topic, consumer_group, partition_no, error, deliveries \
             FROM bus_dead_letters WHERE topic = ?1 ORDER BY id",
        )?;
        let letters = stmt
            .query_map(params![topic], |row| {
                Ok(DeadLetter {
                    message_seq: row.get(0)?,
                    topic: row.get(1)?,
                    consumer_group: row.get(2)?,
                    partition: row.get(3)?,
                    error: row.get(4)?,
                    deliveries: row.get(5)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(letters)
    }

    /// Delete messages published before `cutoff` that every consumer group on
    /// their partition has committed. Returns the number of rows removed.
    pub fn purge_bus_messages_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM bus_messages WHERE published_at < ?1 AND seq <= ( \
                SELECT MIN(o.committed_seq) FROM bus_offsets o \
                WHERE o.topic = bus_messages.topic AND o.partition_no = bus_messages.partition_no)",
            params![format_db_time(cutoff)],
        )?;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use tempfile::NamedTempFile;

    #[test]
    fn test_fetch_respects_committed_offset() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let now = Utc::now();

        let first = store.append_bus_message("raw", 0, "1", "{\"a\":1}", now).unwrap();
        let second = store.append_bus_message("raw", 0, "1", "{\"a\":2}", now).unwrap();
        store.append_bus_message("raw", 1, "2", "{}", now).unwrap();

        let batch = store.fetch_bus_messages("raw", "listener", 0, 10).unwrap();
        assert_eq!(batch.iter().map(|r| r.seq).collect::<Vec<_>>(), vec![first, second]);

        store.commit_bus_offset("raw", "listener", 0, first).unwrap();
        let batch = store.fetch_bus_messages("raw", "listener", 0, 10).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload, "{\"a\":2}");

        // Commits never rewind, and other groups are unaffected.
        store.commit_bus_offset("raw", "listener", 0, second).unwrap();
        store.commit_bus_offset("raw", "listener", 0, first).unwrap();
        assert_eq!(store.committed_bus_offset("raw", "listener", 0).unwrap(), second);
        assert_eq!(store.fetch_bus_messages("raw", "audit", 0, 10).unwrap().len(), 2);
    }

    #[test]
    fn test_parked_message_is_committed() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        store.append_bus_message("decoded", 2, "9", "poison", Utc::now()).unwrap();

        let record = store.fetch_bus_messages("decoded", "dispatch", 2, 1).unwrap().remove(0);
        store.park_bus_message(&record, "dispatch", "boom", 10).unwrap();

        assert!(store.fetch_bus_messages("decoded", "dispatch", 2, 10).unwrap().is_empty());
        let letters = store.list_dead_letters("decoded").unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].message_seq, record.seq);
        assert_eq!(letters[0].deliveries, 10);
        assert_eq!(letters[0].error, "boom");
    }

    #[test]
    fn test_purge_keeps_uncommitted_messages() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let old = Utc::now() - ChronoDuration::days(10);

        let a = store.append_bus_message("raw", 0, "1", "a", old).unwrap();
        store.append_bus_message("raw", 0, "1", "b", old).unwrap();
        store.ensure_bus_offset("raw", "slow", 0).unwrap();
        store.commit_bus_offset("raw", "fast", 0, a + 1).unwrap();

        // "slow" has not consumed anything yet.
        assert_eq!(store.purge_bus_messages_before(Utc::now()).unwrap(), 0);

        store.commit_bus_offset("raw", "slow", 0, a).unwrap();
        assert_eq!(store.purge_bus_messages_before(Utc::now()).unwrap(), 1);
        assert_eq!(store.fetch_bus_messages("raw", "slow", 0, 10).unwrap().len(), 1);
    }
}
