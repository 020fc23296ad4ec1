use super::traits::StorageError;
use crate::aggregate::checkpoint::CheckpointStore;
use crate::log::{
    LogEntry, LogError, PartitionedLog, PollResponse, PositionToken, PublishAck, StartPolicy,
};
use async_trait::async_trait;
use chrono::Utc;
use duckdb::Connection;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Check if a process with the given PID is still running
fn is_process_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        std::process::Command::new("ps")
            .arg("-p")
            .arg(pid.to_string())
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

/// Extract the holder PID from a DuckDB "Could not set lock" message.
fn lock_holder_pid(error_msg: &str) -> Option<u32> {
    let start = error_msg.find("(PID ")? + 5;
    let end = error_msg[start..].find(')')?;
    error_msg[start..start + end].parse().ok()
}

fn remove_stale_lock_files(db_path: &Path) -> std::io::Result<()> {
    for suffix in ["wal", "lock"] {
        let stale = PathBuf::from(format!("{}.{}", db_path.display(), suffix));
        if stale.exists() {
            std::fs::remove_file(&stale)?;
            tracing::info!(path = %stale.display(), "Removed stale database file");
        }
    }
    Ok(())
}

/// Name of the `index`-th partition of a stream.
pub fn partition_name(index: u32) -> String {
    format!("partition-{:04}", index)
}

/// Pick the partition for a key: SHA-256 of the key, first 8 bytes, modulo
/// the partition count.
pub fn route_partition(partition_key: &str, partition_count: u32) -> String {
    let digest = Sha256::digest(partition_key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let bucket = u64::from_be_bytes(prefix) % u64::from(partition_count.max(1));
    partition_name(bucket as u32)
}

/// Position tokens issued by this backend read `stream/partition/sequence`.
fn encode_position(stream: &str, partition: &str, sequence: i64) -> PositionToken {
    PositionToken::new(format!("{}/{}/{}", stream, partition, sequence))
}

fn decode_position(token: &PositionToken) -> Result<(String, String, i64), StorageError> {
    let invalid = || StorageError::InvalidPosition(token.to_string());
    let mut parts = token.as_str().rsplitn(3, '/');
    let sequence = parts
        .next()
        .and_then(|s| s.parse::<i64>().ok())
        .filter(|s| *s >= 0)
        .ok_or_else(invalid)?;
    let partition = parts.next().ok_or_else(invalid)?.to_string();
    let stream = parts.next().filter(|s| !s.is_empty()).ok_or_else(invalid)?.to_string();
    Ok((stream, partition, sequence))
}

/// DuckDB-backed partitioned log and checkpoint store.
///
/// A single connection guarded by a mutex serializes every append, so
/// sequence numbers within a partition are dense and strictly increasing.
pub struct DuckDbStorage {
    conn: Arc<Mutex<Connection>>,
}

impl DuckDbStorage {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref();

        match Connection::open(path) {
            Ok(conn) => Ok(Self::from_connection(conn)),
            Err(e) => {
                let error_msg = e.to_string();
                if !error_msg.contains("Could not set lock") {
                    return Err(e.into());
                }

                tracing::warn!(error = %error_msg, "Database lock detected");
                match lock_holder_pid(&error_msg) {
                    Some(pid) if !is_process_running(pid) => {
                        tracing::warn!(pid, "Lock holder is gone, removing stale lock files");
                        remove_stale_lock_files(path)
                            .map_err(|io| StorageError::Database(io.to_string()))?;
                        Ok(Self::from_connection(Connection::open(path)?))
                    }
                    Some(pid) => {
                        tracing::error!(pid, "Database is locked by a running process");
                        Err(e.into())
                    }
                    None => Err(e.into()),
                }
            }
        }
    }

    /// Create an in-memory instance (for testing)
    pub fn in_memory() -> Result<Self, StorageError> {
        Ok(Self::from_connection(Connection::open_in_memory()?))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    pub async fn init_schema(&self) -> Result<(), StorageError> {
        self.with_conn(|conn| {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS log_streams (
                    stream VARCHAR PRIMARY KEY,
                    partition_count INTEGER NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL
                )",
                [],
            )?;

            conn.execute(
                "CREATE TABLE IF NOT EXISTS log_entries (
                    stream VARCHAR NOT NULL,
                    partition_id VARCHAR NOT NULL,
                    sequence BIGINT NOT NULL,
                    partition_key VARCHAR NOT NULL,
                    data BLOB NOT NULL,
                    appended_at TIMESTAMPTZ NOT NULL,
                    PRIMARY KEY (stream, partition_id, sequence)
                )",
                [],
            )?;

            conn.execute(
                "CREATE TABLE IF NOT EXISTS checkpoints (
                    job_id VARCHAR PRIMARY KEY,
                    checkpoint_data TEXT NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL
                )",
                [],
            )?;

            Ok(())
        })
        .await
    }

    /// Declare a stream with a fixed partition count. Re-declaring an existing
    /// stream keeps its original partition count.
    pub async fn create_stream(&self, stream: &str, partitions: u32) -> Result<(), StorageError> {
        let stream = stream.to_string();
        self.with_conn(move |conn| {
            let existing = stream_partition_count(conn, &stream)?;
            match existing {
                Some(count) if count != partitions => {
                    tracing::warn!(
                        stream = %stream,
                        declared = partitions,
                        existing = count,
                        "Stream already exists with a different partition count, keeping existing"
                    );
                }
                Some(_) => {}
                None => {
                    conn.execute(
                        "INSERT INTO log_streams (stream, partition_count, created_at)
                         VALUES (?, ?, to_timestamp(? / 1000000.0))",
                        duckdb::params![stream, partitions, Utc::now().timestamp_micros()],
                    )?;
                    tracing::info!(stream = %stream, partitions, "Created stream");
                }
            }
            Ok(())
        })
        .await
    }

    /// Number of entries stored in one partition.
    pub async fn partition_len(&self, stream: &str, partition: &str) -> Result<u64, StorageError> {
        let stream = stream.to_string();
        let partition = partition.to_string();
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM log_entries WHERE stream = ? AND partition_id = ?",
                duckdb::params![stream, partition],
                |row| row.get(0),
            )?;
            Ok(count.max(0) as u64)
        })
        .await
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StorageError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = lock(&conn)?;
            f(&guard)
        })
        .await
        .map_err(|e| StorageError::Database(format!("Task join error: {}", e)))?
    }
}

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>, StorageError> {
    conn.lock()
        .map_err(|_| StorageError::Database("connection lock poisoned".to_string()))
}

fn stream_partition_count(conn: &Connection, stream: &str) -> Result<Option<u32>, StorageError> {
    let mut stmt = conn.prepare("SELECT partition_count FROM log_streams WHERE stream = ?")?;
    let mut rows = stmt.query(duckdb::params![stream])?;
    match rows.next()? {
        Some(row) => Ok(Some(row.get::<_, u32>(0)?)),
        None => Ok(None),
    }
}

fn require_partition(conn: &Connection, stream: &str, partition: &str) -> Result<(), StorageError> {
    let count = stream_partition_count(conn, stream)?
        .ok_or_else(|| StorageError::StreamNotFound(stream.to_string()))?;
    if (0..count).any(|i| partition_name(i) == partition) {
        Ok(())
    } else {
        Err(StorageError::PartitionNotFound {
            stream: stream.to_string(),
            partition: partition.to_string(),
        })
    }
}

#[async_trait]
impl PartitionedLog for DuckDbStorage {
    async fn describe_partitions(&self, stream: &str) -> Result<Vec<String>, LogError> {
        let stream = stream.to_string();
        let partitions = self
            .with_conn(move |conn| {
                let count = stream_partition_count(conn, &stream)?
                    .ok_or(StorageError::StreamNotFound(stream))?;
                Ok((0..count).map(partition_name).collect())
            })
            .await?;
        Ok(partitions)
    }

    async fn get_position(
        &self,
        stream: &str,
        partition: &str,
        start: StartPolicy,
    ) -> Result<PositionToken, LogError> {
        let stream = stream.to_string();
        let partition = partition.to_string();
        let token = self
            .with_conn(move |conn| {
                require_partition(conn, &stream, &partition)?;
                let sql = match start {
                    StartPolicy::Earliest => {
                        "SELECT COALESCE(MIN(sequence), 0) FROM log_entries
                         WHERE stream = ? AND partition_id = ?"
                    }
                    StartPolicy::Latest => {
                        "SELECT COALESCE(MAX(sequence) + 1, 0) FROM log_entries
                         WHERE stream = ? AND partition_id = ?"
                    }
                };
                let sequence: i64 =
                    conn.query_row(sql, duckdb::params![stream, partition], |row| row.get(0))?;
                Ok(encode_position(&stream, &partition, sequence))
            })
            .await?;
        Ok(token)
    }

    async fn poll(&self, position: &PositionToken, limit: usize) -> Result<PollResponse, LogError> {
        let (stream, partition, sequence) = decode_position(position)?;
        let response = self
            .with_conn(move |conn| {
                require_partition(conn, &stream, &partition)?;
                let mut stmt = conn.prepare(
                    "SELECT sequence, partition_key, data FROM log_entries
                     WHERE stream = ? AND partition_id = ? AND sequence >= ?
                     ORDER BY sequence
                     LIMIT ?",
                )?;
                let rows = stmt.query_map(
                    duckdb::params![stream, partition, sequence, limit as i64],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, Vec<u8>>(2)?,
                        ))
                    },
                )?;

                let mut entries = Vec::new();
                for row in rows {
                    let (seq, partition_key, data) = row?;
                    entries.push(LogEntry {
                        partition: partition.clone(),
                        sequence: seq as u64,
                        partition_key,
                        data,
                    });
                }

                let next_sequence = entries
                    .last()
                    .map(|e| e.sequence as i64 + 1)
                    .unwrap_or(sequence);
                Ok(PollResponse {
                    entries,
                    next: encode_position(&stream, &partition, next_sequence),
                })
            })
            .await?;
        Ok(response)
    }

    async fn publish(
        &self,
        stream: &str,
        data: &[u8],
        partition_key: &str,
    ) -> Result<PublishAck, LogError> {
        let stream = stream.to_string();
        let data = data.to_vec();
        let partition_key = partition_key.to_string();
        let ack = self
            .with_conn(move |conn| {
                let count = stream_partition_count(conn, &stream)?
                    .ok_or_else(|| StorageError::StreamNotFound(stream.clone()))?;
                let partition = route_partition(&partition_key, count);

                let sequence: i64 = conn.query_row(
                    "SELECT COALESCE(MAX(sequence) + 1, 0) FROM log_entries
                     WHERE stream = ? AND partition_id = ?",
                    duckdb::params![stream, partition],
                    |row| row.get(0),
                )?;

                conn.execute(
                    "INSERT INTO log_entries (stream, partition_id, sequence, partition_key, data, appended_at)
                     VALUES (?, ?, ?, ?, ?, to_timestamp(? / 1000000.0))",
                    duckdb::params![
                        stream,
                        partition,
                        sequence,
                        partition_key,
                        data,
                        Utc::now().timestamp_micros(),
                    ],
                )?;

                Ok(PublishAck {
                    partition,
                    sequence: sequence as u64,
                })
            })
            .await?;
        Ok(ack)
    }
}

#[async_trait]
impl CheckpointStore for DuckDbStorage {
    async fn load_checkpoint(&self, job_id: &str) -> Result<Option<String>, StorageError> {
        let job_id = job_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare("SELECT checkpoint_data FROM checkpoints WHERE job_id = ?")?;
            let mut rows = stmt.query(duckdb::params![job_id])?;
            match rows.next()? {
                Some(row) => Ok(Some(row.get::<_, String>(0)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn save_checkpoint(&self, job_id: &str, data: &str) -> Result<(), StorageError> {
        let job_id = job_id.to_string();
        let data = data.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO checkpoints (job_id, checkpoint_data, created_at)
                 VALUES (?, ?, to_timestamp(? / 1000000.0))",
                duckdb::params![job_id, data, Utc::now().timestamp_micros()],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete_checkpoint(&self, job_id: &str) -> Result<(), StorageError> {
        let job_id = job_id.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM checkpoints WHERE job_id = ?", duckdb::params![job_id])?;
            Ok(())
        })
        .await
    }
}
