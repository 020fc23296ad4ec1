use super::{Sink, SinkError};
use crate::record::WindowAggregate;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Writes each batch as newline-delimited JSON files under
/// `<root>/<column>=<value>/part-<uuid>.json`.
///
/// Files are written to a hidden temporary name, synced and renamed into
/// place, so a partially written part file is never visible.
#[derive(Debug, Clone)]
pub struct FileSink {
    root: PathBuf,
}

impl FileSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Every aggregate currently stored, in no particular order.
    pub async fn read_all(&self) -> Result<Vec<WindowAggregate>, SinkError> {
        let mut aggregates = Vec::new();
        if !tokio::fs::try_exists(&self.root).await? {
            return Ok(aggregates);
        }

        let mut partitions = tokio::fs::read_dir(&self.root).await?;
        while let Some(partition) = partitions.next_entry().await? {
            if !partition.file_type().await?.is_dir() {
                continue;
            }
            let mut files = tokio::fs::read_dir(partition.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let name = file.file_name();
                let name = name.to_string_lossy();
                if !name.starts_with("part-") || !name.ends_with(".json") {
                    continue;
                }
                let content = tokio::fs::read_to_string(file.path()).await?;
                for line in content.lines().filter(|l| !l.trim().is_empty()) {
                    aggregates.push(serde_json::from_str(line)?);
                }
            }
        }
        Ok(aggregates)
    }

    async fn write_part(&self, dir: &Path, rows: &[&WindowAggregate]) -> Result<PathBuf, SinkError> {
        tokio::fs::create_dir_all(dir).await?;

        let mut body = Vec::new();
        for row in rows {
            serde_json::to_writer(&mut body, row)?;
            body.push(b'\n');
        }

        let id = Uuid::new_v4();
        let tmp_path = dir.join(format!(".part-{}.json.tmp", id));
        let final_path = dir.join(format!("part-{}.json", id));

        publish(&tmp_path, &final_path, &body).await?;
        Ok(final_path)
    }
}

/// Write `body` to `tmp_path` and rename it to `final_path`. On failure the
/// temporary file is removed so retries do not leave debris behind.
async fn publish(tmp_path: &Path, final_path: &Path, body: &[u8]) -> std::io::Result<()> {
    let result = async {
        let mut file = tokio::fs::File::create(tmp_path).await?;
        file.write_all(body).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(tmp_path, final_path).await
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(tmp_path).await;
    }
    result
}

#[async_trait]
impl Sink for FileSink {
    async fn append_batch(
        &self,
        batch: &[WindowAggregate],
        partition_column: &str,
    ) -> Result<(), SinkError> {
        let mut groups: BTreeMap<String, Vec<&WindowAggregate>> = BTreeMap::new();
        for aggregate in batch {
            let value = aggregate
                .partition_value(partition_column)
                .ok_or_else(|| SinkError::UnknownPartitionColumn(partition_column.to_string()))?;
            groups.entry(value).or_default().push(aggregate);
        }

        for (value, rows) in groups {
            let dir = self.root.join(format!("{}={}", partition_column, value));
            let path = self.write_part(&dir, &rows).await?;
            tracing::info!(
                path = %path.display(),
                windows = rows.len(),
                "Wrote aggregate partition file"
            );
        }
        Ok(())
    }
}
