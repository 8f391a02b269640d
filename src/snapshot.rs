//! Local CSV snapshot of a query's full result set. A snapshot that exists is trusted as is,
//! deleting the file is the only way to invalidate it.

use std::{
    io,
    path::{Path, PathBuf},
};

use anyhow::Context;
use serde::{de::DeserializeOwned, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    flipside::QueryClient,
    metawin::decode_records,
    pagination::{self, PaginationOptions},
    performance::TimedExt,
};

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("failed to read snapshot {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("failed to serialize snapshot {path}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("failed to write snapshot {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A row type that can be stored in a snapshot. `COLUMNS` must list the serialized field names
/// in order, it becomes the header of snapshots without rows.
pub trait SnapshotRow: Serialize + DeserializeOwned {
    const COLUMNS: &'static [&'static str];
}

pub fn snapshot_exists(path: &Path) -> Result<bool, SnapshotError> {
    path.try_exists().map_err(|source| SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    })
}

pub fn read_snapshot<Row>(path: &Path) -> Result<Vec<Row>, SnapshotError>
where
    Row: SnapshotRow,
{
    let read_error = |source: csv::Error| SnapshotError::Read {
        path: path.to_path_buf(),
        source,
    };

    csv::Reader::from_path(path)
        .map_err(read_error)?
        .deserialize::<Row>()
        .collect::<Result<Vec<_>, _>>()
        .map_err(read_error)
}

/// Writes to a temporary file next to `path` and renames it into place, readers never see a
/// partially written snapshot. The header is always written, also without rows.
pub fn write_snapshot<Row>(path: &Path, rows: &[Row]) -> Result<(), SnapshotError>
where
    Row: SnapshotRow,
{
    let io_error = |source: io::Error| SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    };
    let serialize_error = |source: csv::Error| SnapshotError::Serialize {
        path: path.to_path_buf(),
        source,
    };

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut temp_file = NamedTempFile::new_in(dir).map_err(io_error)?;

    {
        let mut writer = csv::Writer::from_writer(temp_file.as_file_mut());
        if rows.is_empty() {
            writer.write_record(Row::COLUMNS).map_err(serialize_error)?;
        }
        for row in rows {
            writer.serialize(row).map_err(serialize_error)?;
        }
        writer.flush().map_err(io_error)?;
    }

    temp_file.as_file().sync_all().map_err(io_error)?;
    temp_file.persist(path).map_err(|err| io_error(err.error))?;

    Ok(())
}

/// Removes the snapshot. Returns whether there was one to remove.
pub fn delete_snapshot(path: &Path) -> Result<bool, SnapshotError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(source) => Err(SnapshotError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Returns the snapshot at `cache_path` when there is one. Otherwise runs `sql`, pages through
/// the full result, stores it at `cache_path` and returns it.
pub async fn load_dataset<C, Row>(
    client: &C,
    cache_path: &Path,
    sql: &str,
    options: &PaginationOptions,
) -> anyhow::Result<Vec<Row>>
where
    C: QueryClient + ?Sized,
    Row: SnapshotRow,
{
    if snapshot_exists(cache_path)? {
        let rows = read_snapshot(cache_path)?;
        info!(path = %cache_path.display(), rows = rows.len(), "loaded dataset from snapshot");
        return Ok(rows);
    }

    info!(path = %cache_path.display(), "no snapshot found, querying");

    let handle = client
        .query(sql)
        .timed("run query")
        .await
        .context("failed to run dataset query")?;

    debug!(
        query_id = handle.query_id,
        total_row_count = handle.total_row_count,
        "query finished"
    );

    let records = pagination::fetch_all(client, &handle, options)
        .timed("fetch all result pages")
        .await?;
    let rows = decode_records::<Row>(records).context("failed to decode query rows")?;

    write_snapshot(cache_path, &rows)?;
    info!(path = %cache_path.display(), rows = rows.len(), "wrote dataset snapshot");

    Ok(rows)
}
