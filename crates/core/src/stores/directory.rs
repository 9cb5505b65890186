use crate::error::IndexError;
use crate::index::{IndexEntry, IndexMetadata, VectorIndex};
use crate::traits::IndexBackend;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

const METADATA_FILE: &str = "metadata.json";
const ENTRIES_FILE: &str = "entries.json";

/// Stores an index as two JSON files inside its own directory.
///
/// Writes go to a sibling staging directory which is renamed over the
/// target once complete.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectoryBackend;

impl DirectoryBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl IndexBackend for DirectoryBackend {
    async fn exists(&self, location: &Path) -> Result<bool, IndexError> {
        match fs::metadata(location.join(METADATA_FILE)).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(false),
            Err(error) => Err(IndexError::io(location, error)),
        }
    }

    async fn read(&self, location: &Path) -> Result<VectorIndex, IndexError> {
        let metadata_bytes = match fs::read(location.join(METADATA_FILE)).await {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                return Err(IndexError::NotFound {
                    location: location.to_path_buf(),
                })
            }
            Err(error) => return Err(IndexError::io(location, error)),
        };
        let metadata: IndexMetadata = serde_json::from_slice(&metadata_bytes)
            .map_err(|error| IndexError::corrupt(location, format!("{METADATA_FILE}: {error}")))?;

        let entries_bytes = match fs::read(location.join(ENTRIES_FILE)).await {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                return Err(IndexError::corrupt(
                    location,
                    format!("{ENTRIES_FILE} is missing"),
                ))
            }
            Err(error) => return Err(IndexError::io(location, error)),
        };
        let entries: Vec<IndexEntry> = serde_json::from_slice(&entries_bytes)
            .map_err(|error| IndexError::corrupt(location, format!("{ENTRIES_FILE}: {error}")))?;

        Ok(VectorIndex::from_parts(location.to_path_buf(), metadata, entries))
    }

    async fn write(&self, index: &VectorIndex) -> Result<(), IndexError> {
        let location = index.location();
        let parent = match location.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let name = location
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "index".to_string());

        let metadata = serde_json::to_vec_pretty(index.metadata())?;
        let entries = serde_json::to_vec(index.entries())?;
        let staging = parent.join(format!(".{name}.staging-{}", Uuid::new_v4()));
        let previous = parent.join(format!(".{name}.previous-{}", Uuid::new_v4()));
        let target = location.to_path_buf();

        // Once spawned, the blocking task finishes even if this future is
        // dropped, so a cancelled write never leaves the location empty.
        tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&parent).map_err(|error| IndexError::io(&parent, error))?;
            let staging = StagingDir::create(staging)?;
            write_file(&staging.path().join(METADATA_FILE), &metadata)?;
            write_file(&staging.path().join(ENTRIES_FILE), &entries)?;
            swap_into_place(staging, &target, &previous)
        })
        .await
        .map_err(|error| IndexError::io(location, std::io::Error::other(error.to_string())))??;

        debug!(location = %location.display(), entries = index.len(), "index persisted");
        Ok(())
    }
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<(), IndexError> {
    std::fs::write(path, bytes).map_err(|error| IndexError::io(path, error))
}

/// Moves the current index aside, renames `staging` over `location` and
/// drops the old copy. Restores the old copy if the second rename fails.
fn swap_into_place(staging: StagingDir, location: &Path, previous: &Path) -> Result<(), IndexError> {
    let had_previous = match std::fs::rename(location, previous) {
        Ok(()) => true,
        Err(error) if error.kind() == ErrorKind::NotFound => false,
        Err(error) => return Err(IndexError::io(location, error)),
    };

    if let Err(error) = std::fs::rename(staging.path(), location) {
        if had_previous {
            if let Err(restore_error) = std::fs::rename(previous, location) {
                warn!(
                    location = %location.display(),
                    error = %restore_error,
                    "failed to restore previous index"
                );
            }
        }
        return Err(IndexError::io(location, error));
    }
    staging.disarm();

    if had_previous {
        if let Err(error) = std::fs::remove_dir_all(previous) {
            warn!(path = %previous.display(), %error, "failed to remove replaced index");
        }
    }
    Ok(())
}

/// Removes the staging directory on drop unless it was moved into place.
struct StagingDir {
    path: PathBuf,
    armed: bool,
}

impl StagingDir {
    fn create(path: PathBuf) -> Result<Self, IndexError> {
        std::fs::create_dir(&path).map_err(|error| IndexError::io(&path, error))?;
        Ok(Self { path, armed: true })
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }
}
