use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

const WORKSPACE_PREFIX: &str = "ytmux-";

/// Per-request scratch directory. Everything a download writes to disk lives
/// inside it, and the whole directory is removed when the guard is dropped.
#[derive(Debug)]
pub struct Workspace {
    dir: PathBuf,
}

impl Workspace {
    pub async fn create(base: &Path) -> io::Result<Self> {
        let dir = base.join(format!("{WORKSPACE_PREFIX}{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await?;
        debug!("Created workspace {}", dir.display());
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        cleanup_folder(&self.dir);
    }
}

/// Remove a folder and all its contents. Failures are logged, never raised.
pub fn cleanup_folder(path: &Path) {
    if !path.exists() {
        return;
    }
    match std::fs::remove_dir_all(path) {
        Ok(_) => debug!("Cleaned up folder: {}", path.display()),
        Err(e) => error!("Error cleaning up folder {}: {e}", path.display()),
    }
}

/// Remove workspaces at least `max_age` old. Returns the number removed.
pub fn cleanup_old_folders(base: &Path, max_age: Duration) -> usize {
    if !base.exists() {
        return 0;
    }

    let entries = match std::fs::read_dir(base) {
        Ok(e) => e,
        Err(e) => {
            error!("Error scanning directory {}: {e}", base.display());
            return 0;
        }
    };

    let now = SystemTime::now();
    let mut removed = 0usize;

    for entry in entries.flatten() {
        let path = entry.path();
        let ours = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(WORKSPACE_PREFIX));
        if !ours || !path.is_dir() {
            continue;
        }

        let modified = match entry.metadata().and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(_) => continue,
        };
        let age = now.duration_since(modified).unwrap_or_default();

        if age >= max_age {
            match std::fs::remove_dir_all(&path) {
                Ok(_) => {
                    removed += 1;
                    info!("Removed stale workspace: {} (age: {}s)", path.display(), age.as_secs());
                }
                Err(e) => error!("Error removing folder {}: {e}", path.display()),
            }
        }
    }

    removed
}

/// Sweep leftovers (e.g. from a crash) every 15 minutes until `shutdown`.
pub fn spawn_cleanup_task(temp_dir: PathBuf, max_age: Duration, shutdown: CancellationToken) {
    tokio::spawn(async move {
        info!("Initializing cleanup schedule for: {}", temp_dir.display());
        let mut interval = tokio::time::interval(Duration::from_secs(15 * 60));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            let dir = temp_dir.clone();
            let removed = tokio::task::spawn_blocking(move || cleanup_old_folders(&dir, max_age))
                .await
                .unwrap_or(0);

            if removed > 0 {
                info!("Scheduled cleanup: removed {removed} stale workspaces");
            }
        }
    });
}
