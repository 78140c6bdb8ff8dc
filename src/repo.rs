//! Repository discovery and on-demand creation.

use std::fs;
use std::path::Path;

use tokio::process::Command;

use crate::error::Error;
use crate::git::Service;
use crate::process;

/// Entries a directory must contain (case-insensitively) to count as a
/// git repository. Covers bare repositories and the `.git` directory of a
/// worktree alike; the directory name itself is irrelevant.
const SIGNATURE: &[&str] = &["config", "head", "info", "objects", "refs"];

/// Whether `dir` looks like a git repository. Missing or unreadable
/// directories are treated as empty.
pub fn is_repository(dir: &Path) -> bool {
    let Ok(entries) = fs::read_dir(dir) else {
        return false;
    };
    let names = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().to_lowercase())
        .collect::<Vec<_>>();

    SIGNATURE.iter().all(|name| names.iter().any(|n| n == name))
}

/// Check that `repo` is a repository, materializing it when a push targets
/// a path that does not hold one yet. Returns whether the repository was
/// created on demand.
///
/// Creation refuses to nest a new repository inside an existing one and
/// refuses to step across non-directories; both are a path-safety
/// violation, not a missing repository.
pub async fn probe(
    root: &Path,
    repo: &Path,
    service: Service,
    auto_create: bool,
) -> Result<bool, Error> {
    if is_repository(repo) {
        return Ok(false);
    }
    if !auto_create || service != Service::ReceivePack {
        return Err(Error::NotFound);
    }

    let rel = repo.strip_prefix(root).map_err(|_| Error::Forbidden)?;
    let mut cursor = root.to_path_buf();
    for segment in rel.components() {
        cursor.push(segment);
        if !cursor.exists() {
            break;
        }
        if !cursor.is_dir() || is_repository(&cursor) {
            return Err(Error::Forbidden);
        }
    }
    fs::create_dir_all(repo).map_err(|_| Error::NotFound)?;

    let mut cmd = Command::new("git");
    cmd.args(["init", "--quiet", "--bare"]).arg(repo);

    let exit = process::call(cmd).await.map_err(|_| Error::ExecutionFailed)?;
    if !exit.success() {
        tracing::error!("git init {}: {}", repo.display(), exit.stderr_lossy().trim_end());
        return Err(Error::ExecutionFailed);
    }
    tracing::info!("created bare repository {}", repo.display());

    Ok(true)
}
