use std::path::Path;
use tracing::info;

use super::templates::{FileSet, VCL_SUFFIX};
use crate::util::errors::StdError;

/// What has to happen to one file of the VCL directory
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FileAction {
    /// Present on disk only
    Delete(String),
    /// Present in both with different contents
    Rewrite(String),
    /// Desired only
    Write(String),
}

pub fn plan_file_sync(current: &FileSet, desired: &FileSet) -> Vec<FileAction> {
    let mut names: Vec<&String> = current.keys().chain(desired.keys()).collect();
    names.sort();
    names.dedup();

    names
        .into_iter()
        .filter_map(|name| match (current.get(name), desired.get(name)) {
            (Some(_), None) => Some(FileAction::Delete(name.clone())),
            (Some(old), Some(new)) if old != new => Some(FileAction::Rewrite(name.clone())),
            (None, Some(_)) => Some(FileAction::Write(name.clone())),
            _ => None,
        })
        .collect()
}

/// Every `*.vcl` file in `dir`
pub async fn read_current_files(dir: &Path) -> Result<FileSet, StdError> {
    let io_err = |context: &'static str, path: &Path| {
        let path = path.to_path_buf();
        move |source: std::io::Error| StdError::IoError { context, path, source }
    };

    let mut entries = tokio::fs::read_dir(dir).await.map_err(io_err("incorrect dir", dir))?;
    let mut files = FileSet::new();
    while let Some(entry) = entries.next_entry().await.map_err(io_err("incorrect dir", dir))? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.ends_with(VCL_SUFFIX) {
            continue;
        }
        let path = entry.path();
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(io_err("problem reading file", &path))?;
        files.insert(name, contents);
    }
    Ok(files)
}

/// Makes `dir` hold exactly `desired`, returning whether anything changed.
///
/// The first failing operation aborts the sync. Operations done before it stay done
/// and the next pass converges the rest.
pub async fn sync_files(dir: &Path, current: &FileSet, desired: &FileSet) -> Result<bool, StdError> {
    let actions = plan_file_sync(current, desired);
    for action in &actions {
        match action {
            FileAction::Delete(name) => {
                let path = dir.join(name);
                info!(path = %path.display(), "Removing file");
                tokio::fs::remove_file(&path)
                    .await
                    .map_err(|source| StdError::IoError {
                        context: "could not delete file",
                        path,
                        source,
                    })?;
            }
            FileAction::Rewrite(name) | FileAction::Write(name) => {
                let path = dir.join(name);
                let contents = desired.get(name).map(String::as_str).unwrap_or_default();
                tokio::fs::write(&path, contents)
                    .await
                    .map_err(|source| StdError::IoError {
                        context: "could not write file",
                        path: path.clone(),
                        source,
                    })?;
                if matches!(action, FileAction::Rewrite(_)) {
                    info!(path = %path.display(), "Rewriting file");
                } else {
                    info!(path = %path.display(), "Writing new file");
                }
            }
        }
    }
    Ok(!actions.is_empty())
}
