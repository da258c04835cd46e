//! Tar-archive-based file exchange across the host/guest boundary.

use crate::container_runtime::ContainerRuntime;
use crate::path_policy::to_user_path;
use crate::{Error, Result};
use std::io::Read;
use tar::{Builder, Header};
use tracing::instrument;

/// One entry returned by [`list_files`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct FileEntry {
    /// File or directory name (no path components).
    pub name: String,
    /// Whether the entry is a directory.
    pub is_dir: bool,
    /// User-relative path (never carries the sandbox root prefix).
    pub path: String,
}

/// List the contents of a guest directory via `ls -F`, parsing the
/// trailing `/` marker `ls -F` appends to directory names.
#[instrument(skip(runtime))]
pub async fn list_files(
    runtime: &ContainerRuntime,
    container_id: &str,
    absolute_path: &str,
) -> Result<Vec<FileEntry>> {
    let argv = vec!["ls".to_string(), "-F".to_string(), absolute_path.to_string()];
    let (output, exit_code) = runtime.exec(container_id, &argv).await?;
    if exit_code != 0 {
        return Err(Error::ListFilesFailed(format!(
            "ls exited with status {exit_code}: {output}"
        )));
    }

    let user_base = to_user_path(absolute_path);
    let mut entries = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let is_dir = line.ends_with('/');
        let name = if is_dir {
            line.trim_end_matches('/').to_string()
        } else {
            line.to_string()
        };
        let path = if user_base == "." {
            name.clone()
        } else {
            format!("{user_base}/{name}")
        };
        entries.push(FileEntry { name, is_dir, path });
    }
    Ok(entries)
}

/// Download a single file from the guest and decode it as UTF-8 (invalid
/// sequences are replaced, matching the Python/R originals' `errors="replace"`
/// behavior), rejecting anything over `max_bytes`.
#[instrument(skip(runtime))]
pub async fn read_file(
    runtime: &ContainerRuntime,
    container_id: &str,
    absolute_path: &str,
    max_bytes: usize,
) -> Result<String> {
    let archive = runtime
        .download_archive(container_id, absolute_path)
        .await?;

    let mut tar = tar::Archive::new(archive.as_slice());
    let mut entries = tar
        .entries()
        .map_err(|e| Error::ReadFileFailed(format!("malformed archive for {absolute_path}: {e}")))?;
    let mut entry = entries
        .next()
        .ok_or_else(|| Error::ReadFileFailed(format!("empty archive for {absolute_path}")))?
        .map_err(|e| Error::ReadFileFailed(format!("failed to read archive entry: {e}")))?;

    let size = entry
        .header()
        .size()
        .map_err(|e| Error::ReadFileFailed(format!("failed to read entry size: {e}")))? as usize;
    if size > max_bytes {
        return Err(Error::FileTooLarge {
            len: size,
            max: max_bytes,
        });
    }

    let mut bytes = Vec::with_capacity(size);
    entry
        .read_to_end(&mut bytes)
        .map_err(|e| Error::ReadFileFailed(format!("failed to read file contents: {e}")))?;

    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Ensure the parent directory exists, then upload `content` as a
/// single-entry tar archive at that directory.
#[instrument(skip(runtime, content))]
pub async fn write_file(
    runtime: &ContainerRuntime,
    container_id: &str,
    absolute_path: &str,
    content: &str,
    max_bytes: usize,
) -> Result<()> {
    let bytes = content.as_bytes();
    if bytes.len() > max_bytes {
        return Err(Error::FileTooLarge {
            len: bytes.len(),
            max: max_bytes,
        });
    }

    let (dest_dir, file_name) = split_parent(absolute_path);
    if dest_dir != "/" {
        let mkdir = vec!["mkdir".to_string(), "-p".to_string(), dest_dir.to_string()];
        let (output, exit_code) = runtime.exec(container_id, &mkdir).await?;
        if exit_code != 0 {
            return Err(Error::WriteFileFailed(format!(
                "mkdir -p {dest_dir} exited with status {exit_code}: {output}"
            )));
        }
    }

    let tar_bytes = build_single_file_tar(&file_name, bytes)?;
    runtime.upload_archive(container_id, &dest_dir, tar_bytes).await
}

fn split_parent(absolute_path: &str) -> (String, String) {
    match absolute_path.rsplit_once('/') {
        Some(("", name)) => ("/".to_string(), name.to_string()),
        Some((dir, name)) => (dir.to_string(), name.to_string()),
        None => ("/".to_string(), absolute_path.to_string()),
    }
}

fn build_single_file_tar(name: &str, bytes: &[u8]) -> Result<Vec<u8>> {
    let mut tar_data = Vec::new();
    {
        let mut builder = Builder::new(&mut tar_data);
        let mut header = Header::new_gnu();
        header
            .set_path(name)
            .map_err(|e| Error::WriteFileFailed(format!("invalid archive member name: {e}")))?;
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        );
        header.set_cksum();
        builder
            .append(&header, bytes)
            .map_err(|e| Error::WriteFileFailed(format!("failed to append tar entry: {e}")))?;
        builder
            .finish()
            .map_err(|e| Error::WriteFileFailed(format!("failed to finalize tar archive: {e}")))?;
    }
    Ok(tar_data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_parent_directory() {
        assert_eq!(
            split_parent("/sandbox/data/x.txt"),
            ("/sandbox/data".to_string(), "x.txt".to_string())
        );
        assert_eq!(
            split_parent("/sandbox/x.txt"),
            ("/sandbox".to_string(), "x.txt".to_string())
        );
    }

    #[test]
    fn builds_a_valid_single_entry_tar() {
        let tar_bytes = build_single_file_tar("x.txt", b"hello").unwrap();
        let mut archive = tar::Archive::new(tar_bytes.as_slice());
        let mut entries = archive.entries().unwrap();
        let mut entry = entries.next().unwrap().unwrap();
        assert_eq!(entry.header().size().unwrap(), 5);
        let mut buf = Vec::new();
        entry.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"hello");
    }

    #[test]
    fn parses_ls_dash_f_output() {
        let output = "data/\nx.txt\n";
        let mut entries = Vec::new();
        for line in output.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let is_dir = line.ends_with('/');
            let name = if is_dir {
                line.trim_end_matches('/').to_string()
            } else {
                line.to_string()
            };
            entries.push((name, is_dir));
        }
        assert_eq!(entries, vec![("data".to_string(), true), ("x.txt".to_string(), false)]);
    }
}
