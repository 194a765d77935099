//! Transfer capabilities: the opaque operation that moves one unit
//!
//! The scheduler only knows [`TransferCapability`]. Two implementations ship
//! with the crate: [`LocalDirTransfer`] mirrors units into a local directory
//! and [`CommandTransfer`] runs an external program such as `rclone`.

use async_trait::async_trait;
use md5::{Digest, Md5};
use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use walkdir::WalkDir;

use crate::error::TransferError;

/// One idempotent copy of a source to a destination id
#[async_trait]
pub trait TransferCapability: Send + Sync {
    /// Copy `source` (a file or a directory) to `dest`
    async fn transfer(&self, source: &Path, dest: &str) -> Result<(), TransferError>;

    /// Whether `dest` is already present
    async fn exists(&self, _dest: &str) -> Result<bool, TransferError> {
        Ok(false)
    }
}

/// Maps local paths under the scan root to destination ids
///
/// `{prefix}/{root_name}/{path relative to root}` with `/` separators.
#[derive(Debug, Clone)]
pub struct Destination {
    prefix: String,
    root: PathBuf,
    root_name: String,
}

impl Destination {
    pub fn new(prefix: impl Into<String>, root: impl Into<PathBuf>, root_name: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
            root: root.into(),
            root_name: root_name.into(),
        }
    }

    pub fn for_path(&self, path: &Path) -> String {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        let mut id = format!("{}/{}", self.prefix, self.root_name);
        for component in relative.components() {
            if let Component::Normal(part) = component {
                id.push('/');
                id.push_str(&part.to_string_lossy());
            }
        }
        id
    }
}

/// Mirrors units into a local directory tree
///
/// Destination ids are used as local paths. Every copy is written to a
/// `.partial` sibling and renamed into place, so a destination path that
/// exists always holds a finished copy. With `verify_checksum` every copied
/// file is re-read on both sides and compared by MD5.
#[derive(Debug, Clone, Default)]
pub struct LocalDirTransfer {
    verify_checksum: bool,
}

impl LocalDirTransfer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_checksum(mut self, enabled: bool) -> Self {
        self.verify_checksum = enabled;
        self
    }

    async fn copy_file(&self, source: &Path, dest: &Path) -> Result<(), TransferError> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let staging = partial_path(dest);
        if let Err(e) = self.write_file(source, &staging).await {
            discard(&staging).await;
            return Err(e);
        }
        tokio::fs::rename(&staging, dest).await?;
        Ok(())
    }

    async fn write_file(&self, source: &Path, dest: &Path) -> Result<(), TransferError> {
        tokio::fs::copy(source, dest).await?;

        if self.verify_checksum {
            let (src, dst) = (source.to_path_buf(), dest.to_path_buf());
            let (a, b) = tokio::task::spawn_blocking(move || -> std::io::Result<(String, String)> {
                Ok((file_md5(&src)?, file_md5(&dst)?))
            })
            .await
            .map_err(|e| TransferError::Cancelled {
                message: e.to_string(),
            })??;
            if a != b {
                return Err(TransferError::failed(format!(
                    "checksum mismatch for {:?}: {} != {}",
                    dest, a, b
                )));
            }
        }
        Ok(())
    }

    async fn copy_dir(&self, source: &Path, dest: &Path) -> Result<(), TransferError> {
        let root = source.to_path_buf();
        let files = tokio::task::spawn_blocking(move || -> Result<Vec<PathBuf>, TransferError> {
            let mut files = Vec::new();
            for entry in WalkDir::new(&root).follow_links(false) {
                let entry = entry.map_err(|e| TransferError::Io {
                    message: e.to_string(),
                })?;
                if entry.file_type().is_file() {
                    files.push(entry.into_path());
                }
            }
            Ok(files)
        })
        .await
        .map_err(|e| TransferError::Cancelled {
            message: e.to_string(),
        })??;

        self.copy_tree(source, &files, dest).await
    }

    /// Copy `files` (all under `source`) into a staging directory, then
    /// swap it in for `dest`
    async fn copy_tree(&self, source: &Path, files: &[PathBuf], dest: &Path) -> Result<(), TransferError> {
        let staging = partial_path(dest);
        discard(&staging).await;
        tokio::fs::create_dir_all(&staging).await?;

        // Sequential awaits so a dropped future stops between files
        for file in files {
            let relative = file.strip_prefix(source).unwrap_or(file);
            let target = staging.join(relative);
            let copied = match target.parent() {
                Some(parent) => match tokio::fs::create_dir_all(parent).await {
                    Ok(()) => self.write_file(file, &target).await,
                    Err(e) => Err(e.into()),
                },
                None => self.write_file(file, &target).await,
            };
            if let Err(e) = copied {
                discard(&staging).await;
                return Err(e);
            }
        }

        if tokio::fs::try_exists(dest).await? {
            tokio::fs::remove_dir_all(dest).await?;
        }
        tokio::fs::rename(&staging, dest).await?;
        Ok(())
    }
}

#[async_trait]
impl TransferCapability for LocalDirTransfer {
    async fn transfer(&self, source: &Path, dest: &str) -> Result<(), TransferError> {
        let dest = Path::new(dest);
        if tokio::fs::metadata(source).await?.is_dir() {
            self.copy_dir(source, dest).await
        } else {
            self.copy_file(source, dest).await
        }
    }

    async fn exists(&self, dest: &str) -> Result<bool, TransferError> {
        Ok(tokio::fs::try_exists(dest).await?)
    }
}

/// `name` -> `name.partial` in the same directory
fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".partial");
    dest.with_file_name(name)
}

/// Best-effort removal of a staging file or directory
async fn discard(path: &Path) {
    let removed = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(_) => return,
    };
    if let Err(e) = removed {
        log::debug!("Could not remove staging path {:?}: {}", path, e);
    }
}

/// Compute the MD5 of a file, streaming in 1MB chunks
pub fn file_md5(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Md5::new();
    let mut buffer = vec![0u8; 1024 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Runs an external program per transfer
///
/// Arguments may contain `{src}` and `{dst}` placeholders. The child is
/// killed when the transfer future is dropped, so a timed-out transfer does
/// not leave the process running.
#[derive(Debug, Clone)]
pub struct CommandTransfer {
    program: String,
    args: Vec<String>,
    exists_program: Option<(String, Vec<String>)>,
}

impl CommandTransfer {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            exists_program: None,
        }
    }

    /// `rclone copyto {src} {dst}`, with `rclone lsf {dst}` as existence check
    pub fn rclone() -> Self {
        Self::new("rclone", vec!["copyto".into(), "{src}".into(), "{dst}".into()])
            .with_exists("rclone", vec!["lsf".into(), "{dst}".into()])
    }

    /// Existence check: exit status 0 with non-empty stdout means present
    pub fn with_exists(mut self, program: impl Into<String>, args: Vec<String>) -> Self {
        self.exists_program = Some((program.into(), args));
        self
    }

    fn render(args: &[String], source: Option<&Path>, dest: &str) -> Vec<String> {
        let src = source.map(|s| s.to_string_lossy().to_string()).unwrap_or_default();
        args.iter()
            .map(|a| a.replace("{src}", &src).replace("{dst}", dest))
            .collect()
    }
}

#[async_trait]
impl TransferCapability for CommandTransfer {
    async fn transfer(&self, source: &Path, dest: &str) -> Result<(), TransferError> {
        let output = Command::new(&self.program)
            .args(Self::render(&self.args, Some(source), dest))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = stderr.lines().last().unwrap_or("").trim();
        Err(TransferError::failed(format!(
            "{} exited with {}: {}",
            self.program, output.status, detail
        )))
    }

    async fn exists(&self, dest: &str) -> Result<bool, TransferError> {
        let Some((program, args)) = &self.exists_program else {
            return Ok(false);
        };
        let output = Command::new(program)
            .args(Self::render(args, None, dest))
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;
        Ok(output.status.success() && !output.stdout.iter().all(u8::is_ascii_whitespace))
    }
}
