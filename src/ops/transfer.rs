// Copyright 2025 The fabr contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! File transfer over SFTP: the `put` and `get` primitives.
//!
//! Local `put` paths may be globs; remote `get` paths with wildcards are
//! expanded by listing on the remote side. `use_sudo` stages files through
//! a world-readable temp path because the SFTP subsystem runs as the login
//! user.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::OpenFlags;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::errors::Error;
use crate::executor::result::TransferOutcome;
use crate::output::Stream;
use crate::utils::interrupt;

use super::command::{RunOptions, SudoOptions};
use super::TaskContext;

/// Options for `put`.
#[derive(Debug, Clone)]
pub struct PutOptions {
    /// Stage through `temp_dir` and `sudo mv` into place.
    pub use_sudo: bool,
    /// Copy the local file's permission bits to the remote side.
    pub mirror_local_mode: bool,
    /// Explicit permission bits for the remote file.
    pub mode: Option<u32>,
    /// Expand glob patterns in the local path.
    pub use_glob: bool,
    /// Staging directory for `use_sudo`; empty means `/tmp`.
    pub temp_dir: String,
}

impl Default for PutOptions {
    fn default() -> Self {
        Self {
            use_sudo: false,
            mirror_local_mode: false,
            mode: None,
            use_glob: true,
            temp_dir: String::new(),
        }
    }
}

/// Options for `get`.
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Stage through `temp_dir` with `sudo cp` for unreadable files.
    pub use_sudo: bool,
    /// Staging directory for `use_sudo`; empty means `/tmp`.
    pub temp_dir: String,
}

fn has_wildcards(path: &str) -> bool {
    path.contains(['*', '?', '['])
}

/// Turn `~`-relative remote paths into home-relative SFTP paths.
fn resolve_remote(path: &str) -> String {
    if path == "~" {
        ".".to_string()
    } else if let Some(rest) = path.strip_prefix("~/") {
        rest.to_string()
    } else {
        path.to_string()
    }
}

fn remote_join(dir: &str, name: &str) -> String {
    if dir.is_empty() || dir == "." {
        name.to_string()
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), name)
    }
}

/// Create every missing directory leading up to `path`'s parent; existing
/// ones fail silently.
async fn ensure_remote_dirs(sftp: &SftpSession, path: &str) {
    let Some((parent, _)) = path.rsplit_once('/') else {
        return;
    };
    let mut prefix = String::new();
    for part in parent.split('/') {
        if part.is_empty() {
            prefix.push('/');
            continue;
        }
        if !prefix.is_empty() && !prefix.ends_with('/') {
            prefix.push('/');
        }
        prefix.push_str(part);
        let _ = sftp.create_dir(&prefix).await;
    }
}

impl TaskContext {
    /// Upload one or more local files to the current host.
    pub async fn put(
        &mut self,
        local_path: &str,
        remote_path: &str,
        opts: PutOptions,
    ) -> anyhow::Result<TransferOutcome> {
        if interrupt::stop_requested() {
            return Err(Error::Interrupted.into());
        }

        let sources: Vec<PathBuf> = if opts.use_glob && has_wildcards(local_path) {
            let mut matched = Vec::new();
            for entry in glob::glob(local_path)
                .with_context(|| format!("bad glob pattern {local_path:?}"))?
            {
                matched.push(entry.with_context(|| format!("expanding {local_path:?}"))?);
            }
            if matched.is_empty() {
                return Err(self
                    .env
                    .abort(format!("put: no local files matched {local_path:?}"))
                    .into());
            }
            matched
        } else {
            vec![PathBuf::from(local_path)]
        };

        let remote = resolve_remote(remote_path);
        let remote_is_dir = sources.len() > 1 || remote_path.ends_with('/');
        let warn_only = self.env.warn_only();
        let writer = self.writer(false);

        let conn = self.connection().await?;
        let sftp = conn.sftp().await.context("starting sftp subsystem")?;

        let mut outcome = TransferOutcome::default();
        for source in &sources {
            let file_name = source
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "upload".to_string());
            let dest = if remote_is_dir {
                remote_join(&remote, &file_name)
            } else {
                remote.clone()
            };

            writer.line(
                Stream::Upload,
                &format!("{} -> {dest}", source.display()),
            );

            let mode = if opts.mirror_local_mode {
                local_mode(source)
            } else {
                opts.mode
            };

            let uploaded = if opts.use_sudo {
                self.put_via_sudo(&sftp, source, &dest, &opts, mode).await
            } else {
                upload_file(&sftp, source, &dest, mode).await
            };

            match uploaded {
                Ok(()) => outcome.uploaded.push(dest),
                Err(e) => {
                    writer.warn(&format!("put {} failed: {e:#}", source.display()));
                    outcome.failed.push(source.display().to_string());
                    if !warn_only {
                        return Err(Error::TransferFailed {
                            failed: outcome.failed,
                        }
                        .into());
                    }
                }
            }
        }
        Ok(outcome)
    }

    async fn put_via_sudo(
        &mut self,
        sftp: &SftpSession,
        source: &Path,
        dest: &str,
        opts: &PutOptions,
        mode: Option<u32>,
    ) -> anyhow::Result<()> {
        let temp_dir = if opts.temp_dir.is_empty() {
            "/tmp"
        } else {
            &opts.temp_dir
        };
        let file_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        let staging = format!("{}/{}.{}", temp_dir.trim_end_matches('/'), file_name, std::process::id());

        upload_file(sftp, source, &staging, None).await?;

        let quiet = RunOptions {
            quiet: true,
            warn_only: Some(false),
            ..Default::default()
        };
        let mut script = format!("mv '{staging}' '{dest}'");
        if let Some(mode) = mode {
            script.push_str(&format!(" && chmod {mode:o} '{dest}'"));
        }
        self.sudo(
            &script,
            SudoOptions {
                run: quiet,
                ..Default::default()
            },
        )
        .await
        .context("moving staged upload into place")?;
        Ok(())
    }

    /// Download one or more files from the current host.
    pub async fn get(
        &mut self,
        remote_path: &str,
        local_path: &str,
        opts: GetOptions,
    ) -> anyhow::Result<TransferOutcome> {
        if interrupt::stop_requested() {
            return Err(Error::Interrupted.into());
        }

        let remote = resolve_remote(remote_path);
        let sources = if has_wildcards(&remote) {
            self.expand_remote_glob(&remote).await?
        } else {
            vec![remote.clone()]
        };
        if sources.is_empty() {
            return Err(self
                .env
                .abort(format!("get: no remote files matched {remote_path:?}"))
                .into());
        }

        let local_is_dir = sources.len() > 1
            || local_path.ends_with('/')
            || Path::new(local_path).is_dir();
        let warn_only = self.env.warn_only();
        let writer = self.writer(false);

        let conn = self.connection().await?;
        let sftp = conn.sftp().await.context("starting sftp subsystem")?;

        let mut outcome = TransferOutcome::default();
        for source in &sources {
            let file_name = source.rsplit('/').next().unwrap_or(source).to_string();
            let dest: PathBuf = if local_is_dir {
                Path::new(local_path).join(&file_name)
            } else {
                PathBuf::from(local_path)
            };

            writer.line(
                Stream::Download,
                &format!("{source} -> {}", dest.display()),
            );

            let downloaded = if opts.use_sudo {
                self.get_via_sudo(&sftp, source, &dest, &opts).await
            } else {
                download_file(&sftp, source, &dest).await
            };

            match downloaded {
                Ok(()) => outcome.downloaded.push(dest.display().to_string()),
                Err(e) => {
                    writer.warn(&format!("get {source} failed: {e:#}"));
                    outcome.failed.push(source.clone());
                    if !warn_only {
                        return Err(Error::TransferFailed {
                            failed: outcome.failed,
                        }
                        .into());
                    }
                }
            }
        }
        Ok(outcome)
    }

    async fn get_via_sudo(
        &mut self,
        sftp: &SftpSession,
        source: &str,
        dest: &Path,
        opts: &GetOptions,
    ) -> anyhow::Result<()> {
        let temp_dir = if opts.temp_dir.is_empty() {
            "/tmp"
        } else {
            &opts.temp_dir
        };
        let file_name = source.rsplit('/').next().unwrap_or("download");
        let staging = format!(
            "{}/{}.{}",
            temp_dir.trim_end_matches('/'),
            file_name,
            std::process::id()
        );

        let quiet = RunOptions {
            quiet: true,
            warn_only: Some(false),
            ..Default::default()
        };
        self.sudo(
            &format!("cp -p '{source}' '{staging}' && chmod 404 '{staging}'"),
            SudoOptions {
                run: quiet.clone(),
                ..Default::default()
            },
        )
        .await
        .context("staging remote file for download")?;

        let result = download_file(sftp, &staging, dest).await;

        let _ = self
            .sudo(
                &format!("rm -f '{staging}'"),
                SudoOptions {
                    run: quiet,
                    ..Default::default()
                },
            )
            .await;
        result
    }

    /// Expand a remote wildcard by listing matches on the remote side.
    async fn expand_remote_glob(&mut self, pattern: &str) -> anyhow::Result<Vec<String>> {
        let listing = self
            .run(
                &format!("ls -1d {pattern}"),
                RunOptions {
                    quiet: true,
                    warn_only: Some(true),
                    ..Default::default()
                },
            )
            .await?;
        if listing.failed() {
            return Ok(Vec::new());
        }
        Ok(listing
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }
}

async fn upload_file(
    sftp: &SftpSession,
    source: &Path,
    dest: &str,
    mode: Option<u32>,
) -> anyhow::Result<()> {
    ensure_remote_dirs(sftp, dest).await;

    let contents = tokio::fs::read(source)
        .await
        .with_context(|| format!("reading {}", source.display()))?;

    let mut file = sftp
        .open_with_flags(
            dest,
            OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE,
        )
        .await
        .with_context(|| format!("opening remote {dest}"))?;
    file.write_all(&contents)
        .await
        .with_context(|| format!("writing remote {dest}"))?;
    file.flush().await?;
    file.shutdown().await?;

    if let Some(mode) = mode {
        let mut attrs = russh_sftp::protocol::FileAttributes::default();
        attrs.permissions = Some(mode & 0o7777);
        sftp.set_metadata(dest, attrs)
            .await
            .with_context(|| format!("setting mode {mode:o} on {dest}"))?;
    }
    Ok(())
}

async fn download_file(sftp: &SftpSession, source: &str, dest: &Path) -> anyhow::Result<()> {
    if let Some(parent) = dest.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }

    let mut remote_file = sftp
        .open_with_flags(source, OpenFlags::READ)
        .await
        .with_context(|| format!("opening remote {source}"))?;
    let mut contents = Vec::new();
    remote_file
        .read_to_end(&mut contents)
        .await
        .with_context(|| format!("reading remote {source}"))?;

    let mut local_file = tokio::fs::File::create(dest)
        .await
        .with_context(|| format!("creating {}", dest.display()))?;
    local_file.write_all(&contents).await?;
    local_file.flush().await?;
    Ok(())
}

#[cfg(unix)]
fn local_mode(path: &Path) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .ok()
        .map(|m| m.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn local_mode(_path: &Path) -> Option<u32> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_detection() {
        assert!(has_wildcards("/var/log/*.log"));
        assert!(has_wildcards("file?.txt"));
        assert!(has_wildcards("file[0-9].txt"));
        assert!(!has_wildcards("/etc/hosts"));
    }

    #[test]
    fn test_resolve_remote_tilde() {
        assert_eq!(resolve_remote("~"), ".");
        assert_eq!(resolve_remote("~/app/config"), "app/config");
        assert_eq!(resolve_remote("/etc/hosts"), "/etc/hosts");
        assert_eq!(resolve_remote("relative/path"), "relative/path");
    }

    #[test]
    fn test_remote_join() {
        assert_eq!(remote_join("/opt/app/", "a.txt"), "/opt/app/a.txt");
        assert_eq!(remote_join(".", "a.txt"), "a.txt");
        assert_eq!(remote_join("", "a.txt"), "a.txt");
    }

    #[cfg(unix)]
    #[test]
    fn test_local_mode_reads_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"x").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o640)).unwrap();
        assert_eq!(local_mode(&path), Some(0o640));
    }
}
