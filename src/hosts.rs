//! Managed section of the system hosts file.
//!
//! Entries live between a fixed start and end marker. Lines outside the
//! markers are copied through byte-for-byte; only the section is rewritten.
//! Every change replaces the file atomically by writing a sibling temp file
//! and renaming it over the original.

use async_trait::async_trait;
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Result, TunnelError};

pub const DEFAULT_HOSTS_PATH: &str = "/etc/hosts";

const SECTION_START: &str = "# Added by kube-service-tunnel";
const SECTION_COMMENT: &str = "# This section is automatically managed by kube-service-tunnel";
const SECTION_END: &str = "# End of section";
const LOOPBACK: &str = "127.0.0.1";

/// Edits host-name entries in the managed section.
#[async_trait]
pub trait HostsEditor: Send + Sync {
    /// Adds `127.0.0.1 <name>`. No-op if the name is already present.
    async fn add_entry(&self, name: &str) -> Result<()>;

    /// Removes the entry for `name`. No-op if absent.
    async fn remove_entry(&self, name: &str) -> Result<()>;

    /// Removes the whole managed section, markers included.
    async fn clear_all_entries(&self) -> Result<()>;

    /// Names currently listed in the managed section.
    async fn entries(&self) -> Result<Vec<String>>;
}

/// A hosts file on disk. Edits through one instance are serialized.
pub struct HostsFile {
    path: PathBuf,
    lock: Mutex<()>,
}

impl HostsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fails early when the process lacks write access to the hosts file.
    pub fn check_writable(&self) -> Result<()> {
        match OpenOptions::new().append(true).open(&self.path) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::PermissionDenied => Err(
                TunnelError::HostsPermissionDenied(self.path.display().to_string()),
            ),
            Err(e) => Err(e.into()),
        }
    }

    async fn read(&self) -> Result<String> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(String::new()),
            Err(e) if e.kind() == ErrorKind::PermissionDenied => Err(
                TunnelError::HostsPermissionDenied(self.path.display().to_string()),
            ),
            Err(e) => Err(e.into()),
        }
    }

    /// Reads the file, applies `edit`, and writes the result if it changed.
    async fn update<F>(&self, edit: F) -> Result<()>
    where
        F: FnOnce(&str) -> Option<String> + Send,
    {
        let _guard = self.lock.lock().await;
        let content = self.read().await?;
        match edit(&content) {
            Some(updated) => self.write(&updated).await,
            None => Ok(()),
        }
    }

    async fn write(&self, content: &str) -> Result<()> {
        let denied = || TunnelError::HostsPermissionDenied(self.path.display().to_string());
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };

        let temp_file = NamedTempFile::new_in(parent).map_err(|e| match e.kind() {
            ErrorKind::PermissionDenied => denied(),
            _ => TunnelError::Hosts(e),
        })?;

        let std_file = temp_file.as_file().try_clone()?;
        let mut async_file = tokio::fs::File::from_std(std_file);
        async_file.write_all(content.as_bytes()).await?;
        async_file.sync_all().await?;
        drop(async_file);

        #[cfg(unix)]
        if let Ok(metadata) = tokio::fs::metadata(&self.path).await {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(metadata.permissions().mode());
            let _ = tokio::fs::set_permissions(temp_file.path(), permissions).await;
        }

        match temp_file.persist(&self.path) {
            Ok(_) => {}
            Err(err) if err.error.kind() == ErrorKind::PermissionDenied => return Err(denied()),
            Err(err) if err.error.kind() == ErrorKind::ResourceBusy => {
                // Bind-mounted hosts files (containers) cannot be renamed over.
                warn!(
                    "Cannot replace {} atomically, writing in place",
                    self.path.display()
                );
                tokio::fs::write(&self.path, content).await?;
            }
            Err(err) => return Err(err.error.into()),
        }

        debug!("Updated hosts file {}", self.path.display());
        Ok(())
    }
}

#[async_trait]
impl HostsEditor for HostsFile {
    async fn add_entry(&self, name: &str) -> Result<()> {
        let name = name.to_string();
        self.update(|content| with_entry(content, &name)).await?;
        info!("Added hosts entry {} -> {}", name, LOOPBACK);
        Ok(())
    }

    async fn remove_entry(&self, name: &str) -> Result<()> {
        let name = name.to_string();
        self.update(|content| without_entry(content, &name)).await?;
        debug!("Removed hosts entry {}", name);
        Ok(())
    }

    async fn clear_all_entries(&self) -> Result<()> {
        self.update(without_section).await?;
        info!("Cleared managed hosts entries");
        Ok(())
    }

    async fn entries(&self) -> Result<Vec<String>> {
        let _guard = self.lock.lock().await;
        Ok(managed_entries(&self.read().await?))
    }
}

/// Where a line sits relative to the managed section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Region {
    Outside,
    Start,
    Inside,
    End,
}

/// Splits into lines that keep their terminators, tagging each with its region.
///
/// A start marker opens the section only when the next marker after it is
/// an end marker; any other start marker is ordinary outside text.
fn classify(content: &str) -> Vec<(Region, &str)> {
    let lines: Vec<&str> = content.split_inclusive('\n').collect();

    let mut closed = vec![false; lines.len()];
    let mut end_follows = false;
    for (i, line) in lines.iter().enumerate().rev() {
        closed[i] = end_follows;
        match line.trim() {
            SECTION_END => end_follows = true,
            SECTION_START => end_follows = false,
            _ => {}
        }
    }

    let mut inside = false;
    lines
        .into_iter()
        .zip(closed)
        .map(|(line, closed)| {
            let trimmed = line.trim();
            let region = if !inside && closed && trimmed == SECTION_START {
                inside = true;
                Region::Start
            } else if inside && trimmed == SECTION_END {
                inside = false;
                Region::End
            } else if inside {
                Region::Inside
            } else {
                Region::Outside
            };
            (region, line)
        })
        .collect()
}

/// Parses `ip name` from a section line; comments and blanks yield `None`.
fn entry_name(line: &str) -> Option<&str> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    let mut fields = trimmed.split_whitespace();
    fields.next()?;
    fields.next()
}

fn entry_line(name: &str) -> String {
    format!("{}\t{}\n", LOOPBACK, name)
}

fn managed_entries(content: &str) -> Vec<String> {
    classify(content)
        .into_iter()
        .filter(|(region, _)| *region == Region::Inside)
        .filter_map(|(_, line)| entry_name(line).map(str::to_string))
        .collect()
}

fn with_entry(content: &str, name: &str) -> Option<String> {
    let lines = classify(content);
    let has_start = lines.iter().any(|(r, _)| *r == Region::Start);

    if lines
        .iter()
        .any(|(r, line)| *r == Region::Inside && entry_name(line) == Some(name))
    {
        return None;
    }

    let mut out = String::with_capacity(content.len() + name.len() + 16);

    if !has_start {
        out.push_str(content);
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(SECTION_START);
        out.push('\n');
        out.push_str(SECTION_COMMENT);
        out.push('\n');
        out.push_str(&entry_line(name));
        out.push_str(SECTION_END);
        out.push('\n');
        return Some(out);
    }

    let mut inserted = false;
    for (region, line) in &lines {
        if *region == Region::End && !inserted {
            if !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&entry_line(name));
            inserted = true;
        }
        out.push_str(line);
    }

    Some(out)
}

fn without_entry(content: &str, name: &str) -> Option<String> {
    let lines = classify(content);
    let mut removed = false;
    let mut out = String::with_capacity(content.len());

    for (region, line) in lines {
        if region == Region::Inside && entry_name(line) == Some(name) {
            removed = true;
            continue;
        }
        out.push_str(line);
    }

    removed.then_some(out)
}

fn without_section(content: &str) -> Option<String> {
    let lines = classify(content);
    if lines.iter().all(|(r, _)| *r == Region::Outside) {
        return None;
    }

    Some(
        lines
            .into_iter()
            .filter(|(r, _)| *r == Region::Outside)
            .map(|(_, line)| line)
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const BASE: &str = "127.0.0.1\tlocalhost\n::1   ip6-localhost  # loopback\n\n10.0.0.5 build-server\n";

    fn hosts_in(dir: &TempDir, content: &str) -> HostsFile {
        let path = dir.path().join("hosts");
        std::fs::write(&path, content).unwrap();
        HostsFile::new(path)
    }

    fn read(hosts: &HostsFile) -> String {
        std::fs::read_to_string(hosts.path()).unwrap()
    }

    #[test]
    fn test_add_creates_section() {
        let updated = with_entry(BASE, "web.default").unwrap();
        assert_eq!(
            updated,
            format!(
                "{}{}\n{}\n127.0.0.1\tweb.default\n{}\n",
                BASE, SECTION_START, SECTION_COMMENT, SECTION_END
            )
        );
        assert_eq!(managed_entries(&updated), vec!["web.default"]);
    }

    #[test]
    fn test_add_is_idempotent() {
        let once = with_entry(BASE, "web.default").unwrap();
        assert!(with_entry(&once, "web.default").is_none());
    }

    #[test]
    fn test_add_appends_inside_existing_section() {
        let once = with_entry(BASE, "web.default").unwrap();
        let twice = with_entry(&once, "api:8080.default").unwrap();
        assert_eq!(managed_entries(&twice), vec!["web.default", "api:8080.default"]);
        assert!(twice.ends_with(&format!("127.0.0.1\tapi:8080.default\n{}\n", SECTION_END)));
    }

    #[test]
    fn test_same_name_outside_section_is_ignored() {
        let content = "127.0.0.1 web.default\n";
        let updated = with_entry(content, "web.default").unwrap();
        assert_eq!(managed_entries(&updated), vec!["web.default"]);
        assert!(without_entry(content, "web.default").is_none());
    }

    #[test]
    fn test_missing_trailing_newline() {
        let updated = with_entry("127.0.0.1 localhost", "web.default").unwrap();
        assert!(updated.starts_with(&format!("127.0.0.1 localhost\n{}\n", SECTION_START)));
    }

    #[test]
    fn test_stray_start_marker_is_outside_text() {
        let content = format!(
            "127.0.0.1 localhost\n{}\n127.0.0.1\told.default\n10.0.0.5 build-server\n",
            SECTION_START
        );
        assert!(managed_entries(&content).is_empty());
        assert!(without_section(&content).is_none());
        assert!(without_entry(&content, "build-server").is_none());

        let updated = with_entry(&content, "web.default").unwrap();
        assert!(updated.starts_with(&content));
        assert_eq!(managed_entries(&updated), vec!["web.default"]);
        assert_eq!(without_section(&updated).unwrap(), content);
    }

    #[test]
    fn test_stray_start_marker_before_real_section() {
        let real = with_entry("", "web.default").unwrap();
        let content = format!("{}\n10.0.0.5 build-server\n{}", SECTION_START, real);
        assert_eq!(managed_entries(&content), vec!["web.default"]);
        assert_eq!(
            without_section(&content).unwrap(),
            format!("{}\n10.0.0.5 build-server\n", SECTION_START)
        );
    }

    #[test]
    fn test_remove_and_clear_ignore_comments() {
        let content = format!(
            "{}{}\n# keep me\n127.0.0.1 a.ns\n127.0.0.1   b.ns\n{}\n",
            BASE, SECTION_START, SECTION_END
        );
        assert_eq!(managed_entries(&content), vec!["a.ns", "b.ns"]);

        let removed = without_entry(&content, "a.ns").unwrap();
        assert!(removed.contains("# keep me\n"));
        assert_eq!(managed_entries(&removed), vec!["b.ns"]);
        assert!(without_entry(&removed, "a.ns").is_none());

        assert_eq!(without_section(&content).unwrap(), BASE);
        assert!(without_section(BASE).is_none());
    }

    #[tokio::test]
    async fn test_outside_lines_survive_byte_for_byte() {
        let dir = TempDir::new().unwrap();
        let hosts = hosts_in(&dir, BASE);

        hosts.add_entry("web.default").await.unwrap();
        hosts.add_entry("api:8080.default").await.unwrap();
        hosts.add_entry("web.default").await.unwrap();
        assert_eq!(
            hosts.entries().await.unwrap(),
            vec!["web.default", "api:8080.default"]
        );
        assert!(read(&hosts).starts_with(BASE));

        hosts.remove_entry("web.default").await.unwrap();
        hosts.remove_entry("missing.default").await.unwrap();
        assert_eq!(hosts.entries().await.unwrap(), vec!["api:8080.default"]);

        hosts.clear_all_entries().await.unwrap();
        assert_eq!(read(&hosts), BASE);
        assert!(hosts.entries().await.unwrap().is_empty());

        // Clearing again leaves the file alone.
        hosts.clear_all_entries().await.unwrap();
        assert_eq!(read(&hosts), BASE);
    }

    #[tokio::test]
    async fn test_stray_start_marker_survives_edits() {
        let dir = TempDir::new().unwrap();
        let content = format!("{}{}\n10.0.0.9 nas\n", BASE, SECTION_START);
        let hosts = hosts_in(&dir, &content);

        assert!(hosts.entries().await.unwrap().is_empty());
        hosts.remove_entry("nas").await.unwrap();
        hosts.clear_all_entries().await.unwrap();
        assert_eq!(read(&hosts), content);

        hosts.add_entry("web.default").await.unwrap();
        assert_eq!(hosts.entries().await.unwrap(), vec!["web.default"]);
        assert!(read(&hosts).starts_with(&content));

        hosts.clear_all_entries().await.unwrap();
        assert_eq!(read(&hosts), content);
    }

    #[tokio::test]
    async fn test_failed_replace_leaves_target_alone() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("hosts");
        std::fs::create_dir(&target).unwrap();
        std::fs::write(target.join("keep"), "data").unwrap();
        let hosts = HostsFile::new(&target);

        assert!(hosts.write(BASE).await.is_err());
        assert!(target.is_dir());
        assert_eq!(std::fs::read_to_string(target.join("keep")).unwrap(), "data");

        // The temp file is cleaned up with the failed rename.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("hosts")]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_read_only_directory_is_permission_denied() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let hosts = hosts_in(&dir, BASE);
        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o555)).unwrap();

        // Privileged users ignore directory permissions.
        let canary = dir.path().join("canary");
        let privileged = std::fs::write(&canary, "").is_ok();
        let result = if privileged {
            let _ = std::fs::remove_file(&canary);
            None
        } else {
            Some(hosts.add_entry("web.default").await)
        };
        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o755)).unwrap();

        if let Some(result) = result {
            assert!(matches!(result, Err(TunnelError::HostsPermissionDenied(_))));
            assert_eq!(read(&hosts), BASE);
        }
    }

    #[tokio::test]
    async fn test_missing_file_is_created() {
        let dir = TempDir::new().unwrap();
        let hosts = HostsFile::new(dir.path().join("hosts"));

        assert!(hosts.entries().await.unwrap().is_empty());
        hosts.add_entry("web.default").await.unwrap();
        assert_eq!(hosts.entries().await.unwrap(), vec!["web.default"]);
    }

    #[tokio::test]
    async fn test_check_writable() {
        let dir = TempDir::new().unwrap();
        let hosts = hosts_in(&dir, BASE);
        hosts.check_writable().unwrap();
    }
}
