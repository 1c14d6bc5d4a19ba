//! Everything needed to work with individual subvolumes: the primitive
//! engine backed by `btrfs(8)` and the composed operations (recursive
//! delete, recursive snapshot, graph introspection) built on top of it.

pub mod open3;
pub(crate) mod ioctl;
pub(crate) mod stream;

pub use self::open3::BtrfsOpen3;

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use getset::Getters;
use serde::{Deserialize, Serialize};
use slog::Logger;

quick_error! {
    /// Error kinds raised by the subvolume primitive layer.
    #[derive(Debug)]
    pub enum Error {
        /// `btrfs` executable not found in PATH.
        CommandNotFound {
            display("btrfs executable not found in PATH")
        }
        /// A pool command exited with a failure. The stderr of the tool is
        /// preserved verbatim, wrapped with the operation that ran it.
        CommandFailed(op: String, stderr: String) {
            display("{} failed: {}", op, stderr)
        }
        /// The path does not point at a subvolume.
        NotSubvolume(path: PathBuf) {
            display("{:?} is not a btrfs subvolume", path)
        }
        /// Quotas are disabled pool-wide.
        NoQuota {
            display("quotas are not enabled on this pool")
        }
        /// Quotas are enabled but no qgroup tracks this subvolume.
        NoQgroup {
            display("subvolume has no qgroup attached")
        }
        /// The operation was cancelled through its [`CancelToken`].
        Cancelled {
            display("operation cancelled")
        }
        ParseError(what: String) {
            display("unable to parse btrfs output: {}", what)
        }
        Io(err: io::Error) {
            cause(err)
            from()
            display("I/O error: {}", err)
        }
    }
}

/// Type alias to `Result<T, Error>`.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ErrorKind {
    CommandNotFound,
    CommandFailed,
    NotSubvolume,
    NoQuota,
    NoQgroup,
    Cancelled,
    ParseError,
    Io,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::CommandNotFound => ErrorKind::CommandNotFound,
            Error::CommandFailed(_, _) => ErrorKind::CommandFailed,
            Error::NotSubvolume(_) => ErrorKind::NotSubvolume,
            Error::NoQuota => ErrorKind::NoQuota,
            Error::NoQgroup => ErrorKind::NoQgroup,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::ParseError(_) => ErrorKind::ParseError,
            Error::Io(_) => ErrorKind::Io,
        }
    }

    pub(crate) fn from_stderr(op: &str, stderr_raw: &[u8]) -> Self {
        let stderr = String::from_utf8_lossy(stderr_raw).trim().to_string();
        if stderr.contains("quota") && (stderr.contains("not enabled") || stderr.contains("disabled")) {
            Error::NoQuota
        } else {
            Error::CommandFailed(op.to_string(), stderr)
        }
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool { self.kind() == other.kind() }
}

/// Cooperative cancellation flag threaded through long-running operations.
/// Cloning shares the flag.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> CancelToken { CancelToken::default() }

    /// Request cancellation. Running operations stop at their next check
    /// point and unwind through their rollback stacks.
    pub fn cancel(&self) { self.0.store(true, Ordering::SeqCst) }

    pub fn is_cancelled(&self) -> bool { self.0.load(Ordering::SeqCst) }

    pub(crate) fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// A single entry in the subvolume graph of a volume.
///
/// The record doubles as the wire representation used by the optimized
/// migration header and the optimized backup manifest, hence the field
/// renames.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Subvolume {
    /// Short name of the snapshot this subvolume belongs to. Empty for the
    /// main volume.
    #[serde(rename = "Snapshot")]
    pub snapshot: String,
    /// Path relative to the volume root. The root subvolume itself is `"/"`.
    #[serde(rename = "Path")]
    pub path: String,
    #[serde(rename = "Readonly")]
    pub readonly: bool,
    #[serde(rename = "UUID")]
    pub uuid: String,
    /// Only set when the subvolume was materialized by a receive stream.
    #[serde(rename = "ReceivedUUID")]
    pub received_uuid: String,
}

impl Subvolume {
    pub fn is_root(&self) -> bool { self.path == "/" }

    /// Path relative to the volume root with the leading `/` stripped.
    /// Empty for the root subvolume.
    pub fn rel_path(&self) -> &str { self.path.trim_start_matches('/') }
}

/// Joins a relative subvolume path onto a volume root. An empty relative
/// path resolves to the root itself.
pub fn join_rel(root: &Path, rel: &str) -> PathBuf {
    if rel.is_empty() {
        root.to_path_buf()
    } else {
        root.join(rel)
    }
}

/// One qgroup row as reported by the pool, `0/<subvolume-id>` keyed.
#[derive(Clone, Debug, Eq, PartialEq, Getters)]
#[get = "pub"]
pub struct Qgroup {
    id: String,
    referenced: u64,
    exclusive: u64,
    referenced_limit: Option<u64>,
    exclusive_limit: Option<u64>,
}

impl Qgroup {
    pub fn new(
        id: String,
        referenced: u64,
        exclusive: u64,
        referenced_limit: Option<u64>,
        exclusive_limit: Option<u64>,
    ) -> Qgroup {
        Qgroup { id, referenced, exclusive, referenced_limit, exclusive_limit }
    }
}

/// Generic interface to the subvolume tooling of a pool. The default
/// implementation calls to `btrfs(8)`; the trait exists so the lifecycle,
/// migration and backup engines can run against a double in unit tests.
pub trait SubvolumeEngine {
    fn logger(&self) -> &Logger;

    /// Make a new empty subvolume at `path`.
    fn create(&self, path: &Path) -> Result<()>;
    /// Delete a single subvolume. Fails while nested subvolumes remain.
    fn delete(&self, path: &Path) -> Result<()>;
    /// Snapshot a single subvolume level. Nested subvolumes of the source
    /// come out as empty directories.
    fn snapshot_one(&self, src: &Path, dst: &Path, readonly: bool) -> Result<()>;
    fn exists(&self, path: &Path) -> Result<bool>;
    fn is_readonly(&self, path: &Path) -> Result<bool>;
    fn set_readonly(&self, path: &Path, readonly: bool) -> Result<()>;
    fn uuid(&self, path: &Path) -> Result<String>;
    fn received_uuid(&self, path: &Path) -> Result<Option<String>>;
    /// Re-imprint the receive lineage. The read-write transition clears the
    /// received UUID, this is the only way to keep differential receive
    /// chains intact afterwards.
    fn set_received_uuid(&self, path: &Path, uuid: &str) -> Result<()>;
    fn subvolume_id(&self, path: &Path) -> Result<u64>;
    /// Subvolumes strictly below `root` as `(id, path relative to root)`,
    /// in no particular order.
    fn list_subvolumes(&self, root: &Path) -> Result<Vec<(u64, String)>>;
    /// Mark a directory no-CoW so files created inside inherit the flag.
    fn set_nocow(&self, path: &Path) -> Result<()>;

    /// Stream a subvolume. With `parent` the stream is differential against
    /// that ancestor. The source has to be read-only.
    fn send(
        &self,
        path: &Path,
        parent: Option<&Path>,
        out: &mut dyn Write,
        cancel: &CancelToken,
        progress: Option<&mut dyn FnMut(u64)>,
    ) -> Result<()>;
    /// Accept one send stream under `dir`, returning the path of the newly
    /// materialized subvolume. The subvolume comes out read-only with its
    /// received UUID imprinted by the pool.
    fn receive(
        &self,
        dir: &Path,
        input: &mut dyn Read,
        cancel: &CancelToken,
        progress: Option<&mut dyn FnMut(u64)>,
    ) -> Result<PathBuf>;

    /// Enable quota accounting pool-wide. Idempotent.
    fn quota_enable(&self, path: &Path) -> Result<()>;
    /// The qgroup tracking `path`. Distinguishes [`Error::NoQuota`] from
    /// [`Error::NoQgroup`].
    fn qgroup(&self, path: &Path) -> Result<Qgroup>;
    fn qgroup_create(&self, path: &Path) -> Result<()>;
    fn qgroup_destroy(&self, path: &Path) -> Result<()>;
    fn qgroup_limit_referenced(&self, path: &Path, limit: Option<u64>) -> Result<()>;
    fn qgroup_limit_exclusive(&self, path: &Path, limit: Option<u64>) -> Result<()>;

    /// Move a subvolume to a new location. Subvolume identity follows the
    /// path, so a plain rename is sufficient.
    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        fs::rename(from, to).map_err(Error::from)
    }

    /// Delete `path` together with every nested subvolume, leaves first.
    /// Read-only flags are cleared top-down beforehand since a read-only
    /// parent blocks deleting its children.
    fn delete_recursive(&self, path: &Path) -> Result<()> {
        if self.is_readonly(path)? {
            self.set_readonly(path, false)?;
        }

        let mut subs = self.list_subvolumes(path)?;
        subs.sort_by(|a, b| a.1.cmp(&b.1));

        for (_, rel) in &subs {
            let sub = path.join(rel);
            if self.is_readonly(&sub)? {
                self.set_readonly(&sub, false)?;
            }
        }

        for (_, rel) in subs.iter().rev() {
            self.delete(&path.join(rel))?;
        }

        self.delete(path)
    }

    /// Snapshot `src` into `dst`, recreating nested subvolumes in place.
    /// The top level is created writable so the nested tree can be
    /// populated; nested snapshots inherit the read-only flag of their
    /// source, applied leaves first, and `readonly` is applied to the top
    /// level last.
    fn snapshot_recursive(&self, src: &Path, dst: &Path, readonly: bool) -> Result<()> {
        self.snapshot_one(src, dst, false)?;

        let mut subs = self.list_subvolumes(src)?;
        subs.sort_by(|a, b| a.1.cmp(&b.1));

        for (_, rel) in &subs {
            let sub_dst = dst.join(rel);
            // Clear the empty directory the parent snapshot left behind.
            let _ = fs::remove_dir(&sub_dst);
            self.snapshot_one(&src.join(rel), &sub_dst, false)?;
        }

        for (_, rel) in subs.iter().rev() {
            if self.is_readonly(&src.join(rel))? {
                self.set_readonly(&dst.join(rel), true)?;
            }
        }

        if readonly {
            self.set_readonly(dst, true)?;
        }

        Ok(())
    }

    /// The subvolume graph below (and including) `root`, ordered so that
    /// children sort after their parents. A reverse traversal therefore
    /// restores read-only flags leaves inward without tripping over the
    /// parent-read-only-blocks-child rule.
    fn subvolumes_metadata(&self, root: &Path) -> Result<Vec<Subvolume>> {
        let mut entries = vec![Subvolume {
            snapshot: String::new(),
            path: "/".to_string(),
            readonly: self.is_readonly(root)?,
            uuid: self.uuid(root)?,
            received_uuid: self.received_uuid(root)?.unwrap_or_default(),
        }];

        let mut subs = self.list_subvolumes(root)?;
        subs.sort_by(|a, b| a.1.cmp(&b.1));

        for (_, rel) in subs {
            let path = root.join(&rel);
            entries.push(Subvolume {
                snapshot: String::new(),
                path: format!("/{}", rel),
                readonly: self.is_readonly(&path)?,
                uuid: self.uuid(&path)?,
                received_uuid: self.received_uuid(&path)?.unwrap_or_default(),
            });
        }

        Ok(entries)
    }
}

/// Forces a subvolume read-only for the duration of the guard, restoring
/// the exact prior state on every exit path. Sending requires a read-only
/// source; live subvolumes usually are not.
pub struct ReadonlyGuard<'a, E: SubvolumeEngine + ?Sized> {
    engine: &'a E,
    path: PathBuf,
    was_readonly: bool,
}

impl<'a, E: SubvolumeEngine + ?Sized> ReadonlyGuard<'a, E> {
    pub fn hold(engine: &'a E, path: &Path) -> Result<Self> {
        let was_readonly = engine.is_readonly(path)?;
        if !was_readonly {
            engine.set_readonly(path, true)?;
        }

        Ok(ReadonlyGuard { engine, path: path.to_path_buf(), was_readonly })
    }
}

impl<'a, E: SubvolumeEngine + ?Sized> Drop for ReadonlyGuard<'a, E> {
    fn drop(&mut self) {
        if !self.was_readonly {
            if let Err(e) = self.engine.set_readonly(&self.path, false) {
                warn!(self.engine.logger(), "failed to restore read-write state";
                      "path" => format_args!("{:?}", self.path), "error" => %e);
            }
        }
    }
}

/// Sends with the source (and the differential parent, if any) forced
/// read-only for the duration, restoring the prior flags on every exit
/// path.
pub fn send_guarded<E: SubvolumeEngine>(
    engine: &E,
    src: &Path,
    parent: Option<&Path>,
    out: &mut dyn Write,
    cancel: &CancelToken,
) -> Result<()> {
    let _src_guard = ReadonlyGuard::hold(engine, src)?;
    let _parent_guard = match parent {
        Some(parent) => Some(ReadonlyGuard::hold(engine, parent)?),
        None => None,
    };

    engine.send(src, parent, out, cancel, None)
}

#[cfg(test)]
mod test {
    use super::Subvolume;

    #[test]
    fn rel_path_strips_leading_slash() {
        let mut sub = Subvolume::default();
        sub.path = "/".to_string();
        assert!(sub.is_root());
        assert_eq!("", sub.rel_path());

        sub.path = "/data/images".to_string();
        assert!(!sub.is_root());
        assert_eq!("data/images", sub.rel_path());
    }

    #[test]
    fn wire_field_names() {
        let sub = Subvolume {
            snapshot: "s1".to_string(),
            path: "/".to_string(),
            readonly: true,
            uuid: "05d0d31b-1e9c-4242-a966-7c04939cdc37".to_string(),
            received_uuid: String::new(),
        };

        let value = serde_json::to_value(&sub).unwrap();
        let keys: Vec<_> = value.as_object().unwrap().keys().cloned().collect();
        for key in &["Snapshot", "Path", "Readonly", "UUID", "ReceivedUUID"] {
            assert!(keys.iter().any(|k| k == key), "missing key {}", key);
        }
    }
}
