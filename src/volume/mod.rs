//! The volume lifecycle layer: the data model shared by every engine in
//! this crate and the [`Driver`] that composes the subvolume primitives
//! into whole-volume operations.

pub mod blockfile;
pub mod driver;
pub(crate) mod incoming;
pub(crate) mod quota;
pub mod revert;

pub use self::driver::{BtrfsDriver, CopyOptions, CopyOptionsBuilder, Driver, Filler};
pub use self::revert::{Revert, RevertHook};

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use getset::Getters;
use regex::Regex;
use strum_macros::{AsRefStr, Display, EnumString};

use crate::subvolume;
use crate::utils::parse_size;

/// Well-known name of the raw image backing a block-content volume.
pub const BLOCK_FILE_NAME: &str = "root.img";

/// Suffix of the live root renamed aside while a restore is in flight.
/// Volume and snapshot names may not end in it.
pub(crate) const ROLLBACK_SUFFIX: &str = ".tmp";

quick_error! {
    /// Error kinds. This type is used across the volume, migration and
    /// backup modules.
    #[derive(Debug)]
    pub enum Error {
        /// The negotiated mode or the source topology requires a capability
        /// that is not available.
        NotSupported(what: String) {
            display("not supported: {}", what)
        }
        /// The volume is still referenced and cannot be released.
        InUse(what: String) {
            display("{}", what)
        }
        /// Resizing would shrink a block file.
        CannotBeShrunk(path: PathBuf) {
            display("block file at {:?} cannot be shrunk", path)
        }
        AlreadyExists(name: String) {
            display("volume \"{}\" already exists", name)
        }
        NotFound(name: String) {
            display("volume \"{}\" does not exist", name)
        }
        /// A snapshot name failed path traversal validation.
        InvalidName(name: String) {
            display("\"{}\" is not a valid name", name)
        }
        InvalidSize(value: String) {
            display("\"{}\" is not a valid size", value)
        }
        /// The migration peer or a backup archive violated the optimized
        /// exchange contract.
        Protocol(what: String) {
            display("protocol violation: {}", what)
        }
        Subvolume(err: subvolume::Error) {
            cause(err)
            from()
            display("{}", err)
        }
        Json(err: serde_json::Error) {
            cause(err)
            from()
            display("header encoding error: {}", err)
        }
        Yaml(err: serde_yaml::Error) {
            cause(err)
            from()
            display("manifest encoding error: {}", err)
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
    NotSupported,
    InUse,
    CannotBeShrunk,
    AlreadyExists,
    NotFound,
    InvalidName,
    InvalidSize,
    Protocol,
    Subvolume,
    Json,
    Yaml,
    Io,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotSupported(_) => ErrorKind::NotSupported,
            Error::InUse(_) => ErrorKind::InUse,
            Error::CannotBeShrunk(_) => ErrorKind::CannotBeShrunk,
            Error::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::InvalidName(_) => ErrorKind::InvalidName,
            Error::InvalidSize(_) => ErrorKind::InvalidSize,
            Error::Protocol(_) => ErrorKind::Protocol,
            Error::Subvolume(_) => ErrorKind::Subvolume,
            Error::Json(_) => ErrorKind::Json,
            Error::Yaml(_) => ErrorKind::Yaml,
            Error::Io(_) => ErrorKind::Io,
        }
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Error::Subvolume(l), Error::Subvolume(r)) => l.kind() == r.kind(),
            _ => self.kind() == other.kind(),
        }
    }
}

/// What kind of entity a volume backs. The serialized form doubles as the
/// name of the on-disk directory the volumes of that type live in.
#[derive(AsRefStr, Copy, Clone, Debug, Display, EnumString, Eq, Hash, PartialEq)]
pub enum VolumeType {
    #[strum(serialize = "containers")]
    Container,
    #[strum(serialize = "virtual-machines")]
    VirtualMachine,
    #[strum(serialize = "custom")]
    Custom,
    /// Image volumes are kept read-only after creation.
    #[strum(serialize = "images")]
    Image,
}

impl VolumeType {
    /// Name of the on-disk directory holding the snapshots of volumes of
    /// this type.
    pub fn snapshots_dir(&self) -> String { format!("{}-snapshots", self) }
}

/// What a volume holds.
#[derive(AsRefStr, Copy, Clone, Debug, Display, EnumString, Eq, Hash, PartialEq)]
pub enum ContentType {
    #[strum(serialize = "filesystem")]
    Filesystem,
    /// A raw disk image in a well-known file inside the subvolume.
    #[strum(serialize = "block")]
    Block,
    #[strum(serialize = "iso")]
    Iso,
}

lazy_static! {
    static ref SNAPSHOT_NAME_RE: Regex = Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").unwrap();
}

/// Validates a snapshot short name. Rejects anything that could escape the
/// snapshots directory or collide with reserved names.
pub fn validate_snapshot_name(name: &str) -> Result<()> {
    if !SNAPSHOT_NAME_RE.is_match(name) || name.ends_with(ROLLBACK_SUFFIX) {
        return Err(Error::InvalidName(name.to_string()));
    }
    Ok(())
}

/// A volume as the platform sees it: `(pool, type, content type, name)`
/// plus its configuration. Snapshots are volumes whose name is
/// `parent/snapshot`.
#[derive(Clone, Debug, Getters)]
#[get = "pub"]
pub struct Volume {
    pool: String,
    pool_dir: PathBuf,
    vol_type: VolumeType,
    content: ContentType,
    name: String,
    config: HashMap<String, String>,
}

impl Volume {
    pub fn new<S: Into<String>, P: Into<PathBuf>>(
        pool: S,
        pool_dir: P,
        vol_type: VolumeType,
        content: ContentType,
        name: &str,
        config: HashMap<String, String>,
    ) -> Result<Volume> {
        let mut parts = name.splitn(3, '/');
        let base = parts.next().unwrap_or("");
        let snap = parts.next();
        if base.is_empty() || parts.next().is_some() {
            return Err(Error::InvalidName(name.to_string()));
        }
        if let Some(snap) = snap {
            validate_snapshot_name(snap)?;
        }

        Ok(Volume {
            pool: pool.into(),
            pool_dir: pool_dir.into(),
            vol_type,
            content,
            name: name.to_string(),
            config,
        })
    }

    pub fn is_snapshot(&self) -> bool { self.name.contains('/') }

    /// Base volume name and, for snapshots, the snapshot short name.
    pub fn name_parts(&self) -> (&str, Option<&str>) {
        let mut parts = self.name.splitn(2, '/');
        (parts.next().unwrap_or(""), parts.next())
    }

    /// Deterministic on-disk location of the volume.
    pub fn mount_path(&self) -> PathBuf {
        let (base, snap) = self.name_parts();
        match snap {
            Some(snap) => self
                .pool_dir
                .join(self.vol_type.snapshots_dir())
                .join(base)
                .join(snap),
            None => self.pool_dir.join(self.vol_type.as_ref()).join(base),
        }
    }

    /// The per-volume directory its snapshots live in.
    pub fn snapshots_path(&self) -> PathBuf {
        let (base, _) = self.name_parts();
        self.pool_dir.join(self.vol_type.snapshots_dir()).join(base)
    }

    /// Location of the raw image of a block-content volume.
    pub fn block_file_path(&self) -> PathBuf { self.mount_path().join(BLOCK_FILE_NAME) }

    /// The `size` configuration in bytes. Empty and `0` mean unbounded.
    pub fn size_bytes(&self) -> Result<Option<u64>> {
        match self.config.get("size").map(String::as_str) {
            None | Some("") | Some("0") => Ok(None),
            Some(value) => parse_size(value)
                .map(Some)
                .map_err(|_| Error::InvalidSize(value.to_string())),
        }
    }

    /// The snapshot `snap` of this volume.
    pub fn snapshot(&self, snap: &str) -> Result<Volume> {
        if self.is_snapshot() {
            return Err(Error::InvalidName(format!("{}/{}", self.name, snap)));
        }
        validate_snapshot_name(snap)?;

        let mut vol = self.clone();
        vol.name = format!("{}/{}", self.name, snap);
        Ok(vol)
    }

    /// The parent of a snapshot volume.
    pub fn parent(&self) -> Option<Volume> {
        let (base, snap) = self.name_parts();
        snap.map(|_| {
            let mut vol = self.clone();
            vol.name = base.to_string();
            vol
        })
    }

    /// Renamed copy of this volume. Snapshots follow their parent.
    pub(crate) fn renamed(&self, new_name: &str) -> Result<Volume> {
        let (_, snap) = self.name_parts();
        let name = match snap {
            Some(snap) => format!("{}/{}", new_name, snap),
            None => new_name.to_string(),
        };
        Volume::new(
            self.pool.clone(),
            self.pool_dir.clone(),
            self.vol_type,
            self.content,
            &name,
            self.config.clone(),
        )
    }
}

impl fmt::Display for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.pool, self.vol_type, self.name)
    }
}

/// The rollback-safe rename target used while a restore replaces the root.
pub(crate) fn rollback_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(ROLLBACK_SUFFIX);
    PathBuf::from(os)
}

#[cfg(test)]
mod test {
    use super::*;

    fn volume(vol_type: VolumeType, name: &str) -> Volume {
        Volume::new(
            "default",
            "/var/lib/pools/default",
            vol_type,
            ContentType::Filesystem,
            name,
            HashMap::new(),
        )
        .unwrap()
    }

    #[test]
    fn mount_paths() {
        let vol = volume(VolumeType::Container, "c1");
        assert_eq!(
            PathBuf::from("/var/lib/pools/default/containers/c1"),
            vol.mount_path()
        );

        let snap = vol.snapshot("s1").unwrap();
        assert!(snap.is_snapshot());
        assert_eq!(
            PathBuf::from("/var/lib/pools/default/containers-snapshots/c1/s1"),
            snap.mount_path()
        );
        assert_eq!(vol.snapshots_path(), snap.snapshots_path());

        let vm = volume(VolumeType::VirtualMachine, "vm1");
        assert_eq!(
            PathBuf::from("/var/lib/pools/default/virtual-machines/vm1"),
            vm.mount_path()
        );
    }

    #[test]
    fn snapshot_name_validation() {
        assert!(validate_snapshot_name("snap0").is_ok());
        assert!(validate_snapshot_name("2024-01-02_03.04").is_ok());

        for bad in &["", ".", "..", "../x", "a/b", ".hidden", "x.tmp"] {
            assert!(validate_snapshot_name(bad).is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn volume_names() {
        assert!(volume(VolumeType::Container, "c1").parent().is_none());

        let snap = volume(VolumeType::Container, "c1").snapshot("s1").unwrap();
        assert_eq!("c1", snap.parent().unwrap().name());
        assert_eq!(("c1", Some("s1")), snap.name_parts());

        assert!(Volume::new(
            "default",
            "/p",
            VolumeType::Container,
            ContentType::Filesystem,
            "a/b/c",
            HashMap::new(),
        )
        .is_err());
    }

    #[test]
    fn size_config() {
        let mut config = HashMap::new();
        config.insert("size".to_string(), "1GiB".to_string());
        let vol = Volume::new(
            "default",
            "/p",
            VolumeType::Container,
            ContentType::Filesystem,
            "c1",
            config,
        )
        .unwrap();
        assert_eq!(Some(1073741824), vol.size_bytes().unwrap());

        let empty = volume(VolumeType::Container, "c1");
        assert_eq!(None, empty.size_bytes().unwrap());
    }

    #[test]
    fn rename_carries_snapshots() {
        let snap = volume(VolumeType::Custom, "web").snapshot("s1").unwrap();
        let renamed = snap.renamed("db").unwrap();
        assert_eq!("db/s1", renamed.name());
    }
}
