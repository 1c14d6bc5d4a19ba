//! The optimized migration engine: header negotiation, differential
//! send/receive and UUID-keyed refresh over a caller-supplied byte stream.

pub mod conn;
pub mod source;
pub mod target;

pub use self::conn::{loopback, LoopbackConn, MigrationConn};
pub use self::source::{send_volume, SourceOptions};
pub use self::target::{receive_volume, TargetOptions};

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::subvolume::{Subvolume, SubvolumeEngine};
use crate::volume::{Result, Volume};

bitflags! {
    /// Feature bits negotiated by the platform before either side of the
    /// optimized wire runs.
    pub struct Features: u32 {
        /// The first frame carries a JSON metadata header.
        const HEADER_FRAME = 0b0001;
        /// Nested subvolumes may be transferred.
        const SUBVOLUMES = 0b0010;
        /// Refresh mode diffs by received UUID and replies with the subset
        /// of subvolumes still needed.
        const SUBVOLUME_UUIDS = 0b0100;
    }
}

impl Default for Features {
    fn default() -> Features { Features::empty() }
}

/// Transport negotiated by the platform. Only the CoW-native mode is
/// handled by this engine, everything else belongs to the generic VFS
/// transport.
#[derive(AsRefStr, Copy, Clone, Debug, Display, EnumString, Eq, PartialEq)]
pub enum WireType {
    #[strum(serialize = "btrfs")]
    Native,
    #[strum(serialize = "rsync")]
    Generic,
}

impl Default for WireType {
    fn default() -> WireType { WireType::Native }
}

/// The manifest exchanged over the migration wire and stored inside the
/// optimized backup container: the ordered subvolume records of the volume
/// and its snapshots. On the reverse leg of a refresh it is reduced to the
/// subset the receiver still needs.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct MetadataHeader {
    #[serde(rename = "Subvolumes")]
    pub subvolumes: Vec<Subvolume>,
}

impl MetadataHeader {
    /// Collects the manifest of `vol` and its `snapshots` (oldest first)
    /// from the live subvolume graph.
    pub fn collect<E: SubvolumeEngine>(
        engine: &E,
        vol: &Volume,
        snapshots: &[String],
    ) -> Result<MetadataHeader> {
        let mut subvolumes = Vec::new();

        for snap in snapshots {
            let path = vol.snapshot(snap)?.mount_path();
            for mut sub in engine.subvolumes_metadata(&path)? {
                sub.snapshot = snap.clone();
                subvolumes.push(sub);
            }
        }

        subvolumes.extend(engine.subvolumes_metadata(&vol.mount_path())?);

        Ok(MetadataHeader { subvolumes })
    }

    /// The pseudo-manifest assumed when no header frame was negotiated:
    /// one root subvolume per expected snapshot plus the main volume.
    pub fn root_only(snapshots: &[String]) -> MetadataHeader {
        let mut subvolumes: Vec<Subvolume> = snapshots
            .iter()
            .map(|snap| Subvolume {
                snapshot: snap.clone(),
                path: "/".to_string(),
                readonly: true,
                ..Subvolume::default()
            })
            .collect();

        subvolumes.push(Subvolume {
            snapshot: String::new(),
            path: "/".to_string(),
            readonly: false,
            ..Subvolume::default()
        });

        MetadataHeader { subvolumes }
    }

    /// The records belonging to one snapshot (or the main volume for the
    /// empty name), parents before children.
    pub fn subvolumes_of<'a>(&'a self, snapshot: &'a str) -> impl Iterator<Item = &'a Subvolume> {
        self.subvolumes.iter().filter(move |sub| sub.snapshot == snapshot)
    }

    /// Snapshot names in manifest order, deduplicated. The main volume is
    /// not included.
    pub fn snapshot_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for sub in &self.subvolumes {
            if !sub.snapshot.is_empty() && !names.contains(&sub.snapshot) {
                names.push(sub.snapshot.clone());
            }
        }
        names
    }

    pub fn has_nested(&self) -> bool { self.subvolumes.iter().any(|sub| !sub.is_root()) }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sub(snapshot: &str, path: &str, uuid: &str) -> Subvolume {
        Subvolume {
            snapshot: snapshot.to_string(),
            path: path.to_string(),
            readonly: false,
            uuid: uuid.to_string(),
            received_uuid: String::new(),
        }
    }

    #[test]
    fn wire_shape() {
        let header = MetadataHeader {
            subvolumes: vec![sub("s1", "/", "aaa"), sub("", "/", "bbb")],
        };

        let json = serde_json::to_string(&header).unwrap();
        assert!(json.starts_with("{\"Subvolumes\":["));

        let back: MetadataHeader = serde_json::from_str(&json).unwrap();
        assert_eq!(header, back);
    }

    #[test]
    fn snapshot_names_keep_order() {
        let header = MetadataHeader {
            subvolumes: vec![
                sub("s1", "/", "a"),
                sub("s1", "/data", "b"),
                sub("s2", "/", "c"),
                sub("", "/", "d"),
            ],
        };

        assert_eq!(vec!["s1".to_string(), "s2".to_string()], header.snapshot_names());
        assert!(header.has_nested());
        assert_eq!(2, header.subvolumes_of("s1").count());
        assert_eq!(1, header.subvolumes_of("").count());
    }

    #[test]
    fn root_only_covers_snapshots_and_main() {
        let header = MetadataHeader::root_only(&["s1".to_string(), "s2".to_string()]);
        assert_eq!(3, header.subvolumes.len());
        assert!(!header.has_nested());
        assert!(header.subvolumes.iter().take(2).all(|s| s.readonly));
        assert!(!header.subvolumes.last().unwrap().readonly);
    }
}
