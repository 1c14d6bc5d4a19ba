//! The optimized backup/restore engine: a tar container holding a YAML
//! manifest plus one binary send stream per subvolume, supporting
//! differential chains and nested subvolumes.

mod pack;
mod unpack;

pub use self::pack::{backup_volume, BackupOptions};
pub use self::unpack::{restore_volume, RestoreOptions};

use crate::volume::{ContentType, Error, Result, Volume, VolumeType};

/// Location of the optimized manifest inside the container.
pub const MANIFEST_PATH: &str = "backup/optimized_header.yaml";

/// Stable, injective encoding of a subvolume path for use in a tar member
/// name. The leading `/` is stripped, `%` is escaped first and `/` mapped
/// to its escape, so the output never contains a `/` and decodes
/// unambiguously.
pub fn encode_path(path: &str) -> String {
    path.trim_start_matches('/').replace('%', "%25").replace('/', "%2F")
}

/// Inverse of [`encode_path`].
pub fn decode_path(encoded: &str) -> String {
    encoded.replace("%2F", "/").replace("%25", "%")
}

/// The authoritative tar member name of one subvolume stream.
///
/// `snapshot` is `None` for the main volume; `subvol_path` is the path of
/// the subvolume relative to the volume root (`"/"` for the root).
pub fn member_name(vol: &Volume, snapshot: Option<&str>, subvol_path: &str) -> Result<String> {
    let prefix = match (vol.vol_type(), vol.content(), snapshot) {
        (VolumeType::Container, _, None) => "container".to_string(),
        (VolumeType::Container, _, Some(snap)) => format!("snapshots/{}", snap),
        (VolumeType::VirtualMachine, ContentType::Block, None) => "virtual-machine".to_string(),
        (VolumeType::VirtualMachine, ContentType::Block, Some(snap)) => {
            format!("virtual-machine-snapshots/{}", snap)
        },
        (VolumeType::VirtualMachine, _, None) => "virtual-machine-config".to_string(),
        (VolumeType::VirtualMachine, _, Some(snap)) => {
            format!("virtual-machine-snapshots/{}-config", snap)
        },
        (VolumeType::Custom, _, None) => "volume".to_string(),
        (VolumeType::Custom, _, Some(snap)) => format!("volume-snapshots/{}", snap),
        (VolumeType::Image, _, _) => {
            return Err(Error::NotSupported(
                "image volumes are not part of backups".to_string(),
            ));
        },
    };

    let mut name = format!("backup/{}", prefix);
    if subvol_path != "/" {
        name.push('_');
        name.push_str(&encode_path(subvol_path));
    }
    name.push_str(".bin");
    Ok(name)
}
