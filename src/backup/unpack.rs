//! The restoring side of the optimized backup.

use std::collections::VecDeque;
use std::io::Read;

use super::{member_name, MANIFEST_PATH};
use crate::migration::MetadataHeader;
use crate::subvolume::{CancelToken, Subvolume, SubvolumeEngine};
use crate::volume::incoming::IncomingSet;
use crate::volume::revert::RevertHook;
use crate::volume::{Driver, Error, Result, Volume};

/// What the platform knows about the backup being restored.
#[derive(Clone, Debug, Default)]
pub struct RestoreOptions {
    /// Snapshots the platform's backup index lists, oldest first. The
    /// authority for what to expect when the container carries no
    /// optimized manifest.
    pub snapshots: Vec<String>,
    /// The container was produced by the optimized path. Plain-file
    /// restores are the generic unpacker's business.
    pub optimized: bool,
}

/// Restores `vol` from an optimized backup container.
///
/// The container is scanned in one pass: members belonging to other
/// components of the same container (a VM's config volume next to its
/// block volume) are skipped. A container without an optimized manifest is
/// treated as legacy, limited to root-only subvolumes; a legacy backup
/// that should have had nested subvolumes silently loses them, which is a
/// known limitation of that format.
pub fn restore_volume<'d, E: SubvolumeEngine, R: Read>(
    driver: &'d Driver<E>,
    vol: &Volume,
    archive: &mut tar::Archive<R>,
    opts: &RestoreOptions,
    cancel: &CancelToken,
) -> Result<RevertHook<'d>> {
    if !opts.optimized {
        return Err(Error::NotSupported(
            "plain-file backups are handled by the generic unpacker".to_string(),
        ));
    }

    if driver.has_volume(vol)? {
        return Err(Error::AlreadyExists(vol.name().clone()));
    }

    info!(driver.logger(), "restoring optimized backup"; "volume" => %vol);

    let scratch = tempfile::Builder::new()
        .prefix("backup.")
        .tempdir_in(driver.pool_dir())?;

    let mut incoming = IncomingSet::new(driver, vol, scratch.path());
    let mut manifest: Option<MetadataHeader> = None;
    let mut plan: VecDeque<(String, Subvolume)> = VecDeque::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_string_lossy().into_owned();

        if path == MANIFEST_PATH {
            // A later manifest belongs to another component in the same
            // container; only the one ahead of our members counts.
            if !incoming.has_received() {
                let mut yaml = String::new();
                entry.read_to_string(&mut yaml)?;
                let header: MetadataHeader = serde_yaml::from_str(&yaml)?;
                plan = plan_members(vol, &header)?;
                manifest = Some(header);
            }
            continue;
        }

        if !path.starts_with("backup/") || !path.ends_with(".bin") {
            continue;
        }

        if manifest.is_none() {
            let header = MetadataHeader::root_only(&opts.snapshots);
            plan = plan_members(vol, &header)?;
            manifest = Some(header);
        }

        match plan.front() {
            Some((member, _)) if *member == path => {
                let (_, sub) = plan.pop_front().unwrap();
                incoming.receive_one(&sub, &mut entry, cancel)?;
            },
            // Members of other components share the container.
            _ => continue,
        }
    }

    if let Some((member, _)) = plan.front() {
        return Err(Error::Protocol(format!(
            "backup container is missing member {:?}",
            member
        )));
    }

    let manifest = manifest.ok_or_else(|| {
        Error::Protocol("backup container holds no volume streams".to_string())
    })?;

    incoming.finalize(&manifest, false)
}

/// The expected members in container order.
fn plan_members(vol: &Volume, header: &MetadataHeader) -> Result<VecDeque<(String, Subvolume)>> {
    let mut plan = VecDeque::new();

    for group in header.snapshot_names() {
        for sub in header.subvolumes_of(&group) {
            plan.push_back((member_name(vol, Some(group.as_str()), &sub.path)?, sub.clone()));
        }
    }
    for sub in header.subvolumes_of("") {
        plan.push_back((member_name(vol, None, &sub.path)?, sub.clone()));
    }

    Ok(plan)
}
