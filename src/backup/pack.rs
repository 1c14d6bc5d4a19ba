//! The producing side of the optimized backup.

use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;

use super::{member_name, MANIFEST_PATH};
use crate::migration::MetadataHeader;
use crate::subvolume::{join_rel, send_guarded, CancelToken, SubvolumeEngine};
use crate::volume::revert::Revert;
use crate::volume::{Driver, Error, Result, Volume};

/// What the platform requests from a backup.
#[derive(Clone, Debug, Default)]
pub struct BackupOptions {
    /// Snapshots to include, oldest first. Must match what is on storage.
    pub snapshots: Vec<String>,
    /// Use the pool-native format. Plain-file backups are the generic
    /// packer's business.
    pub optimized: bool,
}

/// Writes `vol` (and its snapshots) as an optimized backup into `tar`.
pub fn backup_volume<E: SubvolumeEngine, W: Write>(
    driver: &Driver<E>,
    vol: &Volume,
    tar: &mut tar::Builder<W>,
    opts: &BackupOptions,
    cancel: &CancelToken,
) -> Result<()> {
    if !opts.optimized {
        return Err(Error::NotSupported(
            "plain-file backups are handled by the generic packer".to_string(),
        ));
    }

    let engine = driver.engine();
    info!(driver.logger(), "creating optimized backup";
          "volume" => %vol, "snapshots" => opts.snapshots.len());

    // The requested snapshot list has to match storage, a stale list would
    // break the differential chain on restore.
    let on_disk = driver.volume_snapshots(vol)?;
    if on_disk != opts.snapshots {
        return Err(Error::Protocol(format!(
            "snapshot list mismatch: requested {:?}, storage has {:?}",
            opts.snapshots, on_disk
        )));
    }

    let header = MetadataHeader::collect(engine, vol, &opts.snapshots)?;
    let yaml = serde_yaml::to_string(&header)?;
    append_member(tar, MANIFEST_PATH, yaml.as_bytes())?;

    let scratch = tempfile::Builder::new()
        .prefix("backup.")
        .tempdir_in(driver.pool_dir())?;
    let stable = scratch.path().join("volume");

    let mut scratch_cleanup = Revert::new();
    engine.snapshot_recursive(&vol.mount_path(), &stable, true)?;
    {
        let stable = stable.clone();
        scratch_cleanup.add("delete stable backup snapshot", move || {
            engine.delete_recursive(&stable).map_err(Error::from)
        });
    }

    let mut anchor: Option<PathBuf> = None;
    for snap in &opts.snapshots {
        let snap_path = vol.snapshot(snap)?.mount_path();

        for sub in header.subvolumes_of(snap) {
            cancel.check()?;
            let src = join_rel(&snap_path, sub.rel_path());
            let parent = anchor
                .as_ref()
                .map(|a| join_rel(a, sub.rel_path()))
                .filter(|p| p.exists());
            spool_send(
                driver,
                tar,
                scratch.path(),
                &src,
                parent.as_deref(),
                &member_name(vol, Some(snap.as_str()), &sub.path)?,
                cancel,
            )?;
        }

        anchor = Some(snap_path);
    }

    for sub in header.subvolumes_of("") {
        cancel.check()?;
        let src = join_rel(&stable, sub.rel_path());
        let parent = anchor
            .as_ref()
            .map(|a| join_rel(a, sub.rel_path()))
            .filter(|p| p.exists());
        spool_send(
            driver,
            tar,
            scratch.path(),
            &src,
            parent.as_deref(),
            &member_name(vol, None, &sub.path)?,
            cancel,
        )?;
    }

    Ok(())
}

/// Spools one send stream to a temp file, then appends it to the tar. The
/// tar header needs the stream size up front.
fn spool_send<E: SubvolumeEngine, W: Write>(
    driver: &Driver<E>,
    tar: &mut tar::Builder<W>,
    scratch: &std::path::Path,
    src: &std::path::Path,
    parent: Option<&std::path::Path>,
    member: &str,
    cancel: &CancelToken,
) -> Result<()> {
    let mut spool = tempfile::tempfile_in(scratch)?;
    send_guarded(driver.engine(), src, parent, &mut spool, cancel)?;

    let size = spool.seek(SeekFrom::End(0))?;
    spool.seek(SeekFrom::Start(0))?;

    let mut header = tar::Header::new_gnu();
    header.set_size(size);
    header.set_mode(0o644);
    tar.append_data(&mut header, member, &mut spool)?;

    Ok(())
}

fn append_member<W: Write>(tar: &mut tar::Builder<W>, path: &str, bytes: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    tar.append_data(&mut header, path, bytes)?;
    Ok(())
}
