//! The sending side of the optimized migration.

use std::path::PathBuf;

use super::{Features, MetadataHeader, MigrationConn, WireType};
use crate::subvolume::{join_rel, send_guarded, CancelToken, SubvolumeEngine};
use crate::volume::revert::Revert;
use crate::volume::{Driver, Error, Result, Volume};

/// What the platform negotiated for the sending side.
#[derive(Clone, Debug, Default)]
pub struct SourceOptions {
    pub wire: WireType,
    pub features: Features,
    /// Snapshots to transfer, oldest first. Ordering is creation order.
    pub snapshots: Vec<String>,
    /// Refresh an existing volume on the target instead of seeding a new
    /// one.
    pub refresh: bool,
}

/// Streams `vol` (and its snapshots) to a migration peer.
pub fn send_volume<E: SubvolumeEngine, C: MigrationConn>(
    driver: &Driver<E>,
    vol: &Volume,
    conn: &mut C,
    opts: &SourceOptions,
    cancel: &CancelToken,
) -> Result<()> {
    if opts.wire != WireType::Native {
        return Err(Error::NotSupported(format!(
            "wire type \"{}\" belongs to the generic transport",
            opts.wire
        )));
    }

    let engine = driver.engine();
    info!(driver.logger(), "sending volume";
          "volume" => %vol, "refresh" => opts.refresh,
          "snapshots" => opts.snapshots.len());

    let mut header = MetadataHeader::collect(engine, vol, &opts.snapshots)?;

    // Without these a transfer would silently drop nested subvolumes.
    if header.has_nested() {
        if !opts.features.contains(Features::SUBVOLUMES) {
            return Err(Error::NotSupported(
                "volume has nested subvolumes but the subvolumes feature was not negotiated"
                    .to_string(),
            ));
        }
        if !opts.features.contains(Features::HEADER_FRAME) {
            return Err(Error::NotSupported(
                "nested subvolumes require the migration header frame".to_string(),
            ));
        }
    }

    if opts.features.contains(Features::HEADER_FRAME) {
        let json = serde_json::to_vec(&header)?;
        conn.write_all(&json)?;
        // Half-close ends the header frame.
        conn.end_frame()?;
    }

    let mut snaps_needed = opts.snapshots.clone();
    if opts.refresh && opts.features.contains(Features::SUBVOLUME_UUIDS) {
        // The receiver answers with the subset it still needs.
        let reply = conn.read_frame()?;
        header = serde_json::from_slice(&reply)?;
        let needed = header.snapshot_names();
        snaps_needed.retain(|snap| needed.contains(snap));
    }

    // A read-only snapshot of the live volume is the stable source for the
    // main transfer; the live subvolumes may be written to at any time.
    let scratch = tempfile::Builder::new()
        .prefix("migration.")
        .tempdir_in(driver.pool_dir())?;
    let stable = scratch.path().join("volume");

    let mut scratch_cleanup = Revert::new();
    engine.snapshot_recursive(&vol.mount_path(), &stable, true)?;
    {
        let stable = stable.clone();
        scratch_cleanup.add("delete stable migration snapshot", move || {
            engine.delete_recursive(&stable).map_err(Error::from)
        });
    }

    // Differential anchor: the previous snapshot, whether or not it needed
    // transferring. In refresh mode a skipped snapshot still anchors the
    // ones after it, the target holds a received copy of it.
    let mut anchor: Option<PathBuf> = None;
    for snap in &opts.snapshots {
        let snap_path = vol.snapshot(snap)?.mount_path();

        if snaps_needed.contains(snap) {
            for sub in header.subvolumes_of(snap) {
                cancel.check()?;
                let src = join_rel(&snap_path, sub.rel_path());
                let parent = anchor
                    .as_ref()
                    .map(|a| join_rel(a, sub.rel_path()))
                    .filter(|p| p.exists());
                send_guarded(engine, &src, parent.as_deref(), conn, cancel)?;
            }
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
        send_guarded(engine, &src, parent.as_deref(), conn, cancel)?;
    }

    Ok(())
}
