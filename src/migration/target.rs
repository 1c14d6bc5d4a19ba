//! The receiving side of the optimized migration.

use super::{Features, MetadataHeader, MigrationConn, WireType};
use crate::subvolume::{join_rel, CancelToken, SubvolumeEngine};
use crate::volume::incoming::IncomingSet;
use crate::volume::revert::RevertHook;
use crate::volume::{Driver, Error, Result, Volume};

/// What the platform negotiated for the receiving side.
#[derive(Clone, Debug, Default)]
pub struct TargetOptions {
    pub wire: WireType,
    pub features: Features,
    /// Snapshots the source announced, oldest first. Only consulted when no
    /// header frame was negotiated.
    pub snapshots: Vec<String>,
    /// Refresh the existing local volume instead of seeding a new one.
    pub refresh: bool,
}

/// Receives a volume from a migration peer.
///
/// On success the rollback stack of the exchange is returned to the caller
/// so an outer operation (an instance migration spanning several volumes)
/// can still unwind this volume later.
pub fn receive_volume<'d, E: SubvolumeEngine, C: MigrationConn>(
    driver: &'d Driver<E>,
    vol: &Volume,
    conn: &mut C,
    opts: &TargetOptions,
    cancel: &CancelToken,
) -> Result<RevertHook<'d>> {
    if opts.wire != WireType::Native {
        return Err(Error::NotSupported(format!(
            "wire type \"{}\" belongs to the generic transport",
            opts.wire
        )));
    }

    let engine = driver.engine();
    info!(driver.logger(), "receiving volume";
          "volume" => %vol, "refresh" => opts.refresh);

    let header: MetadataHeader = if opts.features.contains(Features::HEADER_FRAME) {
        serde_json::from_slice(&conn.read_frame()?)?
    } else {
        MetadataHeader::root_only(&opts.snapshots)
    };

    // In refresh mode, answer with the subset of subvolumes the source
    // still has to transmit. A local snapshot subvolume counts as present
    // when its received UUID matches the UUID the source announced.
    let effective = if opts.refresh && opts.features.contains(Features::SUBVOLUME_UUIDS) {
        let mut needed = MetadataHeader::default();
        for sub in &header.subvolumes {
            if sub.snapshot.is_empty() {
                needed.subvolumes.push(sub.clone());
                continue;
            }

            let local = join_rel(&vol.snapshot(&sub.snapshot)?.mount_path(), sub.rel_path());
            let present = engine.exists(&local)?
                && engine.received_uuid(&local)?.as_deref() == Some(sub.uuid.as_str());
            if !present {
                needed.subvolumes.push(sub.clone());
            }
        }

        let json = serde_json::to_vec(&needed)?;
        conn.write_all(&json)?;
        conn.end_frame()?;
        needed
    } else {
        header.clone()
    };

    let scratch = tempfile::Builder::new()
        .prefix("migration.")
        .tempdir_in(driver.pool_dir())?;

    let mut incoming = IncomingSet::new(driver, vol, scratch.path());
    for group in effective.snapshot_names() {
        for sub in effective.subvolumes_of(&group) {
            incoming.receive_one(sub, conn, cancel)?;
        }
    }
    for sub in effective.subvolumes_of("") {
        incoming.receive_one(sub, conn, cancel)?;
    }

    incoming.finalize(&header, opts.refresh)
}
