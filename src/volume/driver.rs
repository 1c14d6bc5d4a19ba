//! The volume lifecycle manager. Composes the subvolume primitives, the
//! quota policy and the block-file backer under a rollback stack, one
//! public operation per platform request.

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use derive_builder::Builder;
use slog::Logger;

use super::revert::Revert;
use super::{
    blockfile, quota, rollback_path, validate_snapshot_name, ContentType, Error, Result, Volume,
    VolumeType,
};
use crate::subvolume::{join_rel, BtrfsOpen3, CancelToken, SubvolumeEngine};
use crate::GlobalLogger;

/// Fills a freshly created volume with its initial payload. Receives the
/// mount path, or the block file path for block content.
pub type Filler<'a> = &'a dyn Fn(&Path) -> std::io::Result<()>;

/// Options of [`Driver::copy_volume`].
#[derive(Builder, Clone, Debug, Default)]
#[builder(default, setter(into))]
pub struct CopyOptions {
    /// Copy the snapshots of the source along with the main volume.
    pub snapshots: bool,
    /// Refresh an existing destination instead of creating a fresh copy.
    pub refresh: bool,
    /// In refresh mode, restrict the snapshots considered for transfer.
    /// `None` copies every snapshot missing on the destination.
    pub refresh_snapshots: Option<Vec<String>>,
}

/// The copy-on-write volume engine of one storage pool.
///
/// The platform serializes operations per volume before calling in, the
/// driver assumes exclusive access to a volume for the duration of a call.
pub struct Driver<E: SubvolumeEngine> {
    engine: E,
    pool: String,
    pool_dir: PathBuf,
    mount_options: Vec<String>,
    logger: Logger,
}

/// Driver over the production `btrfs(8)` engine.
pub type BtrfsDriver = Driver<BtrfsOpen3>;

impl<E: SubvolumeEngine> Driver<E> {
    pub fn new<S: Into<String>, P: Into<PathBuf>>(pool: S, pool_dir: P, engine: E) -> Driver<E> {
        let pool = pool.into();
        let pool_dir = pool_dir.into();
        let logger = GlobalLogger::get().new(o!("firn_module" => "volume", "pool" => pool.clone()));
        let mount_options = mount_options_of(&pool_dir);

        Driver { engine, pool, pool_dir, mount_options, logger }
    }

    /// Overrides the detected mount options of the pool. Useful for
    /// embedders that mount pools themselves.
    pub fn with_mount_options(mut self, options: Vec<String>) -> Self {
        self.mount_options = options;
        self
    }

    pub fn engine(&self) -> &E { &self.engine }

    pub fn pool(&self) -> &str { &self.pool }

    pub fn pool_dir(&self) -> &Path { &self.pool_dir }

    pub fn logger(&self) -> &Logger { &self.logger }

    /// Pools mounted with transparent compression keep CoW on block files,
    /// the no-CoW attribute would defeat the compression.
    fn compression_enabled(&self) -> bool {
        self.mount_options.iter().any(|o| o.starts_with("compress"))
    }

    /// A volume handle in this pool.
    pub fn volume(
        &self,
        vol_type: VolumeType,
        content: ContentType,
        name: &str,
        config: HashMap<String, String>,
    ) -> Result<Volume> {
        Volume::new(self.pool.clone(), self.pool_dir.clone(), vol_type, content, name, config)
    }

    pub fn has_volume(&self, vol: &Volume) -> Result<bool> {
        Ok(self.engine.exists(&vol.mount_path())?)
    }

    /// Names of the volumes of one type in this pool.
    pub fn list_volumes(&self, vol_type: VolumeType) -> Result<Vec<String>> {
        let dir = self.pool_dir.join(vol_type.as_ref());
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        for entry in fs::read_dir(dir)? {
            if let Some(name) = entry?.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Snapshot short names of a volume, oldest first. The pool's internal
    /// subvolume id is the ground truth for creation order.
    pub fn volume_snapshots(&self, vol: &Volume) -> Result<Vec<String>> {
        let dir = vol.snapshots_path();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = match entry.file_name().to_str() {
                Some(name) => name.to_string(),
                None => continue,
            };
            let id = self.engine.subvolume_id(&entry.path())?;
            entries.push((id, name));
        }
        entries.sort();

        Ok(entries.into_iter().map(|(_, name)| name).collect())
    }

    /// Referenced bytes of the volume as accounted by its qgroup.
    pub fn volume_usage(&self, vol: &Volume) -> Result<u64> {
        Ok(*self.engine.qgroup(&vol.mount_path())?.referenced())
    }

    /// Location of the raw image of a block-content volume.
    pub fn volume_disk_path(&self, vol: &Volume) -> Result<PathBuf> {
        match vol.content() {
            ContentType::Block | ContentType::Iso => Ok(vol.block_file_path()),
            ContentType::Filesystem => Err(Error::NotSupported(
                "filesystem volumes have no disk file".to_string(),
            )),
        }
    }

    pub fn create_volume(
        &self,
        vol: &Volume,
        filler: Option<Filler>,
        cancel: &CancelToken,
    ) -> Result<()> {
        cancel.check()?;
        info!(self.logger, "creating volume";
              "volume" => %vol, "content" => vol.content().as_ref());

        let path = vol.mount_path();
        if self.engine.exists(&path)? {
            return Err(Error::AlreadyExists(vol.name().clone()));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut revert = Revert::new();

        self.engine.create(&path)?;
        {
            let engine = &self.engine;
            let path = path.clone();
            revert.add("delete created root subvolume", move || {
                engine.delete_recursive(&path).map_err(Error::from)
            });
        }

        match vol.content() {
            ContentType::Block | ContentType::Iso => {
                // The attribute has to be on before the image exists so the
                // file inherits it.
                if !self.compression_enabled() {
                    self.engine.set_nocow(&path)?;
                }

                let block = vol.block_file_path();
                let mut filled = false;
                if let Some(fill) = filler {
                    cancel.check()?;
                    fill(&block)?;
                    filled = true;
                }

                if *vol.content() == ContentType::Block {
                    if let Some(size) = vol.size_bytes()? {
                        if !block.exists() {
                            blockfile::create_sparse(&block, size)?;
                        } else {
                            // The filler may legitimately have produced an
                            // image past the configured size.
                            match blockfile::ensure_size(&block, size, false) {
                                Ok(_) | Err(Error::CannotBeShrunk(_)) => {},
                                Err(e) => return Err(e),
                            }
                        }
                    }

                    if *vol.vol_type() == VolumeType::VirtualMachine && filled {
                        blockfile::move_gpt_alt_header(&self.logger, &block)?;
                    }
                }
            },
            ContentType::Filesystem => {
                if let Some(fill) = filler {
                    cancel.check()?;
                    fill(&path)?;
                }
                if let Some(size) = vol.size_bytes()? {
                    self.apply_quota(vol, Some(size), false)?;
                }
            },
        }

        let mut perms = fs::metadata(&path)?.permissions();
        perms.set_mode(0o711);
        fs::set_permissions(&path, perms)?;

        if *vol.vol_type() == VolumeType::Image {
            self.engine.set_readonly(&path, true)?;
        }

        revert.success();
        Ok(())
    }

    /// Creates `dst` as a copy of `src`, optionally with its snapshots. In
    /// refresh mode the existing destination root is replaced and only
    /// missing (or explicitly requested) snapshots are copied.
    pub fn copy_volume(
        &self,
        dst: &Volume,
        src: &Volume,
        opts: &CopyOptions,
        cancel: &CancelToken,
    ) -> Result<()> {
        cancel.check()?;
        info!(self.logger, "copying volume";
              "src" => %src, "dst" => %dst, "refresh" => opts.refresh);

        let src_path = src.mount_path();
        let dst_path = dst.mount_path();
        let graph = self.engine.subvolumes_metadata(&src_path)?;

        let mut revert = Revert::new();

        if self.engine.exists(&dst_path)? {
            if opts.refresh {
                self.engine.delete_recursive(&dst_path)?;
            } else {
                return Err(Error::AlreadyExists(dst.name().clone()));
            }
        }
        if let Some(parent) = dst_path.parent() {
            fs::create_dir_all(parent)?;
        }

        self.engine.snapshot_recursive(&src_path, &dst_path, false)?;
        {
            let engine = &self.engine;
            let path = dst_path.clone();
            revert.add("delete copied root subvolume", move || {
                engine.delete_recursive(&path).map_err(Error::from)
            });
        }

        // Restore read-only leaves inward; the new root stays writable.
        for sub in graph.iter().rev() {
            if !sub.is_root() && sub.readonly {
                self.engine.set_readonly(&join_rel(&dst_path, sub.rel_path()), true)?;
            }
        }

        if let Some(size) = dst.size_bytes()? {
            self.apply_quota(dst, Some(size), false)?;
        }

        if opts.snapshots {
            let src_snaps = self.volume_snapshots(src)?;
            if !src_snaps.is_empty() {
                fs::create_dir_all(dst.snapshots_path())?;

                for snap in &src_snaps {
                    if opts.refresh {
                        if self.engine.exists(&dst.snapshot(snap)?.mount_path())? {
                            continue;
                        }
                        if let Some(only) = &opts.refresh_snapshots {
                            if !only.contains(snap) {
                                continue;
                            }
                        }
                    }

                    cancel.check()?;
                    let snap_src = src.snapshot(snap)?.mount_path();
                    let snap_dst = dst.snapshot(snap)?.mount_path();
                    self.engine.snapshot_recursive(&snap_src, &snap_dst, true)?;
                    {
                        let engine = &self.engine;
                        let path = snap_dst.clone();
                        revert.add("delete copied snapshot", move || {
                            engine.delete_recursive(&path).map_err(Error::from)
                        });
                    }
                }
            }
        }

        revert.success();
        Ok(())
    }

    pub fn delete_volume(&self, vol: &Volume) -> Result<()> {
        let snaps = self.volume_snapshots(vol)?;
        if !snaps.is_empty() {
            return Err(Error::InUse(format!(
                "volume \"{}\" is still in use: {} snapshots exist",
                vol.name(),
                snaps.len()
            )));
        }

        info!(self.logger, "deleting volume"; "volume" => %vol);

        let path = vol.mount_path();
        if path.exists() {
            // Drop the qgroup first, its key is gone with the subvolume.
            if self.engine.qgroup(&path).is_ok() {
                if let Err(e) = self.engine.qgroup_destroy(&path) {
                    debug!(self.logger, "failed to destroy qgroup"; "error" => %e);
                }
            }

            if self.engine.exists(&path)? {
                self.engine.delete_recursive(&path)?;
            } else {
                fs::remove_dir_all(&path)?;
            }
        }

        // Garbage-collect the snapshots directory once it is empty.
        let snap_dir = vol.snapshots_path();
        if snap_dir.exists() {
            let _ = fs::remove_dir(&snap_dir);
        }

        Ok(())
    }

    /// Takes the snapshot described by `snap` (a `parent/name` volume) of
    /// its parent volume.
    pub fn create_volume_snapshot(&self, snap: &Volume) -> Result<()> {
        let parent = match snap.parent() {
            Some(parent) => parent,
            None => return Err(Error::InvalidName(snap.name().clone())),
        };

        info!(self.logger, "creating volume snapshot"; "snapshot" => %snap);

        let snap_path = snap.mount_path();
        if self.engine.exists(&snap_path)? {
            return Err(Error::AlreadyExists(snap.name().clone()));
        }

        let mut revert = Revert::new();

        let snap_dir = snap.snapshots_path();
        if !snap_dir.exists() {
            fs::create_dir_all(&snap_dir)?;
            {
                let dir = snap_dir.clone();
                revert.add("remove created snapshots directory", move || {
                    fs::remove_dir(&dir).map_err(Error::from)
                });
            }
        }

        self.engine.snapshot_recursive(&parent.mount_path(), &snap_path, true)?;

        revert.success();
        Ok(())
    }

    pub fn delete_volume_snapshot(&self, snap: &Volume) -> Result<()> {
        if !snap.is_snapshot() {
            return Err(Error::InvalidName(snap.name().clone()));
        }

        info!(self.logger, "deleting volume snapshot"; "snapshot" => %snap);

        let path = snap.mount_path();
        if path.exists() {
            self.engine.delete_recursive(&path)?;
        }

        let parent_dir = snap.snapshots_path();
        if parent_dir.exists() {
            let _ = fs::remove_dir(&parent_dir);
        }

        Ok(())
    }

    /// Rolls the live volume back to one of its snapshots. The live root is
    /// renamed aside as the rollback anchor and only deleted after the
    /// restored root is fully in place.
    pub fn restore_volume(&self, vol: &Volume, snap_name: &str) -> Result<()> {
        validate_snapshot_name(snap_name)?;

        let snap = vol.snapshot(snap_name)?;
        let snap_path = snap.mount_path();
        if !self.engine.exists(&snap_path)? {
            return Err(Error::NotFound(snap.name().clone()));
        }

        info!(self.logger, "restoring volume"; "volume" => %vol, "snapshot" => snap_name);

        let graph = self.engine.subvolumes_metadata(&snap_path)?;
        let vol_path = vol.mount_path();
        let aside = rollback_path(&vol_path);

        let mut revert = Revert::new();

        self.engine.rename(&vol_path, &aside)?;
        {
            let engine = &self.engine;
            let (from, to) = (aside.clone(), vol_path.clone());
            revert.add("restore original root subvolume", move || {
                engine.rename(&from, &to).map_err(Error::from)
            });
        }

        self.engine.snapshot_recursive(&snap_path, &vol_path, false)?;
        {
            let engine = &self.engine;
            let path = vol_path.clone();
            revert.add("delete restored root subvolume", move || {
                engine.delete_recursive(&path).map_err(Error::from)
            });
        }

        for sub in graph.iter().rev() {
            if !sub.is_root() && sub.readonly {
                self.engine.set_readonly(&join_rel(&vol_path, sub.rel_path()), true)?;
            }
        }

        revert.success();

        // Only gone once the restore has committed.
        self.engine.delete_recursive(&aside)?;
        Ok(())
    }

    /// Renames a volume together with its snapshots directory.
    pub fn rename_volume(&self, vol: &Volume, new_name: &str) -> Result<Volume> {
        if vol.is_snapshot() || new_name.contains('/') {
            return Err(Error::InvalidName(new_name.to_string()));
        }

        let new_vol = vol.renamed(new_name)?;
        if self.engine.exists(&new_vol.mount_path())? {
            return Err(Error::AlreadyExists(new_name.to_string()));
        }

        info!(self.logger, "renaming volume"; "volume" => %vol, "new_name" => new_name);

        let mut revert = Revert::new();

        self.engine.rename(&vol.mount_path(), &new_vol.mount_path())?;
        {
            let engine = &self.engine;
            let (from, to) = (new_vol.mount_path(), vol.mount_path());
            revert.add("restore volume name", move || {
                engine.rename(&from, &to).map_err(Error::from)
            });
        }

        let old_snaps = vol.snapshots_path();
        if old_snaps.exists() {
            self.engine.rename(&old_snaps, &new_vol.snapshots_path())?;
        }

        revert.success();
        Ok(new_vol)
    }

    /// Applies `size` changes from a config update. Everything else about a
    /// volume is free-form for the platform.
    pub fn update_volume(&self, vol: &Volume, changed: &HashMap<String, String>) -> Result<()> {
        if let Some(size) = changed.get("size") {
            let bytes = if size.is_empty() {
                None
            } else {
                Some(
                    crate::utils::parse_size(size)
                        .map_err(|_| Error::InvalidSize(size.to_string()))?,
                )
            };
            self.set_volume_quota(vol, bytes, false)?;
        }
        Ok(())
    }

    /// Applies a size limit. Routed by content type: block volumes resize
    /// their image (growing only), filesystem volumes get a referenced
    /// quota. `None` (and zero) clears the quota on filesystem volumes and
    /// is a no-op for block.
    pub fn set_volume_quota(
        &self,
        vol: &Volume,
        size: Option<u64>,
        allow_unsafe_resize: bool,
    ) -> Result<()> {
        self.apply_quota(vol, size, allow_unsafe_resize)
    }

    fn apply_quota(&self, vol: &Volume, size: Option<u64>, allow_unsafe_resize: bool) -> Result<()> {
        let size = match size {
            Some(0) => None,
            other => other,
        };
        let path = vol.mount_path();

        match vol.content() {
            ContentType::Iso => Ok(()),
            ContentType::Block => {
                let bytes = match size {
                    Some(bytes) => bytes,
                    None => return Ok(()),
                };
                let block = vol.block_file_path();
                if !block.exists() {
                    return Ok(());
                }

                let changed = blockfile::ensure_size(&block, bytes, allow_unsafe_resize)?;
                if changed && *vol.vol_type() == VolumeType::VirtualMachine {
                    blockfile::move_gpt_alt_header(&self.logger, &block)?;
                }
                Ok(())
            },
            ContentType::Filesystem => match size {
                None => quota::clear_limit(&self.engine, &path),
                Some(mut bytes) => {
                    // A VM's image shares the subvolume with its config
                    // filesystem; keep the image out of the accounting.
                    if *vol.vol_type() == VolumeType::VirtualMachine {
                        let block = vol.block_file_path();
                        if block.exists() {
                            bytes += blockfile::disk_size(&block)?;
                        }
                    }
                    quota::set_limit(&self.engine, &path, bytes)
                },
            },
        }
    }
}

/// Mount options of the filesystem `dir` lives on, best-effort.
fn mount_options_of(dir: &Path) -> Vec<String> {
    let mounts = match fs::read_to_string("/proc/self/mounts") {
        Ok(mounts) => mounts,
        Err(_) => return Vec::new(),
    };

    let mut best: Option<(usize, Vec<String>)> = None;
    for line in mounts.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            continue;
        }

        let target = Path::new(fields[1]);
        if dir.starts_with(target) {
            let depth = target.components().count();
            if best.as_ref().map(|(d, _)| depth >= *d).unwrap_or(true) {
                best = Some((depth, fields[3].split(',').map(String::from).collect()));
            }
        }
    }

    best.map(|(_, options)| options).unwrap_or_default()
}
