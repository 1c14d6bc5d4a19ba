//! Shared receive-and-finalize machinery of the optimized migration target
//! and the optimized backup restore: streams land in a scratch directory
//! first and are swapped into place only once everything arrived, all
//! under one rollback stack.

use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use super::driver::Driver;
use super::revert::{Revert, RevertHook};
use super::{ContentType, Error, Result, Volume};
use crate::migration::MetadataHeader;
use crate::subvolume::{join_rel, CancelToken, Subvolume, SubvolumeEngine};

pub(crate) struct IncomingSet<'d, E: SubvolumeEngine> {
    driver: &'d Driver<E>,
    vol: Volume,
    scratch: PathBuf,
    revert: Revert<'d>,
    /// Received root per group; the empty name is the main volume.
    roots: HashMap<String, PathBuf>,
    order: Vec<String>,
    /// `(group, rel path, received uuid)`, re-imprinted after the rename.
    imprints: Vec<(String, String, String)>,
}

impl<'d, E: SubvolumeEngine> IncomingSet<'d, E> {
    pub(crate) fn new(driver: &'d Driver<E>, vol: &Volume, scratch: &Path) -> IncomingSet<'d, E> {
        IncomingSet {
            driver,
            vol: vol.clone(),
            scratch: scratch.to_path_buf(),
            revert: Revert::new(),
            roots: HashMap::new(),
            order: Vec::new(),
            imprints: Vec::new(),
        }
    }

    /// Receives the stream of one manifest record. The root of a group has
    /// to arrive before the nested records of that group.
    pub(crate) fn receive_one(
        &mut self,
        sub: &Subvolume,
        input: &mut dyn Read,
        cancel: &CancelToken,
    ) -> Result<()> {
        cancel.check()?;
        let engine = self.driver.engine();

        let dir = if sub.is_root() {
            let dir = self.scratch.join(group_dir(&sub.snapshot));
            fs::create_dir_all(&dir)?;
            dir
        } else {
            let root = self.roots.get(&sub.snapshot).ok_or_else(|| {
                Error::Protocol(format!(
                    "nested subvolume {} arrived before the root of its group",
                    sub.path
                ))
            })?;
            // The root stream left an empty placeholder directory where the
            // nested subvolume goes.
            let _ = fs::remove_dir(join_rel(root, sub.rel_path()));
            match Path::new(sub.rel_path()).parent() {
                Some(parent) if !parent.as_os_str().is_empty() => root.join(parent),
                _ => root.clone(),
            }
        };

        let received = engine.receive(&dir, input, cancel, None)?;

        if sub.is_root() {
            let path = received.clone();
            self.revert.add("delete received subvolume", move || {
                if engine.exists(&path)? {
                    engine.delete_recursive(&path)?;
                }
                Ok(())
            });
        }

        // Capture the lineage before the read-write flip clears it.
        let received_uuid = engine.received_uuid(&received)?.unwrap_or_default();
        engine.set_readonly(&received, false)?;
        self.imprints.push((sub.snapshot.clone(), sub.path.clone(), received_uuid));

        if sub.is_root() {
            if self.roots.insert(sub.snapshot.clone(), received).is_some() {
                return Err(Error::Protocol(format!(
                    "duplicate root subvolume for group {:?}",
                    sub.snapshot
                )));
            }
            self.order.push(sub.snapshot.clone());
        }

        Ok(())
    }

    /// True once at least one stream was received.
    pub(crate) fn has_received(&self) -> bool { !self.order.is_empty() }

    /// Swaps everything into place: optionally deletes the live root
    /// (refresh), renames the received roots to their destinations,
    /// re-imprints received UUIDs (the read-write transition cleared them,
    /// and the imprint has to happen after the final rename), restores
    /// read-only flags leaves inward and applies the size quota of
    /// filesystem volumes. Returns the rollback stack as a hook so an
    /// outer operation can still unwind the whole exchange.
    pub(crate) fn finalize(
        mut self,
        manifest: &MetadataHeader,
        refresh: bool,
    ) -> Result<RevertHook<'d>> {
        let engine = self.driver.engine();
        let vol_path = self.vol.mount_path();

        if refresh && engine.exists(&vol_path)? {
            engine.delete_recursive(&vol_path)?;
        }

        let mut finals: HashMap<String, PathBuf> = HashMap::new();
        for group in &self.order {
            let received = self.roots[group].clone();
            let dest = if group.is_empty() {
                vol_path.clone()
            } else {
                self.vol.snapshot(group)?.mount_path()
            };

            if engine.exists(&dest)? {
                engine.delete_recursive(&dest)?;
            } else if dest.exists() {
                fs::remove_dir_all(&dest)?;
            }
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }

            engine.rename(&received, &dest)?;
            {
                let path = dest.clone();
                self.revert.add("delete finalized subvolume", move || {
                    if engine.exists(&path)? {
                        engine.delete_recursive(&path)?;
                    }
                    Ok(())
                });
            }
            finals.insert(group.clone(), dest);
        }

        for (group, rel, uuid) in &self.imprints {
            if uuid.is_empty() {
                continue;
            }
            let root = finals
                .get(group)
                .ok_or_else(|| Error::Protocol(format!("no root received for group {:?}", group)))?;
            engine.set_received_uuid(&join_rel(root, rel.trim_start_matches('/')), uuid)?;
        }

        for sub in manifest.subvolumes.iter().rev() {
            if !sub.readonly {
                continue;
            }
            if let Some(root) = finals.get(&sub.snapshot) {
                engine.set_readonly(&join_rel(root, sub.rel_path()), true)?;
            }
        }

        if *self.vol.content() == ContentType::Filesystem {
            if let Some(size) = self.vol.size_bytes()? {
                self.driver.set_volume_quota(&self.vol, Some(size), false)?;
            }
        }

        Ok(self.revert.into_hook())
    }
}

fn group_dir(snapshot: &str) -> &str {
    if snapshot.is_empty() {
        "volume"
    } else {
        snapshot
    }
}
