//! In-memory [`SubvolumeEngine`] used by the scenario tests: subvolumes
//! are plain directories tracked in a registry, send streams are
//! length-prefixed serialized trees. The engine enforces the same rules
//! the pool does (read-only senders, no deleting populated subvolumes, no
//! creating below a read-only parent, the read-write flip clearing the
//! received UUID) so the drivers are exercised against realistic
//! constraints without a real pool.
#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use slog::Logger;
use uuid::Uuid;

use libfirn::subvolume::{CancelToken, Error, Qgroup, Result, SubvolumeEngine};
use libfirn::volume::Driver;
use libfirn::GlobalLogger;

pub struct MemoryEngine {
    logger: Logger,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    subvols: HashMap<PathBuf, Subvol>,
    quotas_enabled: bool,
    qgroups: HashMap<u64, Limits>,
}

struct Subvol {
    id: u64,
    uuid: String,
    received_uuid: Option<String>,
    readonly: bool,
}

#[derive(Clone, Copy, Default)]
struct Limits {
    referenced: Option<u64>,
    exclusive: Option<u64>,
}

#[derive(Serialize, Deserialize)]
enum TreeEntry {
    Dir,
    File(Vec<u8>),
}

#[derive(Serialize, Deserialize)]
struct Blob {
    name: String,
    uuid: String,
    entries: Vec<(String, TreeEntry)>,
}

impl MemoryEngine {
    pub fn new() -> MemoryEngine {
        MemoryEngine {
            logger: GlobalLogger::get()
                .new(slog::o!("firn_module" => "subvolume", "subvolume_impl" => "memory")),
            state: Mutex::new(State { next_id: 256, ..State::default() }),
        }
    }

    /// The referenced limit currently applied to the subvolume, if any.
    pub fn referenced_limit(&self, path: &Path) -> Option<u64> {
        let state = self.state.lock().unwrap();
        let id = state.subvols.get(path)?.id;
        state.qgroups.get(&id)?.referenced
    }
}

fn fail(what: &str) -> Error {
    Error::CommandFailed("mock btrfs".to_string(), what.to_string())
}

fn nearest_enclosing<'a>(state: &'a State, path: &Path) -> Option<&'a Subvol> {
    path.ancestors().skip(1).find_map(|anc| state.subvols.get(anc))
}

fn collect_tree(state: &State, root: &Path) -> io::Result<Vec<(String, TreeEntry)>> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let rel = path
                .strip_prefix(root)
                .unwrap()
                .to_string_lossy()
                .into_owned();

            if path.is_dir() {
                out.push((rel, TreeEntry::Dir));
                // A nested subvolume is not part of this tree; only its
                // placeholder directory is.
                if !state.subvols.contains_key(&path) {
                    stack.push(path);
                }
            } else {
                out.push((rel, TreeEntry::File(fs::read(&path)?)));
            }
        }
    }

    Ok(out)
}

fn materialize(root: &Path, entries: &[(String, TreeEntry)]) -> io::Result<()> {
    fs::create_dir(root)?;
    for (rel, entry) in entries {
        match entry {
            TreeEntry::Dir => fs::create_dir(root.join(rel))?,
            TreeEntry::File(bytes) => fs::write(root.join(rel), bytes)?,
        }
    }
    Ok(())
}

impl SubvolumeEngine for MemoryEngine {
    fn logger(&self) -> &Logger { &self.logger }

    fn create(&self, path: &Path) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.subvols.contains_key(path) || path.exists() {
            return Err(fail("target exists"));
        }
        if nearest_enclosing(&state, path).map(|s| s.readonly).unwrap_or(false) {
            return Err(fail("parent subvolume is read-only"));
        }

        fs::create_dir(path)?;
        let id = state.next_id;
        state.next_id += 1;
        state.subvols.insert(
            path.to_path_buf(),
            Subvol { id, uuid: Uuid::new_v4().to_string(), received_uuid: None, readonly: false },
        );
        if state.quotas_enabled {
            state.qgroups.insert(id, Limits::default());
        }
        Ok(())
    }

    fn delete(&self, path: &Path) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.subvols.contains_key(path) {
            return Err(Error::NotSubvolume(path.to_path_buf()));
        }
        if state.subvols.keys().any(|k| k != path && k.starts_with(path)) {
            return Err(fail("subvolume has nested subvolumes"));
        }
        if nearest_enclosing(&state, path).map(|s| s.readonly).unwrap_or(false) {
            return Err(fail("parent subvolume is read-only"));
        }

        fs::remove_dir_all(path)?;
        state.subvols.remove(path);
        Ok(())
    }

    fn snapshot_one(&self, src: &Path, dst: &Path, readonly: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.subvols.contains_key(src) {
            return Err(Error::NotSubvolume(src.to_path_buf()));
        }
        if state.subvols.contains_key(dst) || dst.exists() {
            return Err(fail("snapshot target exists"));
        }
        if nearest_enclosing(&state, dst).map(|s| s.readonly).unwrap_or(false) {
            return Err(fail("parent subvolume is read-only"));
        }

        let entries = collect_tree(&state, src)?;
        materialize(dst, &entries)?;

        let id = state.next_id;
        state.next_id += 1;
        state.subvols.insert(
            dst.to_path_buf(),
            Subvol { id, uuid: Uuid::new_v4().to_string(), received_uuid: None, readonly },
        );
        if state.quotas_enabled {
            state.qgroups.insert(id, Limits::default());
        }
        Ok(())
    }

    fn exists(&self, path: &Path) -> Result<bool> {
        Ok(self.state.lock().unwrap().subvols.contains_key(path))
    }

    fn is_readonly(&self, path: &Path) -> Result<bool> {
        let state = self.state.lock().unwrap();
        state
            .subvols
            .get(path)
            .map(|s| s.readonly)
            .ok_or_else(|| Error::NotSubvolume(path.to_path_buf()))
    }

    fn set_readonly(&self, path: &Path, readonly: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let sub = state
            .subvols
            .get_mut(path)
            .ok_or_else(|| Error::NotSubvolume(path.to_path_buf()))?;

        // The pool clears the receive lineage on the read-write flip.
        if sub.readonly && !readonly {
            sub.received_uuid = None;
        }
        sub.readonly = readonly;
        Ok(())
    }

    fn uuid(&self, path: &Path) -> Result<String> {
        let state = self.state.lock().unwrap();
        state
            .subvols
            .get(path)
            .map(|s| s.uuid.clone())
            .ok_or_else(|| Error::NotSubvolume(path.to_path_buf()))
    }

    fn received_uuid(&self, path: &Path) -> Result<Option<String>> {
        let state = self.state.lock().unwrap();
        state
            .subvols
            .get(path)
            .map(|s| s.received_uuid.clone())
            .ok_or_else(|| Error::NotSubvolume(path.to_path_buf()))
    }

    fn set_received_uuid(&self, path: &Path, uuid: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let sub = state
            .subvols
            .get_mut(path)
            .ok_or_else(|| Error::NotSubvolume(path.to_path_buf()))?;
        sub.received_uuid = Some(uuid.to_string());
        Ok(())
    }

    fn subvolume_id(&self, path: &Path) -> Result<u64> {
        let state = self.state.lock().unwrap();
        state
            .subvols
            .get(path)
            .map(|s| s.id)
            .ok_or_else(|| Error::NotSubvolume(path.to_path_buf()))
    }

    fn list_subvolumes(&self, root: &Path) -> Result<Vec<(u64, String)>> {
        let state = self.state.lock().unwrap();
        if !state.subvols.contains_key(root) {
            return Err(Error::NotSubvolume(root.to_path_buf()));
        }

        Ok(state
            .subvols
            .iter()
            .filter(|(k, _)| *k != root && k.starts_with(root))
            .map(|(k, v)| {
                (v.id, k.strip_prefix(root).unwrap().to_string_lossy().into_owned())
            })
            .collect())
    }

    fn set_nocow(&self, _path: &Path) -> Result<()> { Ok(()) }

    fn send(
        &self,
        path: &Path,
        parent: Option<&Path>,
        out: &mut dyn Write,
        cancel: &CancelToken,
        mut progress: Option<&mut dyn FnMut(u64)>,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let json = {
            let state = self.state.lock().unwrap();
            let sub = state
                .subvols
                .get(path)
                .ok_or_else(|| Error::NotSubvolume(path.to_path_buf()))?;
            if !sub.readonly {
                return Err(fail("subvolume is not read-only"));
            }
            if let Some(parent) = parent {
                if !state.subvols.contains_key(parent) {
                    return Err(Error::NotSubvolume(parent.to_path_buf()));
                }
            }

            let blob = Blob {
                name: path.file_name().unwrap().to_string_lossy().into_owned(),
                uuid: sub.uuid.clone(),
                entries: collect_tree(&state, path)?,
            };
            serde_json::to_vec(&blob).map_err(|e| fail(&e.to_string()))?
        };

        out.write_all(&(json.len() as u64).to_le_bytes())?;
        out.write_all(&json)?;
        if let Some(p) = progress.as_mut() {
            p(json.len() as u64 + 8);
        }
        Ok(())
    }

    fn receive(
        &self,
        dir: &Path,
        input: &mut dyn Read,
        cancel: &CancelToken,
        mut progress: Option<&mut dyn FnMut(u64)>,
    ) -> Result<PathBuf> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut len = [0u8; 8];
        input.read_exact(&mut len)?;
        let mut json = vec![0u8; u64::from_le_bytes(len) as usize];
        input.read_exact(&mut json)?;
        let blob: Blob = serde_json::from_slice(&json).map_err(|e| fail(&e.to_string()))?;

        let mut state = self.state.lock().unwrap();
        if nearest_enclosing(&state, &dir.join(&blob.name))
            .map(|s| s.readonly)
            .unwrap_or(false)
        {
            return Err(fail("receive target is below a read-only subvolume"));
        }

        let target = dir.join(&blob.name);
        if target.exists() || state.subvols.contains_key(&target) {
            return Err(fail("receive target exists"));
        }

        materialize(&target, &blob.entries)?;
        let id = state.next_id;
        state.next_id += 1;
        state.subvols.insert(
            target.clone(),
            Subvol {
                id,
                uuid: Uuid::new_v4().to_string(),
                received_uuid: Some(blob.uuid),
                readonly: true,
            },
        );
        if state.quotas_enabled {
            state.qgroups.insert(id, Limits::default());
        }

        if let Some(p) = progress.as_mut() {
            p(json.len() as u64 + 8);
        }
        Ok(target)
    }

    fn quota_enable(&self, _path: &Path) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.quotas_enabled = true;
        let ids: Vec<u64> = state.subvols.values().map(|s| s.id).collect();
        for id in ids {
            state.qgroups.entry(id).or_insert_with(Limits::default);
        }
        Ok(())
    }

    fn qgroup(&self, path: &Path) -> Result<Qgroup> {
        let state = self.state.lock().unwrap();
        if !state.quotas_enabled {
            return Err(Error::NoQuota);
        }
        let sub = state
            .subvols
            .get(path)
            .ok_or_else(|| Error::NotSubvolume(path.to_path_buf()))?;
        let limits = state.qgroups.get(&sub.id).ok_or(Error::NoQgroup)?;

        let referenced: u64 = collect_tree(&state, path)?
            .iter()
            .map(|(_, e)| match e {
                TreeEntry::File(bytes) => bytes.len() as u64,
                TreeEntry::Dir => 0,
            })
            .sum();

        Ok(Qgroup::new(
            format!("0/{}", sub.id),
            referenced,
            0,
            limits.referenced,
            limits.exclusive,
        ))
    }

    fn qgroup_create(&self, path: &Path) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.quotas_enabled {
            return Err(Error::NoQuota);
        }
        let id = state
            .subvols
            .get(path)
            .map(|s| s.id)
            .ok_or_else(|| Error::NotSubvolume(path.to_path_buf()))?;
        state.qgroups.entry(id).or_insert_with(Limits::default);
        Ok(())
    }

    fn qgroup_destroy(&self, path: &Path) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let id = state
            .subvols
            .get(path)
            .map(|s| s.id)
            .ok_or_else(|| Error::NotSubvolume(path.to_path_buf()))?;
        state.qgroups.remove(&id);
        Ok(())
    }

    fn qgroup_limit_referenced(&self, path: &Path, limit: Option<u64>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let id = state
            .subvols
            .get(path)
            .map(|s| s.id)
            .ok_or_else(|| Error::NotSubvolume(path.to_path_buf()))?;
        state.qgroups.get_mut(&id).ok_or(Error::NoQgroup)?.referenced = limit;
        Ok(())
    }

    fn qgroup_limit_exclusive(&self, path: &Path, limit: Option<u64>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let id = state
            .subvols
            .get(path)
            .map(|s| s.id)
            .ok_or_else(|| Error::NotSubvolume(path.to_path_buf()))?;
        state.qgroups.get_mut(&id).ok_or(Error::NoQgroup)?.exclusive = limit;
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        fs::rename(from, to)?;

        let keys: Vec<PathBuf> = state
            .subvols
            .keys()
            .filter(|k| k.starts_with(from))
            .cloned()
            .collect();
        for key in keys {
            let entry = state.subvols.remove(&key).unwrap();
            let rel = key.strip_prefix(from).unwrap();
            let rebased = if rel.as_os_str().is_empty() {
                to.to_path_buf()
            } else {
                to.join(rel)
            };
            state.subvols.insert(rebased, entry);
        }
        Ok(())
    }
}

/// A fresh pool on a temp directory.
pub fn pool(name: &str) -> (tempfile::TempDir, Driver<MemoryEngine>) {
    let dir = tempfile::Builder::new().prefix(name).tempdir().unwrap();
    let driver = Driver::new(name, dir.path(), MemoryEngine::new()).with_mount_options(Vec::new());
    (dir, driver)
}

pub fn write_file(path: &Path, contents: &[u8]) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, contents).unwrap();
}

pub fn read_file(path: &Path) -> Vec<u8> { fs::read(path).unwrap() }
