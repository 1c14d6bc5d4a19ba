//! Quota group policy on top of the qgroup primitives: enable accounting
//! on demand, create missing qgroups, apply referenced limits.

use std::path::Path;

use super::Result;
use crate::subvolume::{Error as SubError, Qgroup, SubvolumeEngine};

/// The qgroup tracking `path`, creating whatever is missing on the way:
/// quota accounting is enabled pool-wide on first use (and never disabled
/// again), and a missing qgroup is created keyed on the subvolume id.
pub(crate) fn ensure_qgroup<E: SubvolumeEngine>(engine: &E, path: &Path) -> Result<Qgroup> {
    match engine.qgroup(path) {
        Ok(qgroup) => Ok(qgroup),
        Err(SubError::NoQuota) => {
            engine.quota_enable(path)?;
            match engine.qgroup(path) {
                Ok(qgroup) => Ok(qgroup),
                Err(SubError::NoQgroup) => {
                    engine.qgroup_create(path)?;
                    Ok(engine.qgroup(path)?)
                },
                Err(e) => Err(e.into()),
            }
        },
        Err(SubError::NoQgroup) => {
            engine.qgroup_create(path)?;
            Ok(engine.qgroup(path)?)
        },
        Err(e) => Err(e.into()),
    }
}

/// Applies a referenced limit. The exclusive limit is unconditionally
/// cleared, accounting for filesystem volumes is by referenced bytes.
pub(crate) fn set_limit<E: SubvolumeEngine>(engine: &E, path: &Path, bytes: u64) -> Result<()> {
    ensure_qgroup(engine, path)?;
    engine.qgroup_limit_referenced(path, Some(bytes))?;
    engine.qgroup_limit_exclusive(path, None)?;
    Ok(())
}

/// Clears both limits. Quietly succeeds when quotas were never enabled or
/// the subvolume has no qgroup.
pub(crate) fn clear_limit<E: SubvolumeEngine>(engine: &E, path: &Path) -> Result<()> {
    match engine.qgroup(path) {
        Ok(_) => {
            engine.qgroup_limit_referenced(path, None)?;
            engine.qgroup_limit_exclusive(path, None)?;
            Ok(())
        },
        Err(SubError::NoQuota) | Err(SubError::NoQgroup) => Ok(()),
        Err(e) => Err(e.into()),
    }
}
