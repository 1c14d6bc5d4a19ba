//! Maintains the sparse raw image backing block-content volumes.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::process::Command;

use slog::Logger;

use super::{Error, Result};
use crate::subvolume;

// GPT signature at the start of LBA 1.
const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";
const GPT_SIGNATURE_OFFSET: u64 = 512;

/// Creates the sparse image file at its initial size.
pub(crate) fn create_sparse(path: &Path, size: u64) -> Result<()> {
    let file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.set_len(size)?;
    Ok(())
}

/// Grows the image to `size`, returning whether it changed. Shrinking is
/// refused unless the caller opted into unsafe resizing.
pub(crate) fn ensure_size(path: &Path, size: u64, allow_shrink: bool) -> Result<bool> {
    let current = fs::metadata(path)?.len();
    if current == size {
        return Ok(false);
    }
    if size < current && !allow_shrink {
        return Err(Error::CannotBeShrunk(path.to_path_buf()));
    }

    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(size)?;
    Ok(true)
}

/// Logical size of the image in bytes.
pub(crate) fn disk_size(path: &Path) -> Result<u64> { Ok(fs::metadata(path)?.len()) }

fn has_gpt(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    if file.metadata()?.len() < GPT_SIGNATURE_OFFSET + GPT_SIGNATURE.len() as u64 {
        return Ok(false);
    }
    file.seek(SeekFrom::Start(GPT_SIGNATURE_OFFSET))?;

    let mut signature = [0u8; 8];
    file.read_exact(&mut signature)?;
    Ok(&signature == GPT_SIGNATURE)
}

/// Relocates the alternate partition-table header to the new end of the
/// disk after a resize. Images without a GPT are left alone, and hosts
/// without the tooling are tolerated during initial fill.
pub(crate) fn move_gpt_alt_header(logger: &Logger, path: &Path) -> Result<()> {
    if !has_gpt(path)? {
        debug!(logger, "image has no GPT, not moving alternate header";
               "path" => format_args!("{:?}", path));
        return Ok(());
    }

    let mut c = Command::new("sgdisk");
    c.arg("--move-second-header").arg(path);
    debug!(logger, "executing"; "cmd" => format_args!("{:?}", c));

    match c.output() {
        Ok(out) if out.status.success() => Ok(()),
        Ok(out) => {
            Err(subvolume::Error::from_stderr("sgdisk --move-second-header", &out.stderr).into())
        },
        Err(ref e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(logger, "sgdisk not found, not moving alternate header");
            Ok(())
        },
        Err(e) => Err(e.into()),
    }
}
