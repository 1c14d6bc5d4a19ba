//! The two control operations the `btrfs` tool does not expose: the no-CoW
//! file attribute and re-imprinting the received UUID of a subvolume.

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use uuid::Uuid;

const FS_IOC_GETFLAGS: libc::c_ulong = 0x8008_6601;
const FS_IOC_SETFLAGS: libc::c_ulong = 0x4008_6602;
const FS_NOCOW_FL: libc::c_long = 0x0080_0000;

// _IOWR(BTRFS_IOCTL_MAGIC, 37, struct btrfs_ioctl_received_subvol_args)
const BTRFS_IOC_SET_RECEIVED_SUBVOL: libc::c_ulong = 0xC0C8_9425;

#[repr(C)]
struct BtrfsIoctlTimespec {
    sec: u64,
    nsec: u32,
}

#[repr(C)]
struct BtrfsIoctlReceivedSubvolArgs {
    uuid: [u8; 16],
    stransid: u64,
    rtransid: u64,
    stime: BtrfsIoctlTimespec,
    rtime: BtrfsIoctlTimespec,
    flags: u64,
    reserved: [u64; 16],
}

/// Sets the no-CoW attribute on a directory so that files created inside
/// inherit it. Must run before the block file exists.
pub(crate) fn set_nocow(path: &Path) -> io::Result<()> {
    let file = File::open(path)?;
    let fd = file.as_raw_fd();

    let mut flags: libc::c_long = 0;
    if unsafe { libc::ioctl(fd, FS_IOC_GETFLAGS, &mut flags) } != 0 {
        return Err(io::Error::last_os_error());
    }

    flags |= FS_NOCOW_FL;
    if unsafe { libc::ioctl(fd, FS_IOC_SETFLAGS, &flags) } != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// Imprints `uuid` as the received UUID of the subvolume at `path`.
pub(crate) fn set_received_uuid(path: &Path, uuid: &str) -> io::Result<()> {
    let parsed = Uuid::parse_str(uuid)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let file = File::open(path)?;
    let mut args = BtrfsIoctlReceivedSubvolArgs {
        uuid: *parsed.as_bytes(),
        stransid: 0,
        rtransid: 0,
        stime: BtrfsIoctlTimespec { sec: 0, nsec: 0 },
        rtime: BtrfsIoctlTimespec { sec: 0, nsec: 0 },
        flags: 0,
        reserved: [0; 16],
    };

    if unsafe { libc::ioctl(file.as_raw_fd(), BTRFS_IOC_SET_RECEIVED_SUBVOL, &mut args) } != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}
