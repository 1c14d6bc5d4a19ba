//! Send-stream plumbing. A send stream is self-delimiting: a 17 byte magic
//! header followed by `(len, cmd, crc, payload)` commands, terminated by an
//! end command. Receives off a shared connection must stop at exactly that
//! boundary or they would eat the head of the next stream.

use std::io::{self, Read, Write};

use super::{CancelToken, Error, Result};

pub(crate) const STREAM_MAGIC: &[u8; 13] = b"btrfs-stream\0";

const CMD_HEADER_LEN: usize = 10;
const CMD_END: u16 = 21;

/// Copies `input` to `out` until EOF, honoring cancellation and reporting
/// cumulative byte counts to `progress`.
pub(crate) fn copy_stream(
    input: &mut dyn Read,
    out: &mut dyn Write,
    cancel: &CancelToken,
    mut progress: Option<&mut dyn FnMut(u64)>,
) -> Result<u64> {
    let mut buf = [0u8; 64 * 1024];
    let mut total = 0u64;

    loop {
        cancel.check()?;
        let n = match input.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        out.write_all(&buf[..n])?;
        total += n as u64;
        if let Some(p) = progress.as_mut() {
            p(total);
        }
    }

    Ok(total)
}

/// Copies exactly one send stream from `input` to `out`, leaving the reader
/// positioned at the first byte after the stream.
pub(crate) fn copy_one_stream(
    input: &mut dyn Read,
    out: &mut dyn Write,
    cancel: &CancelToken,
    mut progress: Option<&mut dyn FnMut(u64)>,
) -> Result<u64> {
    let mut header = [0u8; 17];
    input.read_exact(&mut header)?;
    if &header[..STREAM_MAGIC.len()] != STREAM_MAGIC {
        return Err(Error::ParseError("bad send stream magic".to_string()));
    }
    out.write_all(&header)?;
    let mut total = header.len() as u64;

    loop {
        cancel.check()?;

        let mut cmd = [0u8; CMD_HEADER_LEN];
        input.read_exact(&mut cmd)?;
        out.write_all(&cmd)?;

        let len = u32::from_le_bytes([cmd[0], cmd[1], cmd[2], cmd[3]]) as u64;
        let op = u16::from_le_bytes([cmd[4], cmd[5]]);

        let copied = io::copy(&mut (&mut *input).take(len), out)?;
        if copied != len {
            return Err(Error::ParseError("truncated send stream".to_string()));
        }

        total += CMD_HEADER_LEN as u64 + len;
        if let Some(p) = progress.as_mut() {
            p(total);
        }

        if op == CMD_END {
            break;
        }
    }

    Ok(total)
}
