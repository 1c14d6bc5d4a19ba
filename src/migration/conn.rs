//! The byte stream the optimized migration runs over.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex};

/// A bidirectional byte stream with half-close framing.
///
/// Header frames are delimited by half-closing the writing side:
/// [`end_frame`](MigrationConn::end_frame) marks the end of the current
/// outgoing frame and the peer observes it as EOF until it acknowledges
/// the boundary with [`next_frame`](MigrationConn::next_frame). After the
/// header frames, raw send streams follow back-to-back; those are
/// self-delimiting and need no framing.
///
/// A transport without half-close must substitute a length-prefixed frame
/// and negotiate a feature flag to select it.
pub trait MigrationConn: Read + Write {
    /// Terminates the current outgoing frame.
    fn end_frame(&mut self) -> io::Result<()>;

    /// Acknowledges an observed frame boundary so reads can resume.
    fn next_frame(&mut self) -> io::Result<()>;

    /// Reads to the end of the current incoming frame and acknowledges the
    /// boundary.
    fn read_frame(&mut self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.read_to_end(&mut buf)?;
        self.next_frame()?;
        Ok(buf)
    }
}

enum Item {
    Data(Vec<u8>),
    FrameEnd,
}

#[derive(Default)]
struct ChannelState {
    items: VecDeque<Item>,
    closed: bool,
}

#[derive(Default)]
struct Channel {
    state: Mutex<ChannelState>,
    cond: Condvar,
}

impl Channel {
    fn push(&self, item: Item) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        state.items.push_back(item);
        self.cond.notify_all();
        Ok(())
    }

    fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        self.cond.notify_all();
    }
}

/// In-memory [`MigrationConn`] pair. Used by the test-suite and by
/// embedders moving volumes between pools of the same process.
pub struct LoopbackConn {
    rx: Arc<Channel>,
    tx: Arc<Channel>,
}

/// A connected pair of loopback streams; bytes written to one side are
/// read from the other.
pub fn loopback() -> (LoopbackConn, LoopbackConn) {
    let a = Arc::new(Channel::default());
    let b = Arc::new(Channel::default());

    (
        LoopbackConn { rx: Arc::clone(&a), tx: Arc::clone(&b) },
        LoopbackConn { rx: b, tx: a },
    )
}

impl Read for LoopbackConn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut state = self.rx.state.lock().unwrap();
        loop {
            match state.items.pop_front() {
                Some(Item::Data(mut data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    if n < data.len() {
                        state.items.push_front(Item::Data(data.split_off(n)));
                    }
                    return Ok(n);
                },
                Some(Item::FrameEnd) => {
                    // Sticky until acknowledged with `next_frame`.
                    state.items.push_front(Item::FrameEnd);
                    return Ok(0);
                },
                None if state.closed => return Ok(0),
                None => state = self.rx.cond.wait(state).unwrap(),
            }
        }
    }
}

impl Write for LoopbackConn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx.push(Item::Data(buf.to_vec()))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> { Ok(()) }
}

impl MigrationConn for LoopbackConn {
    fn end_frame(&mut self) -> io::Result<()> { self.tx.push(Item::FrameEnd) }

    fn next_frame(&mut self) -> io::Result<()> {
        let mut state = self.rx.state.lock().unwrap();
        loop {
            match state.items.front() {
                Some(Item::FrameEnd) => {
                    state.items.pop_front();
                    return Ok(());
                },
                Some(Item::Data(_)) => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "frame not drained before acknowledging the boundary",
                    ));
                },
                None if state.closed => return Ok(()),
                None => state = self.rx.cond.wait(state).unwrap(),
            }
        }
    }
}

impl Drop for LoopbackConn {
    fn drop(&mut self) { self.tx.close() }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::thread;

    #[test]
    fn frames_are_delimited_and_resumable() {
        let (mut a, mut b) = loopback();

        a.write_all(b"header").unwrap();
        a.end_frame().unwrap();
        a.write_all(b"payload").unwrap();

        assert_eq!(b"header".to_vec(), b.read_frame().unwrap());

        let mut payload = [0u8; 7];
        b.read_exact(&mut payload).unwrap();
        assert_eq!(b"payload", &payload);
    }

    #[test]
    fn drop_closes_the_stream() {
        let (mut a, mut b) = loopback();
        a.write_all(b"xy").unwrap();
        drop(a);

        let mut buf = Vec::new();
        b.read_to_end(&mut buf).unwrap();
        assert_eq!(b"xy".to_vec(), buf);
    }

    #[test]
    fn blocking_read_wakes_on_write() {
        let (mut a, mut b) = loopback();

        let reader = thread::spawn(move || {
            let mut buf = [0u8; 5];
            b.read_exact(&mut buf).unwrap();
            buf
        });

        a.write_all(b"hello").unwrap();
        assert_eq!(b"hello", &reader.join().unwrap());
    }
}
