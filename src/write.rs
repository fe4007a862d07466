//! Write path and commit protocol.
//!
//! Every write lands in exactly one target chosen at open time: the leased
//! write buffer, the writable mapping, or the file descriptor. Buffered bytes
//! become visible to readers only when a commit moves them into the mapping or
//! file and advances the commit position.

use std::fs::File;
use std::io::{self, IoSlice, Seek, SeekFrom, Write};
use std::sync::atomic::Ordering;

use crate::errors::{IoContext, MappedFileError, Result};
use crate::mapping::Region;
use crate::mmap::{Leased, MappedFile, WriteMode, WriteTarget};
use crate::retry::{retry_until_success, RetryExhausted};
use crate::utils::ensure_capacity;

impl MappedFile {
    /// Append `data` at the wrote position.
    ///
    /// # Errors
    ///
    /// - `WriteBeyond` if the data does not fit; positions are unchanged.
    /// - `WriteSessionEnded` if [`done_write`](MappedFile::done_write) already
    ///   returned the write buffer.
    /// - `InvalidMode` for read-only files.
    /// - `Io` if a descriptor write fails; the wrote position is unchanged.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        let _writer = self.writer.lock();
        self.write_locked(&[IoSlice::new(data)])
    }

    /// Append several buffers as one write. The wrote position moves by the
    /// total length, or not at all.
    ///
    /// # Errors
    ///
    /// Same as [`write`](MappedFile::write), checked against the total length.
    pub fn write_vectored(&self, bufs: &[IoSlice<'_>]) -> Result<usize> {
        let _writer = self.writer.lock();
        self.write_locked(bufs)
    }

    /// Write `data` at `offset`.
    ///
    /// When `offset` differs from the wrote position, pending buffered bytes
    /// are committed first and both positions jump to `offset`. Bytes past
    /// `offset` that were visible before stop being visible.
    ///
    /// # Errors
    ///
    /// Same as [`write`](MappedFile::write); a `WriteBeyond` leaves positions
    /// untouched. Also `CommitAborted` if committing pending bytes gave up.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<usize> {
        let _writer = self.writer.lock();
        self.ensure_writable()?;
        ensure_capacity(offset, data.len() as u64, self.len())?;
        if offset != self.wrote_position() {
            self.reposition(offset)?;
        }
        self.write_locked(&[IoSlice::new(data)])
    }

    /// Move buffered bytes into the mapping or file and advance the read
    /// boundary. Returns the commit position.
    ///
    /// In descriptor mode a failing drain is retried according to the file's
    /// [`RetryPolicy`](crate::RetryPolicy); the default retries every second
    /// until it succeeds, blocking the caller. Without a write buffer this
    /// only reports the wrote position.
    ///
    /// # Errors
    ///
    /// - `CommitAborted` if a bounded or cancelled policy gave up; the bytes
    ///   stay buffered for the next commit.
    /// - `NotMapped` if a failed resize left the file without a mapping.
    pub fn commit(&self) -> Result<u64> {
        match &self.target {
            WriteTarget::Buffered { sink, slot } => match slot.lock().as_mut() {
                Some(leased) => self.commit_leased(*sink, leased),
                None => Ok(self.wrote_position()),
            },
            _ => Ok(self.wrote_position()),
        }
    }

    /// Commit, then return the write buffer to its pool for good. Ends the
    /// write session: later writes fail with `WriteSessionEnded`.
    ///
    /// # Errors
    ///
    /// See [`commit`](MappedFile::commit). On error the buffer is kept.
    pub fn done_write(&self) -> Result<u64> {
        let WriteTarget::Buffered { sink, slot } = &self.target else {
            return Ok(self.wrote_position());
        };
        let mut slot = slot.lock();
        let Some(leased) = slot.as_mut() else {
            return Ok(self.wrote_position());
        };
        let position = self.commit_leased(*sink, leased)?;
        if let Some(leased) = slot.take() {
            leased.release();
        }
        log::debug!("{}: write session done at {position}", self.path.display());
        Ok(position)
    }

    pub(crate) fn commit_leased(&self, sink: WriteMode, leased: &mut Leased) -> Result<u64> {
        let start = self.commit_position.load(Ordering::Acquire);
        if leased.buf.is_empty() {
            return Ok(start);
        }
        match sink {
            WriteMode::Mapped => {
                let region = self.region.read();
                let region = writable_region(region.as_ref())?;
                ensure_capacity(start, leased.buf.len() as u64, region.len() as u64)?;
                #[allow(clippy::cast_possible_truncation)]
                let at = start as usize;
                // SAFETY: writable mapping (mapped sink), range checked above,
                // and it lies at or past the commit position, which readers
                // never cross.
                unsafe { region.copy_in(at, &leased.buf) };
            }
            WriteMode::Descriptor => self.drain(start, &leased.buf)?,
        }
        let end = start + leased.buf.len() as u64;
        leased.buf.clear();
        self.commit_position.store(end, Ordering::Release);
        log::trace!("{}: committed {start}..{end}", self.path.display());
        Ok(end)
    }

    /// Write `buf` through the descriptor, which sits at `start`, retrying per
    /// policy. Bytes accepted by an earlier attempt are not written again.
    fn drain(&self, start: u64, buf: &[u8]) -> Result<()> {
        let mut file = &self.file;
        let mut drained = 0;
        let attempt = || {
            while drained < buf.len() {
                match file.write(&buf[drained..]) {
                    Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                    Ok(n) => drained += n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        };
        retry_until_success(&self.retry, attempt).map_err(|RetryExhausted { attempts, last }| {
            // The next commit rewrites the whole buffer from the committed end.
            self.rewind(start);
            MappedFileError::CommitAborted {
                attempts,
                source: last,
            }
        })
    }

    fn write_locked(&self, bufs: &[IoSlice<'_>]) -> Result<usize> {
        self.ensure_writable()?;
        let position = self.wrote_position();
        let total: usize = bufs.iter().map(|b| b.len()).sum();
        ensure_capacity(position, total as u64, self.len())?;
        if total == 0 {
            return Ok(0);
        }

        match &self.target {
            WriteTarget::ReadOnly => {
                return Err(MappedFileError::InvalidMode("write on read-only file"))
            }
            WriteTarget::Buffered { slot, .. } => {
                let mut slot = slot.lock();
                let leased = slot.as_mut().ok_or(MappedFileError::WriteSessionEnded)?;
                for b in bufs {
                    leased.buf.extend_from_slice(b);
                }
                // Advanced under the buffer lock so a concurrent commit never
                // sees the commit position pass the wrote position.
                self.advance(position, total);
                return Ok(total);
            }
            WriteTarget::MappedDirect => {
                let region = self.region.read();
                let region = writable_region(region.as_ref())?;
                ensure_capacity(position, total as u64, region.len() as u64)?;
                #[allow(clippy::cast_possible_truncation)]
                let mut at = position as usize;
                for b in bufs {
                    // SAFETY: writable mapping (mapped direct target), range
                    // checked above and at or past the read boundary.
                    unsafe { region.copy_in(at, b) };
                    at += b.len();
                }
            }
            WriteTarget::Descriptor => {
                if let Err(e) = write_all_vectored(&self.file, bufs) {
                    // Drop whatever part of the batch reached the file.
                    self.rewind(position);
                    return Err(MappedFileError::Io {
                        op: "write",
                        source: e,
                    });
                }
            }
        }
        self.advance(position, total);
        Ok(total)
    }

    fn ensure_writable(&self) -> Result<()> {
        match &self.target {
            WriteTarget::ReadOnly => Err(MappedFileError::InvalidMode("write on read-only file")),
            WriteTarget::Buffered { slot, .. } if slot.lock().is_none() => {
                log::error!(
                    "{}: write after done_write, write buffer already returned",
                    self.path.display()
                );
                Err(MappedFileError::WriteSessionEnded)
            }
            _ => Ok(()),
        }
    }

    fn advance(&self, from: u64, n: usize) {
        self.wrote_position
            .store(from + n as u64, Ordering::Release);
    }

    /// Commit pending bytes and move both positions to `offset`.
    fn reposition(&self, offset: u64) -> Result<()> {
        self.commit()?;
        // Readers may be looking at bytes past `offset`; wait them out before
        // making those bytes writable again.
        let _exclusive = self.region.write();
        if self.writes_descriptor() {
            (&self.file).seek(SeekFrom::Start(offset)).op("seek")?;
        }
        self.wrote_position.store(offset, Ordering::Release);
        self.commit_position.store(offset, Ordering::Release);
        log::debug!("{}: repositioned to {offset}", self.path.display());
        Ok(())
    }

    fn rewind(&self, position: u64) {
        if let Err(e) = (&self.file).seek(SeekFrom::Start(position)) {
            log::error!("{}: seek back to {position}: {e}", self.path.display());
        }
    }
}

fn writable_region(region: Option<&Region>) -> Result<&Region> {
    match region {
        Some(r) if r.is_writable() => Ok(r),
        Some(_) => Err(MappedFileError::InvalidMode("mapping is not writable")),
        None => Err(MappedFileError::NotMapped),
    }
}

/// `write_vectored` until every byte of `bufs` is written.
fn write_all_vectored(mut file: &File, bufs: &[IoSlice<'_>]) -> io::Result<()> {
    let mut written = match file.write_vectored(bufs) {
        Ok(n) => n,
        Err(e) if e.kind() == io::ErrorKind::Interrupted => 0,
        Err(e) => return Err(e),
    };
    // Finish whatever a short writev left behind.
    for b in bufs {
        if written >= b.len() {
            written -= b.len();
            continue;
        }
        file.write_all(&b[written..])?;
        written = 0;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmap::OpenMode;
    use crate::pool::{BufferPool, VecPool};
    use std::sync::Arc;

    fn pool() -> Option<Arc<dyn BufferPool>> {
        Some(Arc::new(VecPool::new(64, 4)))
    }

    #[test]
    fn buffered_bytes_are_invisible_until_commit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let f = MappedFile::create(dir.path().join("a.seg"), 1024, WriteMode::Mapped, pool())
            .expect("create");
        assert_eq!(f.write(&[b'A'; 100]).expect("write"), 100);
        assert_eq!(f.wrote_position(), 100);
        assert_eq!(f.commit_position(), 0);

        let mut buf = [0u8; 64];
        assert!(matches!(
            f.read(0, &mut buf),
            Err(MappedFileError::ReadBeyond {
                offset: 0,
                boundary: 0
            })
        ));

        assert_eq!(f.commit().expect("commit"), 100);
        assert_eq!(f.read(0, &mut buf).expect("read"), 64);
        assert!(buf.iter().all(|&b| b == b'A'));
        assert_eq!(f.read(90, &mut buf).expect("short read"), 10);
        assert!(buf[..10].iter().all(|&b| b == b'A'));
    }

    #[test]
    fn second_commit_is_a_no_op() {
        let dir = tempfile::tempdir().expect("tempdir");
        let f = MappedFile::create(dir.path().join("b.seg"), 256, WriteMode::Descriptor, pool())
            .expect("create");
        f.write(b"0123456789").expect("write");
        assert_eq!(f.commit().expect("first"), 10);
        assert_eq!(f.commit().expect("second"), 10);
        assert_eq!(f.commit_position(), 10);
    }

    #[test]
    fn write_beyond_leaves_positions() {
        let dir = tempfile::tempdir().expect("tempdir");
        for mode in [WriteMode::Mapped, WriteMode::Descriptor] {
            for buffered in [true, false] {
                let name = format!("c-{mode:?}-{buffered}.seg");
                let p = if buffered { pool() } else { None };
                let f = MappedFile::create(dir.path().join(name), 16, mode, p).expect("create");
                f.write(b"0123456789").expect("fits");
                let err = f.write(b"0123456789").unwrap_err();
                assert!(matches!(
                    err,
                    MappedFileError::WriteBeyond {
                        position: 10,
                        len: 10,
                        capacity: 16
                    }
                ));
                assert_eq!(f.wrote_position(), 10);
                let err = f
                    .write_vectored(&[IoSlice::new(b"abc"), IoSlice::new(b"defg")])
                    .unwrap_err();
                assert!(matches!(err, MappedFileError::WriteBeyond { len: 7, .. }));
                assert_eq!(f.wrote_position(), 10);
            }
        }
    }

    #[test]
    fn vectored_write_moves_position_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        for mode in [WriteMode::Mapped, WriteMode::Descriptor] {
            let f = MappedFile::create(dir.path().join(format!("v-{mode:?}.seg")), 64, mode, None)
                .expect("create");
            let n = f
                .write_vectored(&[IoSlice::new(b"head|"), IoSlice::new(b""), IoSlice::new(b"body")])
                .expect("writev");
            assert_eq!(n, 9);
            assert_eq!(f.wrote_position(), 9);
            let mut buf = [0u8; 9];
            assert_eq!(f.read(0, &mut buf).expect("read"), 9);
            assert_eq!(&buf, b"head|body");
        }
    }

    #[test]
    fn write_at_commits_then_repositions() {
        let dir = tempfile::tempdir().expect("tempdir");
        for mode in [WriteMode::Mapped, WriteMode::Descriptor] {
            let f = MappedFile::create(dir.path().join(format!("w-{mode:?}.seg")), 64, mode, pool())
                .expect("create");
            f.write(b"aaaaaaaaaa").expect("write");
            f.write_at(4, b"BB").expect("write_at");
            // pending bytes were committed before the jump
            assert_eq!(f.commit_position(), 4);
            assert_eq!(f.wrote_position(), 6);
            f.commit().expect("commit");

            let mut buf = [0u8; 6];
            assert_eq!(f.read(0, &mut buf).expect("read"), 6);
            assert_eq!(&buf, b"aaaaBB");

            // same offset: plain append, no reposition
            f.write_at(6, b"cc").expect("append");
            assert_eq!(f.wrote_position(), 8);

            assert!(matches!(
                f.write_at(60, b"too long"),
                Err(MappedFileError::WriteBeyond { .. })
            ));
            assert_eq!(f.wrote_position(), 8);
        }
    }

    #[test]
    fn write_after_done_write_fails_loudly() {
        let dir = tempfile::tempdir().expect("tempdir");
        let vec_pool = Arc::new(VecPool::new(64, 4));
        let f = MappedFile::create(
            dir.path().join("d.seg"),
            64,
            WriteMode::Mapped,
            Some(vec_pool.clone() as Arc<dyn BufferPool>),
        )
        .expect("create");
        f.write(b"final").expect("write");
        assert_eq!(f.done_write().expect("done"), 5);
        assert_eq!(vec_pool.idle(), 1);
        assert_eq!(f.read_position(), 5);

        assert!(matches!(f.write(b"x"), Err(MappedFileError::WriteSessionEnded)));
        assert!(matches!(
            f.write_at(2, b"x"),
            Err(MappedFileError::WriteSessionEnded)
        ));
        assert_eq!(f.wrote_position(), 5);
        // idempotent
        assert_eq!(f.done_write().expect("again"), 5);
        assert_eq!(f.commit().expect("commit"), 5);
        f.close().expect("close");
        assert_eq!(vec_pool.idle(), 1);
    }

    #[test]
    fn unbuffered_commit_reports_wrote_position() {
        let dir = tempfile::tempdir().expect("tempdir");
        let f = MappedFile::create(dir.path().join("e.seg"), 64, WriteMode::Mapped, None)
            .expect("create");
        f.write(b"direct").expect("write");
        assert_eq!(f.commit().expect("commit"), 6);
        assert_eq!(f.done_write().expect("done"), 6);
        // no buffer means writes keep working
        f.write(b"!").expect("write");
        let mut buf = [0u8; 7];
        assert_eq!(f.read(0, &mut buf).expect("read"), 7);
        assert_eq!(&buf, b"direct!");
    }

    #[test]
    fn failed_drain_keeps_buffer_for_next_commit() {
        use crate::retry::RetryPolicy;
        use std::fs::OpenOptions;
        use std::time::Duration;

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("flaky.seg");
        let mut f = MappedFile::builder(&path)
            .size(64)
            .write_mode(WriteMode::Descriptor)
            .pool(Arc::new(VecPool::new(64, 1)))
            .retry(RetryPolicy::bounded(Duration::from_millis(1), 3))
            .create()
            .expect("create");

        // A read-only handle makes every drain attempt fail.
        f.file = File::open(&path).expect("read-only handle");
        f.write(b"precious").expect("write");
        match f.commit() {
            Err(MappedFileError::CommitAborted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(f.commit_position(), 0);
        assert_eq!(f.wrote_position(), 8);
        let mut buf = [0u8; 8];
        assert!(f.read(0, &mut buf).is_err());
        assert!(f.done_write().is_err());

        f.file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .expect("writable handle");
        assert_eq!(f.commit().expect("commit"), 8);
        assert_eq!(f.read(0, &mut buf).expect("read"), 8);
        assert_eq!(&buf, b"precious");
    }

    #[test]
    fn cancelled_commit_returns_control() {
        use crate::retry::{CancelToken, RetryPolicy};
        use std::time::Duration;

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cancel.seg");
        let token = CancelToken::new();
        let mut f = MappedFile::builder(&path)
            .size(64)
            .write_mode(WriteMode::Descriptor)
            .pool(Arc::new(VecPool::new(64, 1)))
            .retry(RetryPolicy::unbounded(Duration::from_millis(5)).with_cancel(token.clone()))
            .create()
            .expect("create");
        f.file = File::open(&path).expect("read-only handle");
        f.write(b"stuck").expect("write");

        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            token.cancel();
        });
        assert!(matches!(
            f.commit(),
            Err(MappedFileError::CommitAborted { .. })
        ));
        canceller.join().expect("canceller");
        assert_eq!(f.commit_position(), 0);
    }

    #[test]
    fn empty_writes_on_zero_capacity_are_no_ops() {
        let dir = tempfile::tempdir().expect("tempdir");
        let f = MappedFile::create(dir.path().join("zero.seg"), 0, WriteMode::Mapped, None)
            .expect("create");
        assert_eq!(f.write(b"").expect("empty write"), 0);
        assert_eq!(f.write_vectored(&[]).expect("empty writev"), 0);
        assert_eq!(f.write_at(0, b"").expect("empty write_at"), 0);
        assert!(matches!(
            f.write(b"x"),
            Err(MappedFileError::WriteBeyond { capacity: 0, .. })
        ));

        // Sealing an untouched file leaves the same zero-capacity state.
        let g = MappedFile::create(dir.path().join("sealed.seg"), 128, WriteMode::Mapped, None)
            .expect("create");
        g.shrink().expect("shrink");
        assert!(g.is_empty());
        assert_eq!(g.write(b"").expect("empty write after shrink"), 0);
        assert_eq!(g.wrote_position(), 0);
    }

    #[test]
    fn failed_descriptor_write_leaves_position() {
        use std::fs::OpenOptions;

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("fd.seg");
        let mut f = MappedFile::create(&path, 64, WriteMode::Descriptor, None).expect("create");
        f.write(b"head").expect("write");

        let mut ro = File::open(&path).expect("read-only handle");
        ro.seek(SeekFrom::Start(4)).expect("seek");
        f.file = ro;
        let err = f
            .write_vectored(&[IoSlice::new(b"lost"), IoSlice::new(b"-tail")])
            .unwrap_err();
        assert!(matches!(err, MappedFileError::Io { op: "write", .. }));
        assert_eq!(f.wrote_position(), 4);

        let mut rw = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .expect("writable handle");
        rw.seek(SeekFrom::Start(4)).expect("seek");
        f.file = rw;
        f.write(b"-body").expect("write");
        assert_eq!(f.wrote_position(), 9);
        let mut buf = [0u8; 9];
        assert_eq!(f.read(0, &mut buf).expect("read"), 9);
        assert_eq!(&buf, b"head-body");
    }

    #[test]
    fn resume_in_write_mode_continues_appending() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("resume.seg");
        {
            let f = MappedFile::create(&path, 32, WriteMode::Descriptor, None).expect("create");
            f.write(b"first").expect("write");
            f.close().expect("close");
        }
        let f = MappedFile::open(&path, 5, OpenMode::Write, WriteMode::Descriptor, pool())
            .expect("reopen");
        f.write(b"-second").expect("write");
        f.commit().expect("commit");
        let mut buf = [0u8; 12];
        assert_eq!(f.read(0, &mut buf).expect("read"), 12);
        assert_eq!(&buf, b"first-second");
    }
}
