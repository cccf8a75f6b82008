//! Per-file encryption engine.
//!
//! Ciphertext file layout:
//! ```text
//! [2-byte version][16-byte file ID][block 0][block 1]...
//! ```
//! The header appears on the first write; empty files stay empty. Every
//! block is bound to its number and to the file ID, so blocks cannot be
//! transplanted between positions or files.
//!
//! Partial-block writes are read-modify-write sequences serialized by a
//! per-file lock. Extensions leave filesystem holes; the all-zero-block
//! passthrough in the codec turns them back into zero plaintext.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};

use rand::{thread_rng, RngCore};

use veilfs_core::{EngineError, EngineResult, FILE_ID_LEN, HEADER_LEN, HEADER_VERSION};
use veilfs_crypto::ContentCodec;

use crate::range::BlockMath;

/// Attempts before an interrupted syscall is reported as an error.
const MAX_IO_RETRIES: u32 = 16;

/// An open ciphertext file presented as plaintext.
pub struct FileHandle {
    file: File,
    codec: Arc<ContentCodec>,
    math: BlockMath,
    /// Lazily-created file ID; the mutex doubles as the RMW write lock.
    write_lock: Mutex<Option<[u8; FILE_ID_LEN]>>,
}

impl FileHandle {
    /// Creates a new empty ciphertext file. No header is written until
    /// the first write.
    pub fn create(path: &Path, codec: Arc<ContentCodec>) -> EngineResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        Ok(Self::with_parts(file, codec, None))
    }

    /// Opens an existing ciphertext file and parses its header.
    pub fn open(path: &Path, codec: Arc<ContentCodec>) -> EngineResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let id = read_header(&file)?;
        Ok(Self::with_parts(file, codec, id))
    }

    fn with_parts(
        file: File,
        codec: Arc<ContentCodec>,
        id: Option<[u8; FILE_ID_LEN]>,
    ) -> Self {
        let math = BlockMath::new(codec.plain_bs(), codec.block_overhead());
        FileHandle {
            file,
            codec,
            math,
            write_lock: Mutex::new(id),
        }
    }

    /// The file ID, if a header exists yet.
    pub fn file_id(&self) -> Option<[u8; FILE_ID_LEN]> {
        *self.write_lock.lock().expect("file lock")
    }

    /// Current plaintext length, derived from the ciphertext length.
    pub fn plain_size(&self) -> EngineResult<u64> {
        self.math.plain_size(self.file.metadata()?.len())
    }

    /// Reads up to `len` bytes at `offset`. Reads crossing the end of
    /// the file return short; reads past it return empty.
    pub fn read_at(&self, offset: u64, len: usize) -> EngineResult<Vec<u8>> {
        let Some(id) = self.file_id() else {
            return Ok(Vec::new());
        };
        if len == 0 {
            return Ok(Vec::new());
        }
        let size = self.plain_size()?;
        if offset >= size {
            return Ok(Vec::new());
        }
        let end = size.min(offset + len as u64);
        let (first, last) = self
            .math
            .covering(offset, end - offset)
            .expect("range is non-empty");

        let mut ct = vec![0u8; ((last - first + 1) * self.math.cipher_bs()) as usize];
        let n = read_full_at(&self.file, &mut ct, self.math.cipher_offset(first))?;
        ct.truncate(n);

        let pt = self.codec.decrypt_blocks(&ct, first, &id)?;
        let skip = (offset - self.math.plain_offset(first)) as usize;
        let take = (end - offset) as usize;
        // A concurrent truncate may have shortened the file under us.
        let window_end = pt.len().min(skip + take);
        let out = pt.get(skip..window_end).unwrap_or_default().to_vec();
        self.codec.recycle_plaintext(pt);
        Ok(out)
    }

    /// Writes `data` at `offset`. Full blocks encrypt directly; partial
    /// blocks go through read-modify-write under the file lock.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> EngineResult<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let mut guard = self.write_lock.lock().expect("file lock");
        let id = self.ensure_header(&mut guard)?;
        let old_size = self.plain_size()?;
        let bs = self.math.plain_bs();

        let (first, last) = self
            .math
            .covering(offset, data.len() as u64)
            .expect("data is non-empty");

        // Writing beyond a partial last block would leave a short block
        // in the middle of the file; complete it with zeros first.
        if offset > old_size && old_size % bs != 0 && first > self.math.block_no(old_size - 1) {
            self.zero_pad_last_block(old_size, &id)?;
        }

        let mut blocks: Vec<Vec<u8>> = Vec::with_capacity((last - first + 1) as usize);
        let mut consumed = 0usize;
        for bno in first..=last {
            let off_in_block = if bno == first {
                self.math.block_off(offset)
            } else {
                0
            };
            let chunk_len = (bs as usize - off_in_block).min(data.len() - consumed);
            let chunk = &data[consumed..consumed + chunk_len];
            consumed += chunk_len;

            if off_in_block == 0 && chunk_len == bs as usize {
                blocks.push(chunk.to_vec());
            } else {
                let old = self.read_block(bno, &id)?;
                blocks.push(merge_block(&old, chunk, off_in_block));
            }
        }

        let refs: Vec<&[u8]> = blocks.iter().map(|b| b.as_slice()).collect();
        let ct = self.codec.encrypt_blocks(&refs, first, &id)?;
        let res = write_all_at(&self.file, &ct, self.math.cipher_offset(first));
        self.codec.recycle_ciphertext(ct);
        res?;
        Ok(data.len())
    }

    /// Changes the plaintext length. Shrinking drops whole blocks and
    /// rewrites a misaligned last block; growing leaves holes.
    pub fn truncate(&self, new_len: u64) -> EngineResult<()> {
        let mut guard = self.write_lock.lock().expect("file lock");
        let old_len = match *guard {
            Some(_) => self.plain_size()?,
            None => 0,
        };
        if new_len == old_len {
            return Ok(());
        }
        if new_len == 0 {
            self.file.set_len(0)?;
            *guard = None;
            return Ok(());
        }
        let id = self.ensure_header(&mut guard)?;
        if new_len < old_len {
            self.shrink(new_len, &id)
        } else {
            self.grow(old_len, new_len, &id)
        }
    }

    /// Flushes file data to the backing store.
    pub fn sync(&self) -> EngineResult<()> {
        self.file.sync_data()?;
        Ok(())
    }

    fn shrink(&self, new_len: u64, id: &[u8; FILE_ID_LEN]) -> EngineResult<()> {
        let bs = self.math.plain_bs();
        let tail = new_len % bs;
        if tail == 0 {
            self.file.set_len(self.math.cipher_offset(new_len / bs))?;
            return Ok(());
        }
        let bno = new_len / bs;
        let mut kept = self.read_block(bno, id)?;
        kept.resize(tail as usize, 0);
        let ct = self.codec.encrypt_block(&kept, bno, id)?;
        self.file.set_len(self.math.cipher_offset(bno))?;
        write_all_at(&self.file, &ct, self.math.cipher_offset(bno))?;
        Ok(())
    }

    fn grow(&self, old_len: u64, new_len: u64, id: &[u8; FILE_ID_LEN]) -> EngineResult<()> {
        let bs = self.math.plain_bs();

        if old_len > 0 && old_len % bs != 0 {
            let last_bno = self.math.block_no(old_len - 1);
            let block_end = (last_bno + 1) * bs;
            if new_len <= block_end {
                // The extension stays within the partial block.
                let mut block = self.read_block(last_bno, id)?;
                block.resize((new_len - self.math.plain_offset(last_bno)) as usize, 0);
                let ct = self.codec.encrypt_block(&block, last_bno, id)?;
                write_all_at(&self.file, &ct, self.math.cipher_offset(last_bno))?;
                return Ok(());
            }
            self.zero_pad_last_block(old_len, id)?;
        }

        let tail = new_len % bs;
        if tail == 0 {
            // Whole trailing blocks become holes.
            self.file.set_len(self.math.cipher_size(new_len))?;
            return Ok(());
        }
        // Holes up to the final block, then one explicit partial block
        // of zeros (a partial all-zero region is not a valid hole).
        let last = new_len / bs;
        self.file.set_len(self.math.cipher_offset(last))?;
        let ct = self.codec.encrypt_block(&vec![0u8; tail as usize], last, id)?;
        write_all_at(&self.file, &ct, self.math.cipher_offset(last))?;
        Ok(())
    }

    /// Completes a partial last block with zeros up to the block size.
    fn zero_pad_last_block(&self, old_size: u64, id: &[u8; FILE_ID_LEN]) -> EngineResult<()> {
        let bs = self.math.plain_bs() as usize;
        let last_bno = self.math.block_no(old_size - 1);
        let mut block = self.read_block(last_bno, id)?;
        if block.len() >= bs {
            return Ok(());
        }
        block.resize(bs, 0);
        let ct = self.codec.encrypt_block(&block, last_bno, id)?;
        write_all_at(&self.file, &ct, self.math.cipher_offset(last_bno))?;
        Ok(())
    }

    /// Decrypts a single block; empty if the block is past the end.
    fn read_block(&self, bno: u64, id: &[u8; FILE_ID_LEN]) -> EngineResult<Vec<u8>> {
        let mut ct = vec![0u8; self.math.cipher_bs() as usize];
        let n = read_full_at(&self.file, &mut ct, self.math.cipher_offset(bno))?;
        ct.truncate(n);
        if ct.is_empty() {
            return Ok(Vec::new());
        }
        self.codec.decrypt_block(&ct, bno, id)
    }

    fn ensure_header(
        &self,
        guard: &mut Option<[u8; FILE_ID_LEN]>,
    ) -> EngineResult<[u8; FILE_ID_LEN]> {
        if let Some(id) = *guard {
            return Ok(id);
        }
        let mut id = [0u8; FILE_ID_LEN];
        while id.iter().all(|&b| b == 0) {
            thread_rng().fill_bytes(&mut id);
        }
        let mut header = [0u8; HEADER_LEN];
        header[..2].copy_from_slice(&HEADER_VERSION.to_be_bytes());
        header[2..].copy_from_slice(&id);
        write_all_at(&self.file, &header, 0)?;
        *guard = Some(id);
        Ok(id)
    }
}

/// Overlays `new` at `off` within a block, zero-filling any gap between
/// the old contents and the write position.
fn merge_block(old: &[u8], new: &[u8], off: usize) -> Vec<u8> {
    let out_len = old.len().max(off + new.len());
    let mut out = vec![0u8; out_len];
    out[..old.len()].copy_from_slice(old);
    out[off..off + new.len()].copy_from_slice(new);
    out
}

/// Parses the 18-byte header. `None` for an empty file.
pub(crate) fn read_header(file: &File) -> EngineResult<Option<[u8; FILE_ID_LEN]>> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(None);
    }
    if len < HEADER_LEN as u64 {
        return Err(EngineError::format(format!(
            "file of {len} bytes is shorter than the header"
        )));
    }
    let mut header = [0u8; HEADER_LEN];
    let n = read_full_at(file, &mut header, 0)?;
    if n < HEADER_LEN {
        return Err(EngineError::format("short header read"));
    }
    let version = u16::from_be_bytes([header[0], header[1]]);
    if version != HEADER_VERSION {
        return Err(EngineError::format(format!(
            "unsupported header version {version}"
        )));
    }
    let mut id = [0u8; FILE_ID_LEN];
    id.copy_from_slice(&header[2..]);
    if id.iter().all(|&b| b == 0) {
        return Err(EngineError::format("all-zero file ID"));
    }
    Ok(Some(id))
}

#[cfg(unix)]
fn read_at_raw(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(windows)]
fn read_at_raw(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}

#[cfg(unix)]
fn write_at_raw(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.write_at(buf, offset)
}

#[cfg(windows)]
fn write_at_raw(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_write(buf, offset)
}

/// Positional read that fills `buf` or stops at EOF, retrying
/// interrupted syscalls a bounded number of times.
fn read_full_at(file: &File, buf: &mut [u8], offset: u64) -> EngineResult<usize> {
    let mut done = 0;
    let mut retries = 0;
    while done < buf.len() {
        match read_at_raw(file, &mut buf[done..], offset + done as u64) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                retries += 1;
                if retries > MAX_IO_RETRIES {
                    return Err(e.into());
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(done)
}

/// Positional write of the whole buffer with the same retry bound.
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> EngineResult<()> {
    let mut done = 0;
    let mut retries = 0;
    while done < buf.len() {
        match write_at_raw(file, &buf[done..], offset + done as u64) {
            Ok(0) => {
                return Err(EngineError::Io(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "write returned zero bytes",
                )))
            }
            Ok(n) => done += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                retries += 1;
                if retries > MAX_IO_RETRIES {
                    return Err(e.into());
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;
    use veilfs_crypto::{AeadBackend, AeadKind};

    const BS: usize = 64;

    fn codec() -> Arc<ContentCodec> {
        Arc::new(ContentCodec::new(
            AeadBackend::new(AeadKind::XChaCha, &[5u8; 32]),
            BS,
        ))
    }

    fn new_handle(dir: &Path) -> FileHandle {
        FileHandle::create(&dir.join("f"), codec()).unwrap()
    }

    #[test]
    fn test_empty_file_has_no_header() {
        let dir = tempdir().unwrap();
        let h = new_handle(dir.path());
        assert_eq!(h.file_id(), None);
        assert_eq!(h.plain_size().unwrap(), 0);
        assert_eq!(fs::metadata(dir.path().join("f")).unwrap().len(), 0);
        assert!(h.read_at(0, 100).unwrap().is_empty());
    }

    #[test]
    fn test_write_read_roundtrip() {
        let dir = tempdir().unwrap();
        let h = new_handle(dir.path());

        h.write_at(0, b"hello\nworld").unwrap();
        assert!(h.file_id().is_some());
        assert_eq!(h.plain_size().unwrap(), 11);
        assert_eq!(h.read_at(0, 11).unwrap(), b"hello\nworld");
        assert_eq!(h.read_at(6, 5).unwrap(), b"world");
    }

    #[test]
    fn test_read_crossing_eof_is_short() {
        let dir = tempdir().unwrap();
        let h = new_handle(dir.path());
        h.write_at(0, b"0123456789").unwrap();

        assert_eq!(h.read_at(5, 100).unwrap(), b"56789");
        assert!(h.read_at(10, 10).unwrap().is_empty());
        assert!(h.read_at(9999, 10).unwrap().is_empty());
    }

    #[test]
    fn test_multiblock_write_and_read() {
        let dir = tempdir().unwrap();
        let h = new_handle(dir.path());
        let data: Vec<u8> = (0..BS as u32 * 5 + 13).map(|i| (i % 251) as u8).collect();

        h.write_at(0, &data).unwrap();
        assert_eq!(h.plain_size().unwrap(), data.len() as u64);
        assert_eq!(h.read_at(0, data.len()).unwrap(), data);

        // Unaligned window crossing three blocks.
        let win = h.read_at(BS as u64 - 7, 2 * BS + 14).unwrap();
        assert_eq!(win, &data[BS - 7..BS - 7 + 2 * BS + 14]);
    }

    #[test]
    fn test_partial_overwrite_preserves_rest() {
        let dir = tempdir().unwrap();
        let h = new_handle(dir.path());
        let mut data = vec![0xAAu8; 3 * BS];
        h.write_at(0, &data).unwrap();

        h.write_at(70, b"XYZ").unwrap();
        data[70..73].copy_from_slice(b"XYZ");
        assert_eq!(h.read_at(0, data.len()).unwrap(), data);
    }

    #[test]
    fn test_straddling_single_byte_write() {
        let dir = tempdir().unwrap();
        let h = new_handle(dir.path());
        let mut data = vec![0x11u8; 4 * BS];
        h.write_at(0, &data).unwrap();

        let off = 2 * BS as u64 + 19;
        h.write_at(off, &[0xFE]).unwrap();
        data[off as usize] = 0xFE;
        assert_eq!(h.read_at(0, data.len()).unwrap(), data);
    }

    #[test]
    fn test_write_past_eof_leaves_readable_zero_gap() {
        let dir = tempdir().unwrap();
        let h = new_handle(dir.path());
        h.write_at(0, b"start").unwrap();

        let gap_end = 4 * BS as u64 + 10;
        h.write_at(gap_end, b"end").unwrap();

        let all = h.read_at(0, (gap_end + 3) as usize).unwrap();
        assert_eq!(&all[..5], b"start");
        assert!(all[5..gap_end as usize].iter().all(|&b| b == 0));
        assert_eq!(&all[gap_end as usize..], b"end");
    }

    #[test]
    fn test_truncate_extend_reads_zeros() {
        let dir = tempdir().unwrap();
        let h = new_handle(dir.path());
        h.write_at(0, b"abc").unwrap();

        h.truncate(3 * BS as u64 + 5).unwrap();
        assert_eq!(h.plain_size().unwrap(), 3 * BS as u64 + 5);

        let all = h.read_at(0, 3 * BS + 5).unwrap();
        assert_eq!(&all[..3], b"abc");
        assert!(all[3..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_truncate_shrink_misaligned_leaves_one_partial_block() {
        let dir = tempdir().unwrap();
        let h = new_handle(dir.path());
        let data = vec![0x7Fu8; 4 * BS];
        h.write_at(0, &data).unwrap();

        let new_len = 2 * BS as u64 + 10;
        h.truncate(new_len).unwrap();
        assert_eq!(h.plain_size().unwrap(), new_len);
        assert_eq!(h.read_at(0, 10 * BS).unwrap(), &data[..new_len as usize]);

        let math = BlockMath::new(BS, codec().block_overhead());
        assert_eq!(
            fs::metadata(dir.path().join("f")).unwrap().len(),
            math.cipher_size(new_len)
        );
    }

    #[test]
    fn test_truncate_to_zero_drops_header() {
        let dir = tempdir().unwrap();
        let h = new_handle(dir.path());
        h.write_at(0, b"payload").unwrap();
        let old_id = h.file_id().unwrap();

        h.truncate(0).unwrap();
        assert_eq!(h.file_id(), None);
        assert_eq!(fs::metadata(dir.path().join("f")).unwrap().len(), 0);

        // A fresh write mints a fresh ID.
        h.write_at(0, b"reborn").unwrap();
        assert_ne!(h.file_id().unwrap(), old_id);
    }

    #[test]
    fn test_reopen_keeps_id_and_data() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        let id;
        {
            let h = FileHandle::create(&path, codec()).unwrap();
            h.write_at(0, b"persistent").unwrap();
            id = h.file_id().unwrap();
        }
        let h = FileHandle::open(&path, codec()).unwrap();
        assert_eq!(h.file_id(), Some(id));
        assert_eq!(h.read_at(0, 10).unwrap(), b"persistent");
    }

    #[test]
    fn test_corrupted_block_fails_authentication() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        {
            let h = FileHandle::create(&path, codec()).unwrap();
            h.write_at(0, &vec![0xABu8; 2 * BS]).unwrap();
        }
        // Flip one byte inside the first block's ciphertext.
        let mut raw = fs::read(&path).unwrap();
        raw[HEADER_LEN + 30] ^= 0x01;
        fs::write(&path, &raw).unwrap();

        let h = FileHandle::open(&path, codec()).unwrap();
        let res = h.read_at(0, 2 * BS);
        assert!(res.unwrap_err().is_corruption());
        // The second block is still intact.
        assert_eq!(h.read_at(BS as u64, BS).unwrap(), vec![0xABu8; BS]);
    }

    #[test]
    fn test_file_shorter_than_header_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, [0u8; 5]).unwrap();
        assert!(matches!(
            FileHandle::open(&path, codec()),
            Err(EngineError::Format(_))
        ));
    }

    #[test]
    fn test_unknown_header_version_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        let mut header = [0x5Au8; HEADER_LEN];
        header[0] = 0xFF;
        header[1] = 0xFF;
        fs::write(&path, header).unwrap();
        assert!(matches!(
            FileHandle::open(&path, codec()),
            Err(EngineError::Format(_))
        ));
    }

    #[test]
    fn test_merge_block_rules() {
        assert_eq!(merge_block(b"", b"new", 0), b"new");
        assert_eq!(merge_block(b"abcdef", b"XY", 2), b"abXYef");
        assert_eq!(merge_block(b"abc", b"XY", 5), b"abc\0\0XY");
        assert_eq!(merge_block(b"abcdef", b"XY", 4), b"abcdXY");
    }
}
