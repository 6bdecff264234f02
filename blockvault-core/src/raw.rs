//! The generic raw-copy-plus-gzip method, and the other byte-level helpers.
//!
//! This is the capture method of last resort, so it runs entirely in-process:
//! device bytes are streamed through a gzip encoder into the image file (and
//! back through a decoder on restore) without ever holding more than one
//! buffer in memory.
//!
//! Block devices are opened with `O_DIRECT` and read/written through an
//! aligned buffer. Regular files (disk images, test fixtures) use ordinary
//! buffered I/O.
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Error, Result};

// Use a 1 MiB buffer for I/O operations.
const BUFFER_SIZE: usize = 1024 * 1024;
const BLOCK_SIZE: usize = 512;

/// A flag that is never cleared, for callers that do not support cancellation.
pub static ALWAYS_RUNNING: AtomicBool = AtomicBool::new(true);

#[cfg(target_os = "linux")]
nix::ioctl_read!(blkgetsize64, 0x12, 114, u64);

/// A 1 MiB buffer aligned for `O_DIRECT`.
struct AlignedBuffer {
    buf: Vec<u8>,
    offset: usize,
}

impl AlignedBuffer {
    fn new() -> Self {
        let buf = vec![0u8; BUFFER_SIZE + BLOCK_SIZE];
        let offset = buf.as_ptr().align_offset(BLOCK_SIZE);
        Self { buf, offset }
    }

    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.offset..self.offset + BUFFER_SIZE]
    }
}

fn is_block_device(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.file_type().is_block_device())
        .unwrap_or(false)
}

fn open_for_read(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.read(true);
    if is_block_device(path) {
        options.custom_flags(libc::O_DIRECT);
    }
    options.open(path)
}

fn open_for_write(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true);
    if is_block_device(path) {
        options.custom_flags(libc::O_DIRECT);
    }
    options.open(path)
}

/// Size in bytes of a block device or regular file.
pub fn device_size(path: &Path) -> Result<u64> {
    let file = File::open(path).map_err(|e| Error::io(path, e))?;

    #[cfg(target_os = "linux")]
    if is_block_device(path) {
        use std::os::unix::io::AsRawFd;
        let mut size_bytes: u64 = 0;
        unsafe {
            blkgetsize64(file.as_raw_fd(), &mut size_bytes)
                .map_err(|e| Error::io(path, io::Error::from(e)))?;
        }
        return Ok(size_bytes);
    }

    file.metadata()
        .map(|m| m.len())
        .map_err(|e| Error::io(path, e))
}

/// Reads until `buf` is full or the reader is exhausted.
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Streams the whole of `source` into a gzip image at `image_path`.
///
/// Reports the total size once through `on_start` and the running byte count
/// through `on_progress`. If `running` is cleared the partial image is
/// removed and [`Error::Cancelled`] is returned. Returns the number of raw
/// bytes captured.
pub fn capture<F>(
    source: &Path,
    image_path: &Path,
    level: u32,
    running: &AtomicBool,
    on_start: impl FnOnce(u64),
    mut on_progress: F,
) -> Result<u64>
where
    F: FnMut(u64),
{
    let size_bytes = device_size(source)?;
    on_start(size_bytes);

    let mut source_file = open_for_read(source).map_err(|e| Error::io(source, e))?;
    let image_file = File::create(image_path).map_err(|e| Error::io(image_path, e))?;
    let mut encoder = GzEncoder::new(BufWriter::new(image_file), Compression::new(level));

    let mut buffer = AlignedBuffer::new();
    let mut read_total: u64 = 0;
    while read_total < size_bytes {
        if !running.load(Ordering::SeqCst) {
            drop(encoder);
            std::fs::remove_file(image_path).map_err(|e| Error::io(image_path, e))?;
            return Err(Error::Cancelled);
        }

        let to_read = std::cmp::min(BUFFER_SIZE as u64, size_bytes - read_total) as usize;
        let chunk = &mut buffer.as_mut()[..to_read];
        source_file
            .read_exact(chunk)
            .map_err(|e| Error::io(source, e))?;
        encoder.write_all(chunk).map_err(|e| Error::io(image_path, e))?;

        read_total += to_read as u64;
        on_progress(read_total);
    }

    let writer = encoder.finish().map_err(|e| Error::io(image_path, e))?;
    let image_file = writer
        .into_inner()
        .map_err(|e| Error::io(image_path, e.into_error()))?;
    image_file.sync_all().map_err(|e| Error::io(image_path, e))?;

    Ok(read_total)
}

/// Decompresses a gzip image onto `target`, starting at offset 0.
///
/// `on_start` receives the size of the target. Returns the number of bytes
/// written. Fails if the image is larger than the target.
pub fn restore<F>(
    image_path: &Path,
    target: &Path,
    running: &AtomicBool,
    on_start: impl FnOnce(u64),
    mut on_progress: F,
) -> Result<u64>
where
    F: FnMut(u64),
{
    let target_size = device_size(target)?;
    on_start(target_size);

    let image_file = File::open(image_path).map_err(|e| Error::io(image_path, e))?;
    let mut decoder = GzDecoder::new(BufReader::new(image_file));
    let direct = is_block_device(target);
    let mut target_file = open_for_write(target).map_err(|e| Error::io(target, e))?;

    let mut buffer = AlignedBuffer::new();
    let mut written: u64 = 0;
    loop {
        if !running.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }

        let buf = buffer.as_mut();
        let n = fill(&mut decoder, buf).map_err(|e| Error::io(image_path, e))?;
        if n == 0 {
            break;
        }
        if written + n as u64 > target_size {
            return Err(Error::TargetTooSmall {
                device: target.to_path_buf(),
                needed: written + n as u64,
                available: target_size,
            });
        }

        // The last chunk may not be a multiple of the block size; pad it
        // with zeros to satisfy O_DIRECT.
        let padded = if direct && n % BLOCK_SIZE != 0 {
            let pad = n.div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
            buf[n..pad].fill(0);
            pad
        } else {
            n
        };

        target_file
            .write_all(&buf[..padded])
            .map_err(|e| Error::io(target, e))?;
        written += n as u64;
        on_progress(written);
    }

    target_file.sync_all().map_err(|e| Error::io(target, e))?;
    Ok(written)
}

/// Reads `len` bytes at `offset` of `device`.
fn read_range(device: &Path, offset: u64, len: usize) -> Result<Vec<u8>> {
    let mut file = File::open(device).map_err(|e| Error::io(device, e))?;
    file.seek(SeekFrom::Start(offset))
        .map_err(|e| Error::io(device, e))?;
    let mut data = vec![0u8; len];
    file.read_exact(&mut data).map_err(|e| Error::io(device, e))?;
    Ok(data)
}

fn write_range(device: &Path, offset: u64, data: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .open(device)
        .map_err(|e| Error::io(device, e))?;
    file.seek(SeekFrom::Start(offset))
        .map_err(|e| Error::io(device, e))?;
    file.write_all(data).map_err(|e| Error::io(device, e))?;
    file.sync_all().map_err(|e| Error::io(device, e))
}

fn write_gzip(path: &Path, data: &[u8], level: u32) -> Result<()> {
    let file = File::create(path).map_err(|e| Error::io(path, e))?;
    let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::new(level));
    encoder.write_all(data).map_err(|e| Error::io(path, e))?;
    encoder
        .finish()
        .and_then(|w| w.into_inner().map_err(|e| e.into_error()))
        .and_then(|f| f.sync_all())
        .map_err(|e| Error::io(path, e))
}

fn read_gzip(path: &Path) -> Result<Vec<u8>> {
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    let mut data = Vec::new();
    GzDecoder::new(BufReader::new(file))
        .read_to_end(&mut data)
        .map_err(|e| Error::io(path, e))?;
    Ok(data)
}

/// Saves the first and last `edge_bytes` of `device` as two gzip files.
///
/// On devices smaller than `edge_bytes` both ranges cover the whole device.
pub fn save_edges(
    device: &Path,
    head_path: &Path,
    tail_path: &Path,
    edge_bytes: u64,
    level: u32,
) -> Result<()> {
    let size = device_size(device)?;
    let len = edge_bytes.min(size);

    let head = read_range(device, 0, len as usize)?;
    write_gzip(head_path, &head, level)?;

    let tail = read_range(device, size - len, len as usize)?;
    write_gzip(tail_path, &tail, level)?;
    Ok(())
}

/// Writes saved head and tail ranges back: the head at offset 0 and the tail
/// flush against the end of `device`.
pub fn restore_edges(head_path: &Path, tail_path: &Path, device: &Path) -> Result<()> {
    let size = device_size(device)?;
    let head = read_gzip(head_path)?;
    let tail = read_gzip(tail_path)?;

    let needed = head.len().max(tail.len()) as u64;
    if needed > size {
        return Err(Error::TargetTooSmall {
            device: device.to_path_buf(),
            needed,
            available: size,
        });
    }

    write_range(device, 0, &head)?;
    write_range(device, size - tail.len() as u64, &tail)
}

/// Zeroes the first and last `edge_bytes` of `device`, destroying any
/// partition table signatures there.
pub fn zero_edges(device: &Path, edge_bytes: u64) -> Result<()> {
    let size = device_size(device)?;
    let len = edge_bytes.min(size);
    let zeros = vec![0u8; len as usize];
    write_range(device, 0, &zeros)?;
    write_range(device, size - len, &zeros)
}

/// Decompresses a gzip file to nowhere, returning its uncompressed size.
/// Any corruption surfaces as an error.
pub fn gzip_self_test(path: &Path) -> io::Result<u64> {
    let file = File::open(path)?;
    let mut decoder = GzDecoder::new(BufReader::new(file));
    io::copy(&mut decoder, &mut io::sink())
}

/// Round-trips a small buffer through the gzip codec.
pub fn codec_self_test() -> bool {
    let sample = b"blockvault generic codec self-test";
    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    let compressed = match encoder.write_all(sample).and_then(|_| encoder.finish()) {
        Ok(c) => c,
        Err(_) => return false,
    };
    let mut out = Vec::new();
    GzDecoder::new(compressed.as_slice())
        .read_to_end(&mut out)
        .map(|_| out == sample)
        .unwrap_or(false)
}

/// Hex-encoded SHA-256 of a file's contents.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut reader = BufReader::with_capacity(BUFFER_SIZE, File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use tempfile::tempdir;

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn capture_then_restore_reproduces_device() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("source");
        let image = dir.path().join("image.img.gz");
        let target = dir.path().join("target");
        let data = patterned(3 * BUFFER_SIZE + 1024);
        std::fs::write(&source, &data).unwrap();
        std::fs::write(&target, vec![0xffu8; data.len()]).unwrap();

        let mut started = 0;
        let mut last = 0;
        let captured = capture(
            &source,
            &image,
            6,
            &ALWAYS_RUNNING,
            |n| started = n,
            |n| last = n,
        )
        .unwrap();
        assert_eq!(captured, data.len() as u64);
        assert_eq!(started, data.len() as u64);
        assert_eq!(last, data.len() as u64);
        assert_eq!(gzip_self_test(&image).unwrap(), data.len() as u64);

        let written = restore(&image, &target, &ALWAYS_RUNNING, |_| {}, |_| {}).unwrap();
        assert_eq!(written, data.len() as u64);
        assert_eq!(std::fs::read(&target).unwrap(), data);
    }

    #[test]
    fn cancelled_capture_removes_partial_image() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("source");
        let image = dir.path().join("image.img.gz");
        std::fs::write(&source, patterned(4096)).unwrap();

        let running = AtomicBool::new(false);
        let err = capture(&source, &image, 1, &running, |_| {}, |_| {}).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(!image.exists());
    }

    #[test]
    fn restore_refuses_oversized_image() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("source");
        let image = dir.path().join("image.img.gz");
        let target = dir.path().join("target");
        std::fs::write(&source, patterned(8192)).unwrap();
        std::fs::write(&target, vec![0u8; 4096]).unwrap();

        capture(&source, &image, 1, &ALWAYS_RUNNING, |_| {}, |_| {}).unwrap();
        let err = restore(&image, &target, &ALWAYS_RUNNING, |_| {}, |_| {}).unwrap_err();
        assert!(matches!(err, Error::TargetTooSmall { .. }));
    }

    #[test]
    fn edges_round_trip_onto_larger_device() {
        let dir = tempdir().unwrap();
        let device = dir.path().join("disk");
        let head = dir.path().join("head.bin.gz");
        let tail = dir.path().join("tail.bin.gz");
        let data = patterned(64 * 1024);
        std::fs::write(&device, &data).unwrap();

        save_edges(&device, &head, &tail, 4096, 6).unwrap();

        let target = dir.path().join("bigger");
        std::fs::write(&target, vec![0u8; 128 * 1024]).unwrap();
        restore_edges(&head, &tail, &target).unwrap();

        let restored = std::fs::read(&target).unwrap();
        assert_eq!(&restored[..4096], &data[..4096]);
        assert_eq!(&restored[restored.len() - 4096..], &data[data.len() - 4096..]);
        assert!(restored[4096..restored.len() - 4096].iter().all(|b| *b == 0));
    }

    #[test]
    fn edges_cover_small_device_entirely() {
        let dir = tempdir().unwrap();
        let device = dir.path().join("tiny");
        let head = dir.path().join("head.bin.gz");
        let tail = dir.path().join("tail.bin.gz");
        std::fs::write(&device, patterned(1000)).unwrap();

        save_edges(&device, &head, &tail, 4096, 6).unwrap();
        assert_eq!(gzip_self_test(&head).unwrap(), 1000);
        assert_eq!(gzip_self_test(&tail).unwrap(), 1000);
    }

    #[test]
    fn zero_edges_clears_both_ends() {
        let dir = tempdir().unwrap();
        let device = dir.path().join("disk");
        std::fs::write(&device, vec![0xaau8; 16 * 1024]).unwrap();

        zero_edges(&device, 1024).unwrap();
        let data = std::fs::read(&device).unwrap();
        assert!(data[..1024].iter().all(|b| *b == 0));
        assert!(data[data.len() - 1024..].iter().all(|b| *b == 0));
        assert_eq!(data[8192], 0xaa);
    }

    #[test]
    fn corrupt_gzip_fails_self_test() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.img.gz");
        std::fs::write(&path, b"\x1f\x8b\x08\x00garbage").unwrap();
        assert!(gzip_self_test(&path).is_err());
        assert!(codec_self_test());
    }

    #[test]
    fn sha256_matches_known_digest() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("abc");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
