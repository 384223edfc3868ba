//! CPIO archive creation for overlay images.
//!
//! Archives use the `newc` format the kernel unpacks as an initramfs,
//! optionally wrapped in gzip or zstd. Output is reproducible: entries
//! are sorted by path, mtimes are zero and inode numbers are assigned
//! sequentially, so packing the same tree twice gives identical bytes.

use anyhow::{bail, Context, Result};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use tracing::debug;
use walkdir::WalkDir;

use crate::config::Compression;

const MAGIC: &[u8; 6] = b"070701";
const HEADER_LEN: usize = 110;
const TRAILER: &str = "TRAILER!!!";

const S_IFMT: u32 = 0o170_000;
const S_IFDIR: u32 = 0o040_000;
const S_IFREG: u32 = 0o100_000;
const S_IFLNK: u32 = 0o120_000;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

fn pad4(len: usize) -> usize {
    (4 - len % 4) % 4
}

#[derive(Debug, Clone, Copy, Default)]
struct Header {
    mode: u32,
    uid: u32,
    gid: u32,
    nlink: u32,
    filesize: u32,
    rdevmajor: u32,
    rdevminor: u32,
}

/// Streaming `newc` writer.
pub struct CpioWriter<W: Write> {
    inner: W,
    next_ino: u32,
}

impl<W: Write> CpioWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, next_ino: 1 }
    }

    fn header(&mut self, name: &[u8], h: Header) -> io::Result<()> {
        let ino = self.next_ino;
        self.next_ino += 1;
        let namesize = name.len() + 1;
        let fields = [
            ino,
            h.mode,
            h.uid,
            h.gid,
            h.nlink,
            0, // mtime
            h.filesize,
            0,
            0,
            h.rdevmajor,
            h.rdevminor,
            namesize as u32,
            0, // check
        ];
        self.inner.write_all(MAGIC)?;
        for field in fields {
            write!(self.inner, "{:08X}", field)?;
        }
        self.inner.write_all(name)?;
        self.inner.write_all(&[0])?;
        self.pad(HEADER_LEN + namesize)
    }

    fn pad(&mut self, len: usize) -> io::Result<()> {
        self.inner.write_all(&[0u8; 3][..pad4(len)])
    }

    pub fn append_dir(&mut self, name: &[u8], mode: u32, uid: u32, gid: u32) -> io::Result<()> {
        self.header(
            name,
            Header {
                mode: S_IFDIR | (mode & 0o7777),
                uid,
                gid,
                nlink: 2,
                ..Header::default()
            },
        )
    }

    pub fn append_symlink(&mut self, name: &[u8], target: &[u8], uid: u32, gid: u32) -> io::Result<()> {
        self.header(
            name,
            Header {
                mode: S_IFLNK | 0o777,
                uid,
                gid,
                nlink: 1,
                filesize: target.len() as u32,
                ..Header::default()
            },
        )?;
        self.inner.write_all(target)?;
        self.pad(target.len())
    }

    /// Append a regular file of exactly `size` bytes read from `data`.
    pub fn append_file(
        &mut self,
        name: &[u8],
        mode: u32,
        uid: u32,
        gid: u32,
        size: u64,
        data: &mut impl Read,
    ) -> io::Result<()> {
        let filesize = u32::try_from(size).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "file too large for newc archive")
        })?;
        self.header(
            name,
            Header {
                mode: S_IFREG | (mode & 0o7777),
                uid,
                gid,
                nlink: 1,
                filesize,
                ..Header::default()
            },
        )?;
        let copied = io::copy(&mut data.take(size), &mut self.inner)?;
        if copied != size {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "file shrank while archiving",
            ));
        }
        self.pad(size as usize)
    }

    /// Device nodes, fifos and sockets: header only.
    pub fn append_special(
        &mut self,
        name: &[u8],
        mode: u32,
        uid: u32,
        gid: u32,
        rdev: (u32, u32),
    ) -> io::Result<()> {
        self.header(
            name,
            Header {
                mode,
                uid,
                gid,
                nlink: 1,
                rdevmajor: rdev.0,
                rdevminor: rdev.1,
                ..Header::default()
            },
        )
    }

    /// Write the trailer and hand back the underlying writer.
    pub fn finish(mut self) -> io::Result<W> {
        self.header(TRAILER.as_bytes(), Header { nlink: 1, ..Header::default() })?;
        Ok(self.inner)
    }
}

/// Serialize the tree under `root` (not `root` itself) into `out`.
/// Returns the number of entries written.
pub fn pack_tree<W: Write>(root: &Path, out: W) -> Result<(W, usize)> {
    let mut writer = CpioWriter::new(out);
    let mut count = 0;

    for entry in WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
        let path = entry.path();
        let rel = path.strip_prefix(root).unwrap_or(path);
        let name = rel.as_os_str().as_bytes();
        let md = fs::symlink_metadata(path)
            .with_context(|| format!("Failed to stat {}", path.display()))?;
        let ft = md.file_type();

        if ft.is_dir() {
            writer.append_dir(name, md.mode(), md.uid(), md.gid())?;
        } else if ft.is_symlink() {
            let target = fs::read_link(path)
                .with_context(|| format!("Failed to read link {}", path.display()))?;
            writer.append_symlink(name, target.as_os_str().as_bytes(), md.uid(), md.gid())?;
        } else if ft.is_file() {
            let mut f = File::open(path)
                .with_context(|| format!("Failed to open {}", path.display()))?;
            writer
                .append_file(name, md.mode(), md.uid(), md.gid(), md.len(), &mut f)
                .with_context(|| format!("Failed to archive {}", path.display()))?;
        } else {
            let rdev = md.rdev();
            let rdev = (
                nix::sys::stat::major(rdev) as u32,
                nix::sys::stat::minor(rdev) as u32,
            );
            writer.append_special(name, md.mode(), md.uid(), md.gid(), rdev)?;
        }
        count += 1;
    }

    let out = writer.finish()?;
    Ok((out, count))
}

enum Sink<W: Write> {
    Plain(W),
    Gzip(GzEncoder<W>),
    Zstd(zstd::stream::Encoder<'static, W>),
}

impl<W: Write> Sink<W> {
    fn new(out: W, compression: Compression) -> io::Result<Self> {
        Ok(match compression {
            Compression::None => Sink::Plain(out),
            Compression::Gzip => Sink::Gzip(GzEncoder::new(out, flate2::Compression::default())),
            Compression::Zstd => Sink::Zstd(zstd::stream::Encoder::new(out, 3)?),
        })
    }

    fn finish(self) -> io::Result<W> {
        match self {
            Sink::Plain(w) => Ok(w),
            Sink::Gzip(e) => e.finish(),
            Sink::Zstd(e) => e.finish(),
        }
    }
}

impl<W: Write> Write for Sink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Sink::Plain(w) => w.write(buf),
            Sink::Gzip(e) => e.write(buf),
            Sink::Zstd(e) => e.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Sink::Plain(w) => w.flush(),
            Sink::Gzip(e) => e.flush(),
            Sink::Zstd(e) => e.flush(),
        }
    }
}

/// Build an archive of `root` at `output`.
///
/// The archive is written to a temporary file next to `output` and
/// renamed into place, so `output` is always either absent, the previous
/// archive, or the complete new one.
pub fn build_cpio(root: &Path, output: &Path, compression: Compression) -> Result<()> {
    let parent = output
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create directory: {}", parent.display()))?;

    let prefix = format!(
        ".{}.",
        output.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
    );
    let tmp = tempfile::Builder::new()
        .prefix(&prefix)
        .tempfile_in(parent)
        .with_context(|| format!("Failed to create temporary archive in {}", parent.display()))?;

    let sink = Sink::new(BufWriter::new(tmp.as_file()), compression)?;
    let (sink, count) = pack_tree(root, sink)?;
    let mut buffered = sink
        .finish()
        .with_context(|| format!("Failed to finish compression for {}", output.display()))?;
    buffered.flush()?;
    drop(buffered);
    tmp.as_file()
        .sync_all()
        .with_context(|| format!("Failed to sync {}", tmp.path().display()))?;

    tmp.persist(output)
        .map_err(|e| e.error)
        .with_context(|| format!("Failed to move archive into place: {}", output.display()))?;
    debug!(archive = %output.display(), entries = count, "published archive");
    Ok(())
}

/// One member of an archive, as read back by [`read_cpio`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpioEntry {
    pub name: String,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: u32,
    pub data: Vec<u8>,
}

impl CpioEntry {
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn is_file(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }

    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }
}

fn read_hex(field: &[u8]) -> Result<u32> {
    let text = std::str::from_utf8(field).context("non-ascii cpio header field")?;
    u32::from_str_radix(text, 16).with_context(|| format!("bad cpio header field '{}'", text))
}

fn skip(r: &mut impl Read, n: usize) -> io::Result<()> {
    let mut pad = [0u8; 3];
    r.read_exact(&mut pad[..n])
}

/// Parse a plain `newc` stream up to its trailer.
pub fn parse_cpio(mut r: impl Read) -> Result<Vec<CpioEntry>> {
    let mut entries = Vec::new();
    loop {
        let mut header = [0u8; HEADER_LEN];
        r.read_exact(&mut header).context("truncated cpio header")?;
        if &header[..6] != MAGIC {
            bail!("bad cpio magic");
        }
        let field = |i: usize| read_hex(&header[6 + i * 8..14 + i * 8]);
        let mode = field(1)?;
        let uid = field(2)?;
        let gid = field(3)?;
        let mtime = field(5)?;
        let filesize = field(6)? as usize;
        let namesize = field(11)? as usize;
        if namesize == 0 {
            bail!("zero-length cpio name");
        }

        let mut name = vec![0u8; namesize];
        r.read_exact(&mut name).context("truncated cpio name")?;
        name.pop();
        skip(&mut r, pad4(HEADER_LEN + namesize))?;
        let name = String::from_utf8_lossy(&name).into_owned();
        if name == TRAILER {
            return Ok(entries);
        }

        let mut data = vec![0u8; filesize];
        r.read_exact(&mut data)
            .with_context(|| format!("truncated data for '{}'", name))?;
        skip(&mut r, pad4(filesize))?;
        entries.push(CpioEntry {
            name,
            mode,
            uid,
            gid,
            mtime,
            data,
        });
    }
}

/// Read an archive file, detecting gzip or zstd wrapping from its magic.
pub fn read_cpio(path: &Path) -> Result<Vec<CpioEntry>> {
    let mut f = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut magic = [0u8; 4];
    let n = f.read(&mut magic)?;
    let f = BufReader::new(File::open(path)?);
    let entries = if n >= 2 && magic[..2] == GZIP_MAGIC {
        parse_cpio(MultiGzDecoder::new(f))
    } else if n == 4 && magic == ZSTD_MAGIC {
        parse_cpio(zstd::stream::read::Decoder::new(f)?)
    } else {
        parse_cpio(f)
    };
    entries.with_context(|| format!("Failed to read archive {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::{symlink, PermissionsExt};
    use tempfile::TempDir;

    fn sample_tree(temp: &TempDir) -> std::path::PathBuf {
        let root = temp.path().join("root");
        fs::create_dir_all(root.join("etc/ssh")).unwrap();
        fs::write(root.join("etc/motd"), "hello\n").unwrap();
        fs::write(root.join("etc/ssh/key"), "secret").unwrap();
        fs::set_permissions(root.join("etc/ssh/key"), fs::Permissions::from_mode(0o600)).unwrap();
        symlink("motd", root.join("etc/issue")).unwrap();
        root
    }

    #[test]
    fn test_build_cpio() {
        let temp = TempDir::new().unwrap();
        let root = sample_tree(&temp);
        let output = temp.path().join("out/test.img.gz");

        build_cpio(&root, &output, Compression::Gzip).unwrap();

        let entries = read_cpio(&output).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["etc", "etc/issue", "etc/motd", "etc/ssh", "etc/ssh/key"]);

        let motd = &entries[2];
        assert!(motd.is_file());
        assert_eq!(motd.data, b"hello\n");
        assert_eq!(motd.mtime, 0);

        let link = &entries[1];
        assert!(link.is_symlink());
        assert_eq!(link.data, b"motd");

        assert!(entries[0].is_dir());
        assert_eq!(entries[4].permissions(), 0o600);
    }

    #[test]
    fn output_is_reproducible() {
        let temp = TempDir::new().unwrap();
        let root = sample_tree(&temp);
        for compression in [Compression::None, Compression::Gzip, Compression::Zstd] {
            let a = temp.path().join("a.img");
            let b = temp.path().join("b.img");
            build_cpio(&root, &a, compression).unwrap();
            build_cpio(&root, &b, compression).unwrap();
            assert_eq!(fs::read(&a).unwrap(), fs::read(&b).unwrap());
            assert_eq!(read_cpio(&a).unwrap().len(), 5);
        }
    }

    #[test]
    fn entries_are_padded() {
        let mut w = CpioWriter::new(Vec::new());
        w.append_file(b"a", 0o644, 0, 0, 3, &mut &b"xyz"[..]).unwrap();
        let bytes = w.finish().unwrap();
        assert_eq!(bytes.len() % 4, 0);
        let entries = parse_cpio(&bytes[..]).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].data, b"xyz");
    }

    #[test]
    fn truncated_archive_is_rejected() {
        let mut w = CpioWriter::new(Vec::new());
        w.append_file(b"file", 0o644, 0, 0, 5, &mut &b"01234"[..]).unwrap();
        let bytes = w.finish().unwrap();
        assert!(parse_cpio(&bytes[..bytes.len() - 10]).is_err());
    }

    #[test]
    fn failed_build_leaves_no_output() {
        let temp = TempDir::new().unwrap();
        let output = temp.path().join("never.img");
        assert!(build_cpio(&temp.path().join("missing"), &output, Compression::None).is_err());
        assert!(!output.exists());
        assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 0);
    }
}
