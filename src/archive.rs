//! Archive and copy primitives used by disk extraction.
//!
//! Everything here does blocking I/O; callers run it under
//! `tokio::task::spawn_blocking`.

use crate::error::{BackupError, Result};
use crate::job::definition::Compression;
use bzip2::write::BzEncoder;
use flate2::write::GzEncoder;
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::debug;
use xz2::write::XzEncoder;

/// Default xz preset when no level is configured.
const XZ_DEFAULT_PRESET: u32 = 6;

/// A compression layer the tar stream is written through. `finish` flushes
/// the encoder trailer and hands back the underlying file.
trait Sink: Write + Send {
    fn finish(self: Box<Self>) -> io::Result<File>;
}

impl Sink for File {
    fn finish(self: Box<Self>) -> io::Result<File> {
        Ok(*self)
    }
}

impl Sink for GzEncoder<File> {
    fn finish(self: Box<Self>) -> io::Result<File> {
        (*self).finish()
    }
}

impl Sink for BzEncoder<File> {
    fn finish(self: Box<Self>) -> io::Result<File> {
        (*self).finish()
    }
}

impl Sink for XzEncoder<File> {
    fn finish(self: Box<Self>) -> io::Result<File> {
        (*self).finish()
    }
}

/// Where extracted disk images land: either standalone files in the target
/// directory, or entries of one shared archive.
pub enum BackupTarget {
    Directory(PathBuf),
    Archive(ArchiveWriter),
}

/// Tar writer with an optional compression layer.
///
/// Creation uses create-new semantics: an already existing path is a
/// [`BackupError::ArchiveExists`], never an overwrite.
pub struct ArchiveWriter {
    path: PathBuf,
    builder: tar::Builder<Box<dyn Sink>>,
}

impl ArchiveWriter {
    /// Open a new archive at `path`. `compression` selects the layer wrapped
    /// around the tar stream; `Store` (and `None`, which callers never use
    /// for archives) writes a plain tar. gzip and bzip2 interpret `level` as
    /// a compression level, xz as a preset.
    pub fn create(path: &Path, compression: Compression, level: Option<u32>) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|err| {
                if err.kind() == ErrorKind::AlreadyExists {
                    BackupError::ArchiveExists(path.to_path_buf())
                } else {
                    BackupError::Io(err)
                }
            })?;

        let sink: Box<dyn Sink> = match compression {
            Compression::None | Compression::Store => Box::new(file),
            Compression::Gz => Box::new(GzEncoder::new(
                file,
                level.map(flate2::Compression::new).unwrap_or_default(),
            )),
            Compression::Bz2 => Box::new(BzEncoder::new(
                file,
                level.map(bzip2::Compression::new).unwrap_or_default(),
            )),
            Compression::Xz => Box::new(XzEncoder::new(file, level.unwrap_or(XZ_DEFAULT_PRESET))),
        };

        Ok(Self {
            path: path.to_path_buf(),
            builder: tar::Builder::new(sink),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `source` to the archive under `entry_name`.
    pub fn append_file(&mut self, source: &Path, entry_name: &str) -> Result<()> {
        let mut file = File::open(source)?;
        self.builder.append_file(entry_name, &mut file)?;
        debug!(source = %source.display(), entry = %entry_name, "appended to archive");
        Ok(())
    }

    /// Write the tar trailer, flush the compression layer and sync the file.
    pub fn finish(self) -> Result<()> {
        let sink = self.builder.into_inner()?;
        let file = sink.finish()?;
        file.sync_all()?;
        Ok(())
    }
}

/// Copy a disk image into `target_dir` as `file_name`, creating the
/// directory if needed. Returns the destination path.
pub fn copy_image(source: &Path, target_dir: &Path, file_name: &str) -> Result<PathBuf> {
    fs::create_dir_all(target_dir)?;
    let dest = target_dir.join(file_name);
    fs::copy(source, &dest)?;
    debug!(source = %source.display(), dest = %dest.display(), "copied disk image");
    Ok(dest)
}
