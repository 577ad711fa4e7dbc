use std::fs::{File, OpenOptions};
use std::io;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::{read::MultiGzDecoder, write::GzEncoder};

pub struct GzFileStream {
    pub path: PathBuf,
    pub size: usize,
    pub compression: Compression,
}

impl GzFileStream {
    pub fn new(path: PathBuf, size: Option<usize>, compression: Option<Compression>) -> Self {
        let size = size.unwrap_or(1024 * 1024);
        let compression = compression.unwrap_or(Compression::default());
        Self {
            path,
            size,
            compression,
        }
    }

    pub fn reader(&self) -> io::Result<BufReader<MultiGzDecoder<File>>> {
        let file = OpenOptions::new()
            .read(true)
            .write(false)
            .create(false)
            .open(&self.path)?;
        Ok(BufReader::with_capacity(self.size, MultiGzDecoder::new(file)))
    }

    pub fn writer(&self) -> io::Result<BufWriter<GzEncoder<File>>> {
        let file = OpenOptions::new()
            .read(false)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)?;
        Ok(BufWriter::with_capacity(
            self.size,
            GzEncoder::new(file, self.compression),
        ))
    }
}

// Flush the buffer, write the gzip trailer and sync the file to disk.
pub fn finish_gz_writer(writer: BufWriter<GzEncoder<File>>) -> io::Result<()> {
    let encoder = writer.into_inner().map_err(|e| e.into_error())?;
    let mut file = encoder.finish()?;
    file.flush()?;
    file.sync_all()
}

// Output archives are written next to their final location with a ".tmp"
// suffix and only renamed into place once complete.
pub fn prepare_output(location: &Path) -> io::Result<PathBuf> {
    let mut tmp_location = location.as_os_str().to_owned();
    tmp_location.push(".tmp");
    let path = PathBuf::from(tmp_location);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(path)
}

// Rename the ".tmp" file to the original name.
pub fn finalize_output(location: &Path) -> io::Result<()> {
    std::fs::rename(prepare_output(location)?, location)
}

// Remove a partial ".tmp" file left behind by a failed job.
pub fn discard_output(location: &Path) -> io::Result<()> {
    let path = prepare_output(location)?;
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
