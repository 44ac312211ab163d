//! Streaming SHA-256 over files and readers.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use sha2::{Digest, Sha256};

const CHUNK_SIZE: usize = 64 * 1024;

/// Hex digest plus the number of bytes that were hashed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksum {
    pub hex: String,
    pub bytes: u64,
}

pub fn sha256_file(path: &Path) -> io::Result<Checksum> {
    let file = File::open(path)?;
    sha256_reader(file)
}

pub fn sha256_reader<R: Read>(reader: R) -> io::Result<Checksum> {
    sha256_copy(reader, io::sink())
}

/// Copies `reader` into `writer` and hashes exactly the bytes written.
pub fn sha256_copy<R: Read, W: Write>(mut reader: R, mut writer: W) -> io::Result<Checksum> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }

    writer.flush()?;
    Ok(Checksum {
        hex: hex::encode(hasher.finalize()),
        bytes: total,
    })
}

pub fn sha256_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
