use std::io::Read;

use anyhow::Error;

/// Read wrapper computing a SHA-1 and byte count over everything that
/// passes through.
pub struct ChecksumReader<R> {
    reader: R,
    hasher: openssl::sha::Sha1,
    size: u64,
}

impl<R: Read> ChecksumReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            hasher: openssl::sha::Sha1::new(),
            size: 0,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn finish(self) -> Result<(R, String, u64), Error> {
        let digest = self.hasher.finish();
        Ok((self.reader, hex::encode(digest), self.size))
    }
}

impl<R: Read> Read for ChecksumReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, std::io::Error> {
        let count = self.reader.read(buf)?;
        if count > 0 {
            self.hasher.update(&buf[..count]);
            self.size += count as u64;
        }
        Ok(count)
    }
}
