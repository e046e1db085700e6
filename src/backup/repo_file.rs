//! Repository output pipeline.
//!
//! A repository file is the source bytes run through optional
//! compression, then optional encryption. The pipeline is a stack of
//! `Write` wrappers selected once at open time; every combination
//! reports the final on-disk byte count through the innermost counter.

use std::io::Write;

use anyhow::Error;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::config::CompressType;

use super::{CryptConfig, CryptWriter};

/// Write-through byte counter at the bottom of the stack.
pub struct CountWriter<W> {
    writer: W,
    count: u64,
}

impl<W: Write> CountWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, count: 0 }
    }

    pub fn finish(self) -> (W, u64) {
        (self.writer, self.count)
    }
}

impl<W: Write> Write for CountWriter<W> {
    fn write(&mut self, buf: &[u8]) -> Result<usize, std::io::Error> {
        let count = self.writer.write(buf)?;
        self.count += count as u64;
        Ok(count)
    }

    fn flush(&mut self) -> Result<(), std::io::Error> {
        self.writer.flush()
    }
}

enum RepoWriterState<W: Write> {
    Plain { writer: CountWriter<W> },
    Gz { compr: GzEncoder<CountWriter<W>> },
    Zst { compr: zstd::stream::write::Encoder<'static, CountWriter<W>> },
    Encrypted { crypt: CryptWriter<CountWriter<W>> },
    EncryptedGz { compr: GzEncoder<CryptWriter<CountWriter<W>>> },
    EncryptedZst { compr: zstd::stream::write::Encoder<'static, CryptWriter<CountWriter<W>>> },
}

/// Composed repository writer.
pub struct RepoFileWriter<W: Write> {
    state: RepoWriterState<W>,
}

impl<W: Write> RepoFileWriter<W> {
    pub fn new(
        writer: W,
        compress_type: CompressType,
        compress_level: u32,
        crypt: Option<&CryptConfig>,
    ) -> Result<Self, Error> {
        let counter = CountWriter::new(writer);
        let state = match (crypt, compress_type) {
            (None, CompressType::None) => RepoWriterState::Plain { writer: counter },
            (None, CompressType::Gz) => RepoWriterState::Gz {
                compr: GzEncoder::new(counter, Compression::new(compress_level)),
            },
            (None, CompressType::Zst) => RepoWriterState::Zst {
                compr: zstd::stream::write::Encoder::new(counter, compress_level as i32)?,
            },
            (Some(config), CompressType::None) => RepoWriterState::Encrypted {
                crypt: CryptWriter::new(counter, config)?,
            },
            (Some(config), CompressType::Gz) => {
                let crypt = CryptWriter::new(counter, config)?;
                RepoWriterState::EncryptedGz {
                    compr: GzEncoder::new(crypt, Compression::new(compress_level)),
                }
            }
            (Some(config), CompressType::Zst) => {
                let crypt = CryptWriter::new(counter, config)?;
                RepoWriterState::EncryptedZst {
                    compr: zstd::stream::write::Encoder::new(crypt, compress_level as i32)?,
                }
            }
        };
        Ok(Self { state })
    }

    /// Flush all layers; returns the inner writer and the repository
    /// byte count.
    pub fn finish(self) -> Result<(W, u64), Error> {
        let counter = match self.state {
            RepoWriterState::Plain { writer } => writer,
            RepoWriterState::Gz { compr } => compr.finish()?,
            RepoWriterState::Zst { compr } => compr.finish()?,
            RepoWriterState::Encrypted { crypt } => crypt.finish()?,
            RepoWriterState::EncryptedGz { compr } => compr.finish()?.finish()?,
            RepoWriterState::EncryptedZst { compr } => compr.finish()?.finish()?,
        };
        let (writer, count) = counter.finish();
        Ok((writer, count))
    }
}

impl<W: Write> Write for RepoFileWriter<W> {
    fn write(&mut self, buf: &[u8]) -> Result<usize, std::io::Error> {
        match self.state {
            RepoWriterState::Plain { ref mut writer } => writer.write(buf),
            RepoWriterState::Gz { ref mut compr } => compr.write(buf),
            RepoWriterState::Zst { ref mut compr } => compr.write(buf),
            RepoWriterState::Encrypted { ref mut crypt } => crypt.write(buf),
            RepoWriterState::EncryptedGz { ref mut compr } => compr.write(buf),
            RepoWriterState::EncryptedZst { ref mut compr } => compr.write(buf),
        }
    }

    fn flush(&mut self) -> Result<(), std::io::Error> {
        match self.state {
            RepoWriterState::Plain { ref mut writer } => writer.flush(),
            RepoWriterState::Gz { ref mut compr } => compr.flush(),
            RepoWriterState::Zst { ref mut compr } => compr.flush(),
            RepoWriterState::Encrypted { ref mut crypt } => crypt.flush(),
            RepoWriterState::EncryptedGz { ref mut compr } => compr.flush(),
            RepoWriterState::EncryptedZst { ref mut compr } => compr.flush(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::CipherType;
    use std::io::Read;

    fn roundtrip(compress_type: CompressType, crypt: bool) -> Result<(), Error> {
        let config = if crypt {
            Some(CryptConfig::new(CipherType::Aes256Cbc, "secret")?)
        } else {
            None
        };

        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();

        let mut writer = RepoFileWriter::new(Vec::new(), compress_type, 3, config.as_ref())?;
        writer.write_all(&payload)?;
        let (stored, repo_size) = writer.finish()?;
        assert_eq!(repo_size, stored.len() as u64);

        // undo encryption first, then compression
        let plain = if let Some(config) = &config {
            let mut iv = [0u8; 16];
            iv.copy_from_slice(&stored[..16]);
            let mut crypter = config.data_crypter(&iv, openssl::symm::Mode::Decrypt)?;
            let mut out = vec![0u8; stored.len() + 16];
            let mut count = crypter.update(&stored[16..], &mut out)?;
            count += crypter.finalize(&mut out[count..])?;
            out.truncate(count);
            out
        } else {
            stored
        };

        let decoded = match compress_type {
            CompressType::None => plain,
            CompressType::Gz => {
                let mut out = Vec::new();
                flate2::read::GzDecoder::new(&plain[..]).read_to_end(&mut out)?;
                out
            }
            CompressType::Zst => zstd::stream::decode_all(&plain[..])?,
        };

        assert_eq!(decoded, payload);
        Ok(())
    }

    #[test]
    fn test_plain() -> Result<(), Error> {
        roundtrip(CompressType::None, false)
    }

    #[test]
    fn test_gz() -> Result<(), Error> {
        roundtrip(CompressType::Gz, false)
    }

    #[test]
    fn test_zst() -> Result<(), Error> {
        roundtrip(CompressType::Zst, false)
    }

    #[test]
    fn test_encrypted() -> Result<(), Error> {
        roundtrip(CompressType::None, true)
    }

    #[test]
    fn test_encrypted_gz() -> Result<(), Error> {
        roundtrip(CompressType::Gz, true)
    }

    #[test]
    fn test_encrypted_zst() -> Result<(), Error> {
        roundtrip(CompressType::Zst, true)
    }
}
