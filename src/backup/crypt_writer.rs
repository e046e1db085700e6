use std::io::Write;

use anyhow::Error;

use super::CryptConfig;

/// Encrypted output is staged here before it reaches the inner
/// writer. Sized well above the cipher block so chunking stays coarse.
const STAGE_SIZE: usize = 128 * 1024;

fn cipher_io_error(err: openssl::error::ErrorStack) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, format!("cipher failure: {}", err))
}

/// Write wrapper encrypting everything that passes through.
///
/// The random IV is written to the inner writer before any payload, so
/// the repository file is self-contained.
pub struct CryptWriter<W> {
    writer: W,
    block_size: usize,
    stage: Vec<u8>,
    crypter: openssl::symm::Crypter,
    header_written: bool,
    iv: [u8; 16],
}

impl<W: Write> CryptWriter<W> {
    pub fn new(writer: W, config: &CryptConfig) -> Result<Self, Error> {
        let mut iv = [0u8; 16];
        openssl::rand::rand_bytes(&mut iv)?;
        let crypter = config.data_crypter(&iv, openssl::symm::Mode::Encrypt)?;

        Ok(Self {
            writer,
            block_size: config.cipher().block_size(),
            stage: vec![0u8; STAGE_SIZE],
            crypter,
            header_written: false,
            iv,
        })
    }

    pub fn finish(mut self) -> Result<W, Error> {
        if !self.header_written {
            self.writer.write_all(&self.iv)?;
        }
        let tail = self.crypter.finalize(&mut self.stage)?;
        self.writer.write_all(&self.stage[..tail])?;
        self.writer.flush()?;
        Ok(self.writer)
    }
}

impl<W: Write> Write for CryptWriter<W> {
    fn write(&mut self, buf: &[u8]) -> Result<usize, std::io::Error> {
        if !self.header_written {
            self.writer.write_all(&self.iv)?;
            self.header_written = true;
        }

        // the cipher can carry one held-back block into each update,
        // so a chunk may grow by block_size on the way out
        let chunk_max = self.stage.len() - self.block_size;
        for chunk in buf.chunks(chunk_max) {
            let staged = self
                .crypter
                .update(chunk, &mut self.stage)
                .map_err(cipher_io_error)?;
            self.writer.write_all(&self.stage[..staged])?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), std::io::Error> {
        // a partial cipher block stays in the crypter until finish
        self.writer.flush()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::CipherType;
    use openssl::symm::Mode;

    fn decrypt(config: &CryptConfig, encrypted: &[u8]) -> Result<Vec<u8>, Error> {
        let mut iv = [0u8; 16];
        iv.copy_from_slice(&encrypted[..16]);
        let mut crypter = config.data_crypter(&iv, Mode::Decrypt)?;
        let mut out = vec![0u8; encrypted.len() + 16];
        let mut count = crypter.update(&encrypted[16..], &mut out)?;
        count += crypter.finalize(&mut out[count..])?;
        out.truncate(count);
        Ok(out)
    }

    #[test]
    fn test_encrypt_roundtrip() -> Result<(), Error> {
        let config = CryptConfig::new(CipherType::Aes256Cbc, "secret")?;

        let mut writer = CryptWriter::new(Vec::new(), &config)?;
        let payload = b"some cluster file content that is not block aligned.";
        writer.write_all(payload)?;
        let encrypted = writer.finish()?;

        assert!(encrypted.len() > 16);
        assert_ne!(&encrypted[16..16 + 8], &payload[..8]);
        assert_eq!(decrypt(&config, &encrypted)?, payload);
        Ok(())
    }

    #[test]
    fn test_payload_larger_than_stage() -> Result<(), Error> {
        let config = CryptConfig::new(CipherType::Aes256Cbc, "secret")?;

        // forces the chunked path in write()
        let payload: Vec<u8> = (0..3 * STAGE_SIZE).map(|i| (i % 251) as u8).collect();

        let mut writer = CryptWriter::new(Vec::new(), &config)?;
        writer.write_all(&payload)?;
        let encrypted = writer.finish()?;

        assert_eq!(decrypt(&config, &encrypted)?, payload);
        Ok(())
    }

    #[test]
    fn test_empty_payload_still_writes_header() -> Result<(), Error> {
        let config = CryptConfig::new(CipherType::Aes256Cbc, "secret")?;
        let writer = CryptWriter::new(Vec::new(), &config)?;
        let encrypted = writer.finish()?;
        // IV plus one padding block
        assert_eq!(encrypted.len(), 16 + 16);
        Ok(())
    }
}
