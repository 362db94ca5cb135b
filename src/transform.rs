//! Reversible byte-stream filters applied to committed artifacts.
//!
//! Writing stacks plaintext → cipher → gzip → file; reading reverses it. The
//! destination file name carries one suffix per applied filter, `.lock` for
//! encryption followed by `.gz` for compression, so a reader can tell which
//! filters to undo from the name alone.

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use sha2::Sha256;

use crate::error::IngestError;

pub const ENCRYPTED_SUFFIX: &str = ".lock";
pub const COMPRESSED_SUFFIX: &str = ".gz";

const MAGIC: &[u8; 7] = b"MIRENC1";
const SALT_LEN: usize = 16;
const IV_LEN: usize = 16;
const KDF_ROUNDS: u32 = 100_000;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

#[derive(Clone, PartialEq, Eq)]
pub struct Passphrase(String);

impl Passphrase {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Reads the passphrase from `var`; an unset or blank variable yields `None`.
    pub fn from_env(var: &str) -> Option<Self> {
        std::env::var(var)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(Self)
    }

    fn derive_key(&self, salt: &[u8]) -> [u8; 32] {
        let mut key = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(self.0.as_bytes(), salt, KDF_ROUNDS, &mut key);
        key
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Passphrase(..)")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transforms {
    pub encrypt: Option<Passphrase>,
    pub compress: bool,
}

impl Transforms {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn compressed() -> Self {
        Self {
            encrypt: None,
            compress: true,
        }
    }

    pub fn encrypted(passphrase: Passphrase) -> Self {
        Self {
            encrypt: Some(passphrase),
            compress: false,
        }
    }

    pub fn is_identity(&self) -> bool {
        self.encrypt.is_none() && !self.compress
    }

    pub fn suffix(&self) -> String {
        let mut suffix = String::new();
        if self.encrypt.is_some() {
            suffix.push_str(ENCRYPTED_SUFFIX);
        }
        if self.compress {
            suffix.push_str(COMPRESSED_SUFFIX);
        }
        suffix
    }

    pub fn file_name(&self, name: &str) -> String {
        format!("{name}{}", self.suffix())
    }
}

/// Which filters a committed file name says were applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedFilters {
    pub encrypted: bool,
    pub compressed: bool,
}

impl AppliedFilters {
    pub fn from_name(name: &str) -> Self {
        let (compressed, rest) = match name.strip_suffix(COMPRESSED_SUFFIX) {
            Some(rest) => (true, rest),
            None => (false, name),
        };
        Self {
            encrypted: rest.ends_with(ENCRYPTED_SUFFIX),
            compressed,
        }
    }

    /// Pairs the filters named by a file with the passphrase needed to undo them.
    pub fn into_transforms(self, passphrase: Option<&Passphrase>) -> Result<Transforms, IngestError> {
        let encrypt = if self.encrypted {
            Some(passphrase.cloned().ok_or_else(|| {
                IngestError::Cipher("encrypted artifact but no passphrase configured".to_string())
            })?)
        } else {
            None
        };
        Ok(Transforms {
            encrypt,
            compress: self.compressed,
        })
    }
}

pub struct CipherWriter<W: Write> {
    inner: W,
    cipher: Aes256Ctr,
    buf: Vec<u8>,
}

impl<W: Write> CipherWriter<W> {
    pub fn new(mut inner: W, passphrase: &Passphrase) -> io::Result<Self> {
        let salt: [u8; SALT_LEN] = rand::random();
        let iv: [u8; IV_LEN] = rand::random();
        let key = passphrase.derive_key(&salt);
        inner.write_all(MAGIC)?;
        inner.write_all(&salt)?;
        inner.write_all(&iv)?;
        Ok(Self {
            inner,
            cipher: Aes256Ctr::new(&key.into(), &iv.into()),
            buf: Vec::new(),
        })
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CipherWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.clear();
        self.buf.extend_from_slice(data);
        self.cipher.apply_keystream(&mut self.buf);
        self.inner.write_all(&self.buf)?;
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

pub struct CipherReader<R: Read> {
    inner: R,
    cipher: Aes256Ctr,
}

impl<R: Read> CipherReader<R> {
    pub fn new(mut inner: R, passphrase: &Passphrase) -> io::Result<Self> {
        let mut magic = [0u8; MAGIC.len()];
        inner.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "missing encryption header",
            ));
        }
        let mut salt = [0u8; SALT_LEN];
        let mut iv = [0u8; IV_LEN];
        inner.read_exact(&mut salt)?;
        inner.read_exact(&mut iv)?;
        let key = passphrase.derive_key(&salt);
        Ok(Self {
            inner,
            cipher: Aes256Ctr::new(&key.into(), &iv.into()),
        })
    }
}

impl<R: Read> Read for CipherReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.inner.read(buf)?;
        self.cipher.apply_keystream(&mut buf[..read]);
        Ok(read)
    }
}

pub enum TransformWriter<W: Write> {
    Plain(W),
    Compressed(GzEncoder<W>),
    Encrypted(CipherWriter<W>),
    EncryptedCompressed(CipherWriter<GzEncoder<W>>),
}

impl<W: Write> TransformWriter<W> {
    pub fn new(inner: W, transforms: &Transforms) -> io::Result<Self> {
        let writer = match (&transforms.encrypt, transforms.compress) {
            (None, false) => TransformWriter::Plain(inner),
            (None, true) => {
                TransformWriter::Compressed(GzEncoder::new(inner, Compression::default()))
            }
            (Some(passphrase), false) => {
                TransformWriter::Encrypted(CipherWriter::new(inner, passphrase)?)
            }
            (Some(passphrase), true) => TransformWriter::EncryptedCompressed(CipherWriter::new(
                GzEncoder::new(inner, Compression::default()),
                passphrase,
            )?),
        };
        Ok(writer)
    }

    /// Flushes every filter and hands back the underlying writer.
    pub fn finish(self) -> io::Result<W> {
        match self {
            TransformWriter::Plain(mut inner) => {
                inner.flush()?;
                Ok(inner)
            }
            TransformWriter::Compressed(encoder) => encoder.finish(),
            TransformWriter::Encrypted(mut writer) => {
                writer.flush()?;
                Ok(writer.into_inner())
            }
            TransformWriter::EncryptedCompressed(mut writer) => {
                writer.flush()?;
                writer.into_inner().finish()
            }
        }
    }
}

impl<W: Write> Write for TransformWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        match self {
            TransformWriter::Plain(inner) => inner.write(data),
            TransformWriter::Compressed(inner) => inner.write(data),
            TransformWriter::Encrypted(inner) => inner.write(data),
            TransformWriter::EncryptedCompressed(inner) => inner.write(data),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            TransformWriter::Plain(inner) => inner.flush(),
            TransformWriter::Compressed(inner) => inner.flush(),
            TransformWriter::Encrypted(inner) => inner.flush(),
            TransformWriter::EncryptedCompressed(inner) => inner.flush(),
        }
    }
}

/// Wraps `inner` so reads yield the original plaintext.
pub fn reverse_reader<'a, R: Read + 'a>(
    inner: R,
    transforms: &Transforms,
) -> io::Result<Box<dyn Read + 'a>> {
    let reader: Box<dyn Read + 'a> = match (&transforms.encrypt, transforms.compress) {
        (None, false) => Box::new(inner),
        (None, true) => Box::new(GzDecoder::new(inner)),
        (Some(passphrase), false) => Box::new(CipherReader::new(inner, passphrase)?),
        (Some(passphrase), true) => {
            Box::new(CipherReader::new(GzDecoder::new(inner), passphrase)?)
        }
    };
    Ok(reader)
}

pub fn open_plaintext(path: &Path, transforms: &Transforms) -> io::Result<Box<dyn Read>> {
    let file = File::open(path)?;
    reverse_reader(BufReader::new(file), transforms)
}
