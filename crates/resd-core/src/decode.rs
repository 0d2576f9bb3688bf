//! Decode engine for provider-obfuscated media.
//!
//! A [`Transform`] is position-addressed, so the same transform decodes a
//! whole buffer or a stream of chunks. [`StreamDecoder`] holds back the first
//! [`SIGNATURE_LEN`] bytes until it can tell whether the input needs the
//! transform or is already a standard file (passed through untouched), and
//! rejects output that does not carry a recognizable signature.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use thiserror::Error;

use crate::signature::{detect_format, MediaFormat, SIGNATURE_LEN};

const READ_CHUNK: usize = 64 * 1024;

/// Decode errors.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The parameter did not produce a recognizable media file.
    #[error("decode parameter does not match the content")]
    Mismatch,

    /// The parameter could not be parsed for this provider.
    #[error("invalid decode parameter: {0}")]
    InvalidParameter(String),

    /// No provider is registered under this id.
    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    /// IO error while reading or writing a file.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for decode operations.
pub type Result<T> = std::result::Result<T, DecodeError>;

/// A reversible, position-addressed byte transform.
pub trait Transform: Send + Sync + fmt::Debug {
    /// Decodes `chunk` in place; `offset` is the chunk's position in the file.
    fn apply(&self, offset: u64, chunk: &mut [u8]);

    /// Returns true if the transform never changes bytes.
    fn is_identity(&self) -> bool {
        false
    }
}

/// Leaves bytes unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl Transform for Identity {
    fn apply(&self, _offset: u64, _chunk: &mut [u8]) {}

    fn is_identity(&self) -> bool {
        true
    }
}

/// XORs a keystream over the head of the file; bytes past the keystream are
/// stored in the clear.
#[derive(Clone)]
pub struct XorPrefix {
    keystream: Vec<u8>,
}

impl XorPrefix {
    /// Creates the transform from a raw keystream.
    pub fn new(keystream: Vec<u8>) -> Self {
        Self { keystream }
    }

    /// Parses a base64-encoded keystream.
    pub fn from_base64(param: &str) -> Result<Self> {
        let keystream = STANDARD
            .decode(param.trim())
            .map_err(|e| DecodeError::InvalidParameter(e.to_string()))?;
        if keystream.is_empty() {
            return Err(DecodeError::InvalidParameter("empty keystream".into()));
        }
        Ok(Self::new(keystream))
    }

    /// Length of the obfuscated head.
    pub fn len(&self) -> usize {
        self.keystream.len()
    }

    /// Returns true if the keystream is empty.
    pub fn is_empty(&self) -> bool {
        self.keystream.is_empty()
    }
}

impl fmt::Debug for XorPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XorPrefix")
            .field("len", &self.keystream.len())
            .finish()
    }
}

impl Transform for XorPrefix {
    fn apply(&self, offset: u64, chunk: &mut [u8]) {
        let len = self.keystream.len() as u64;
        if offset >= len {
            return;
        }
        let start = offset as usize;
        for (byte, key) in chunk.iter_mut().zip(&self.keystream[start..]) {
            *byte ^= key;
        }
    }
}

/// XORs every byte with a single key byte.
#[derive(Debug, Clone, Copy)]
pub struct XorByte(pub u8);

impl XorByte {
    /// Parses the key as two hex digits, with or without a `0x` prefix.
    pub fn from_hex(param: &str) -> Result<Self> {
        let digits = param.trim().trim_start_matches("0x");
        u8::from_str_radix(digits, 16)
            .map(XorByte)
            .map_err(|e| DecodeError::InvalidParameter(e.to_string()))
    }
}

impl Transform for XorByte {
    fn apply(&self, _offset: u64, chunk: &mut [u8]) {
        for byte in chunk {
            *byte ^= self.0;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Passthrough,
    Decode,
}

/// Incremental decoder.
///
/// Feed chunks with [`push`](Self::push) and write whatever it returns; call
/// [`finish`](Self::finish) at end of input. Nothing is emitted until the
/// head has been validated, so a mismatch never produces partial output.
#[derive(Debug)]
pub struct StreamDecoder<'a> {
    transform: &'a dyn Transform,
    mode: Option<Mode>,
    head: Vec<u8>,
    offset: u64,
    format: Option<MediaFormat>,
}

impl<'a> StreamDecoder<'a> {
    /// Creates a decoder for one file.
    pub fn new(transform: &'a dyn Transform) -> Self {
        Self {
            transform,
            mode: None,
            head: Vec::with_capacity(SIGNATURE_LEN),
            offset: 0,
            format: None,
        }
    }

    /// Consumes the next input chunk, returning decoded bytes ready to write.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<u8>> {
        match self.mode {
            None => {
                self.head.extend_from_slice(chunk);
                if self.head.len() < SIGNATURE_LEN {
                    return Ok(Vec::new());
                }
                self.settle()
            }
            Some(mode) => {
                let mut out = chunk.to_vec();
                if mode == Mode::Decode {
                    self.transform.apply(self.offset, &mut out);
                }
                self.offset += out.len() as u64;
                Ok(out)
            }
        }
    }

    /// Ends the input, returning any held-back bytes and the detected format.
    pub fn finish(mut self) -> Result<(Vec<u8>, Option<MediaFormat>)> {
        let rest = if self.mode.is_none() {
            self.settle()?
        } else {
            Vec::new()
        };
        Ok((rest, self.format))
    }

    /// Returns the detected format once the head has been validated.
    pub fn format(&self) -> Option<MediaFormat> {
        self.format
    }

    fn settle(&mut self) -> Result<Vec<u8>> {
        let raw = std::mem::take(&mut self.head);
        let mut decoded = raw.clone();
        self.transform.apply(0, &mut decoded);

        // Loose signatures (bare frame sync) can match obfuscated bytes, so
        // the decoded reading is checked first.
        let (mode, head, format) = match (detect_format(&decoded), detect_format(&raw)) {
            (Some(format), _) => (Mode::Decode, decoded, Some(format)),
            // Already a standard file; decoding it would re-obfuscate.
            (None, Some(format)) => (Mode::Passthrough, raw, Some(format)),
            (None, None) if self.transform.is_identity() => (Mode::Decode, decoded, None),
            (None, None) => return Err(DecodeError::Mismatch),
        };

        self.mode = Some(mode);
        self.format = format;
        self.offset = head.len() as u64;
        Ok(head)
    }
}

/// Decodes a complete buffer.
pub fn decode(data: &[u8], transform: &dyn Transform) -> Result<Vec<u8>> {
    let mut decoder = StreamDecoder::new(transform);
    let mut out = decoder.push(data)?;
    let (rest, _) = decoder.finish()?;
    out.extend_from_slice(&rest);
    Ok(out)
}

/// Decodes a file obtained outside the proxy, writing `<stem>_decoded.<ext>`
/// next to it. Returns the output path.
///
/// The extension comes from the decoded signature, falling back to the
/// input's own extension.
pub fn decode_local_file(path: &Path, transform: &dyn Transform) -> Result<PathBuf> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut decoder = StreamDecoder::new(transform);
    let mut buf = vec![0u8; READ_CHUNK];
    let mut output: Option<OutputFile> = None;

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        let out = decoder.push(&buf[..n])?;
        if out.is_empty() {
            continue;
        }
        if output.is_none() {
            let target = decoded_path(path, decoder.format().map(|f| f.extension()));
            output = Some(OutputFile::create(target)?);
        }
        if let Some(file) = output.as_mut() {
            file.write_all(&out)?;
        }
    }

    let (rest, format) = decoder.finish()?;
    let mut file = match output {
        Some(file) => file,
        None => OutputFile::create(decoded_path(path, format.map(|f| f.extension())))?,
    };
    file.write_all(&rest)?;
    Ok(file.commit()?)
}

/// A file written under a `.part` name and moved into place on commit.
///
/// Dropping it uncommitted removes the partial file.
#[derive(Debug)]
pub(crate) struct OutputFile {
    target: PathBuf,
    part: PathBuf,
    writer: Option<BufWriter<File>>,
    replace: bool,
}

impl OutputFile {
    /// Opens `<target>.part`; commit replaces an existing target.
    pub(crate) fn create(target: PathBuf) -> io::Result<Self> {
        let part = part_path(&target);
        let file = File::create(&part)?;
        Ok(Self::open(target, part, file, true))
    }

    /// Reserves `target`. Fails with `AlreadyExists` while the target or its
    /// `.part` file exists, and commit never replaces a target that appeared
    /// in the meantime.
    pub(crate) fn create_new(target: PathBuf) -> io::Result<Self> {
        let part = part_path(&target);
        let file = OpenOptions::new().write(true).create_new(true).open(&part)?;
        if target.try_exists()? {
            drop(file);
            let _ = std::fs::remove_file(&part);
            return Err(already_exists(&target));
        }
        Ok(Self::open(target, part, file, false))
    }

    fn open(target: PathBuf, part: PathBuf, file: File, replace: bool) -> Self {
        Self {
            target,
            part,
            writer: Some(BufWriter::new(file)),
            replace,
        }
    }

    pub(crate) fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.write_all(data),
            None => Err(io::Error::other("output already committed")),
        }
    }

    pub(crate) fn commit(mut self) -> io::Result<PathBuf> {
        if let Err(e) = self.move_into_place() {
            let _ = std::fs::remove_file(&self.part);
            return Err(e);
        }
        Ok(std::mem::take(&mut self.target))
    }

    fn move_into_place(&mut self) -> io::Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        if self.replace {
            std::fs::rename(&self.part, &self.target)
        } else {
            move_new(&self.part, &self.target)
        }
    }
}

impl Drop for OutputFile {
    fn drop(&mut self) {
        if self.writer.take().is_some() {
            let _ = std::fs::remove_file(&self.part);
        }
    }
}

fn part_path(target: &Path) -> PathBuf {
    let mut part = target.as_os_str().to_owned();
    part.push(".part");
    PathBuf::from(part)
}

fn already_exists(target: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("{} already exists", target.display()),
    )
}

/// Moves `part` to `target` without replacing an existing file.
fn move_new(part: &Path, target: &Path) -> io::Result<()> {
    match std::fs::hard_link(part, target) {
        Ok(()) => std::fs::remove_file(part),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(already_exists(target)),
        // No hard links on this filesystem.
        Err(_) => {
            if target.try_exists()? {
                return Err(already_exists(target));
            }
            std::fs::rename(part, target)
        }
    }
}

fn decoded_path(input: &Path, extension: Option<&str>) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "resource".to_string());
    let extension = extension
        .map(str::to_string)
        .or_else(|| input.extension().map(|e| e.to_string_lossy().into_owned()));
    let name = match extension {
        Some(ext) => format!("{}_decoded.{}", stem, ext),
        None => format!("{}_decoded", stem),
    };
    input.with_file_name(name)
}
