//! State snapshots.
//!
//! A snapshot is a flat, little-endian sequence of integer fields produced by
//! walking every component in a fixed order. Each component exposes one
//! traversal function taking a [`Serializer`]; the same function is used to
//! capture, to verify and to restore, so the field order can never drift
//! between the save and load paths.
//!
//! ## Blob layout
//!
//! ```text
//! 0x00  magic        "L64S"
//! 0x04  version      u32  (schema version of the running build)
//! 0x08  field_count  u32  (number of serializer calls in the traversal)
//! 0x0C  payload_len  u32
//! 0x10  crc32        u32  (of the payload)
//! 0x14  payload ...
//! ```
//!
//! Restoring is all-or-nothing: the header, checksum and a complete
//! verification pass over the running system must all succeed before a
//! single field is assigned.

use thiserror::Error;

/// Blob magic
pub const STATE_MAGIC: [u8; 4] = *b"L64S";

const HEADER_LEN: usize = 20;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("state blob truncated")]
    Truncated,
    #[error("not a state blob (bad magic)")]
    BadMagic,
    #[error("state version {found} does not match running build version {expected}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("state has {found} fields, running build expects {expected}")]
    FieldCountMismatch { expected: u32, found: u32 },
    #[error("state payload is {found} bytes, running build expects {expected}")]
    LengthMismatch { expected: usize, found: usize },
    #[error("state payload checksum mismatch")]
    ChecksumMismatch,
    #[error("state section mismatch: expected {expected}, found {found}")]
    SectionMismatch { expected: String, found: String },
    #[error("lookup table {name} differs from the running build")]
    TableIdentityMismatch { name: &'static str },
    #[error("state field {field} holds an out-of-range value")]
    OutOfRange { field: &'static str },
}

/// Fixed-width integer that can be stored in a snapshot
pub trait StateValue: Copy {
    const SIZE: usize;
    fn append(self, out: &mut Vec<u8>);
    fn decode(bytes: &[u8]) -> Self;
}

macro_rules! state_value {
    ($($t:ty),*) => {
        $(
            impl StateValue for $t {
                const SIZE: usize = std::mem::size_of::<$t>();

                fn append(self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }

                fn decode(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$t>()];
                    raw.copy_from_slice(&bytes[..Self::SIZE]);
                    <$t>::from_le_bytes(raw)
                }
            }
        )*
    };
}

state_value!(u8, u16, u32, u64, i8, i16, i32, i64);

impl StateValue for bool {
    const SIZE: usize = 1;

    fn append(self, out: &mut Vec<u8>) {
        out.push(self as u8);
    }

    fn decode(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Save,
    Verify,
    Load,
}

/// Traversal driver shared by capture, verification and restore.
///
/// Components call the typed methods in a fixed order. In `Save` mode values
/// are appended; in `Verify` mode they are read and checked but never
/// assigned; in `Load` mode they are read and assigned. The first error stops
/// all further reads.
pub struct Serializer<'a> {
    mode: Mode,
    output: Vec<u8>,
    input: &'a [u8],
    position: usize,
    fields: u32,
    error: Option<StateError>,
}

impl<'a> Serializer<'a> {
    fn saving() -> Self {
        Self {
            mode: Mode::Save,
            output: Vec::new(),
            input: &[],
            position: 0,
            fields: 0,
            error: None,
        }
    }

    fn reading(mode: Mode, input: &'a [u8]) -> Self {
        Self {
            mode,
            output: Vec::new(),
            input,
            position: 0,
            fields: 0,
            error: None,
        }
    }

    /// True while restoring (components may need to rebuild derived state)
    pub fn is_loading(&self) -> bool {
        self.mode == Mode::Load
    }

    fn fail(&mut self, error: StateError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.error.is_some() {
            return None;
        }
        let end = self.position + len;
        if end > self.input.len() {
            self.fail(StateError::Truncated);
            return None;
        }
        let input = self.input;
        let bytes = &input[self.position..end];
        self.position = end;
        Some(bytes)
    }

    /// One integer field
    pub fn integer<T: StateValue>(&mut self, value: &mut T) {
        self.fields += 1;
        match self.mode {
            Mode::Save => value.append(&mut self.output),
            Mode::Verify => {
                self.take(T::SIZE);
            }
            Mode::Load => {
                if let Some(bytes) = self.take(T::SIZE) {
                    *value = T::decode(bytes);
                }
            }
        }
    }

    /// An integer that must not exceed `max` (a count or index into fixed
    /// storage). Larger values are rejected before anything is loaded.
    pub fn bounded<T: StateValue + PartialOrd>(
        &mut self,
        field: &'static str,
        value: &mut T,
        max: T,
    ) {
        self.fields += 1;
        match self.mode {
            Mode::Save => value.append(&mut self.output),
            Mode::Verify | Mode::Load => {
                let Some(bytes) = self.take(T::SIZE) else {
                    return;
                };
                let decoded = T::decode(bytes);
                if decoded > max {
                    self.fail(StateError::OutOfRange { field });
                } else if self.mode == Mode::Load {
                    *value = decoded;
                }
            }
        }
    }

    /// A fixed-length run of integers, counted as one field
    pub fn array<T: StateValue>(&mut self, values: &mut [T]) {
        self.fields += 1;
        match self.mode {
            Mode::Save => {
                self.output.reserve(values.len() * T::SIZE);
                for value in values.iter() {
                    value.append(&mut self.output);
                }
            }
            Mode::Verify => {
                self.take(values.len() * T::SIZE);
            }
            Mode::Load => {
                if let Some(bytes) = self.take(values.len() * T::SIZE) {
                    for (value, chunk) in values.iter_mut().zip(bytes.chunks_exact(T::SIZE)) {
                        *value = T::decode(chunk);
                    }
                }
            }
        }
    }

    /// Floating point register, stored as its raw IEEE bits
    pub fn float(&mut self, value: &mut f64) {
        let mut bits = value.to_bits();
        self.integer(&mut bits);
        if self.mode == Mode::Load && self.error.is_none() {
            *value = f64::from_bits(bits);
        }
    }

    /// Named marker in front of each component's fields.
    ///
    /// Catches reordered or missing components with a readable error instead
    /// of silently misassigning fields.
    pub fn section(&mut self, name: &'static str) {
        self.fields += 1;
        match self.mode {
            Mode::Save => {
                self.output.push(name.len() as u8);
                self.output.extend_from_slice(name.as_bytes());
            }
            Mode::Verify | Mode::Load => {
                let Some(len) = self.take(1).map(|b| b[0] as usize) else {
                    return;
                };
                let Some(found) = self.take(len) else {
                    return;
                };
                if found != name.as_bytes() {
                    let found = String::from_utf8_lossy(found).into_owned();
                    self.fail(StateError::SectionMismatch {
                        expected: name.to_string(),
                        found,
                    });
                }
            }
        }
    }

    /// Identity of constant data that is not stored (lookup tables).
    pub fn identity(&mut self, name: &'static str, identity: u32) {
        self.fields += 1;
        match self.mode {
            Mode::Save => identity.append(&mut self.output),
            Mode::Verify | Mode::Load => {
                if let Some(bytes) = self.take(4) {
                    if u32::decode(bytes) != identity {
                        self.fail(StateError::TableIdentityMismatch { name });
                    }
                }
            }
        }
    }
}

/// A component (or whole machine) with a snapshot traversal
pub trait Serializable {
    fn serialize(&mut self, s: &mut Serializer<'_>);
}

/// Capture a snapshot of `target` tagged with schema `version`
pub fn capture<T: Serializable + ?Sized>(target: &mut T, version: u32) -> Vec<u8> {
    let mut s = Serializer::saving();
    target.serialize(&mut s);

    let payload = s.output;
    let mut blob = Vec::with_capacity(HEADER_LEN + payload.len());
    blob.extend_from_slice(&STATE_MAGIC);
    blob.extend_from_slice(&version.to_le_bytes());
    blob.extend_from_slice(&s.fields.to_le_bytes());
    blob.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    blob.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    blob.extend_from_slice(&payload);
    blob
}

/// Restore `target` from `blob`, or leave it untouched on any mismatch
pub fn restore<T: Serializable + ?Sized>(
    target: &mut T,
    version: u32,
    blob: &[u8],
) -> Result<(), StateError> {
    if blob.len() < HEADER_LEN {
        return Err(StateError::Truncated);
    }
    if blob[0..4] != STATE_MAGIC {
        return Err(StateError::BadMagic);
    }
    let header = |offset: usize| u32::decode(&blob[offset..offset + 4]);
    let found_version = header(4);
    let field_count = header(8);
    let payload_len = header(12) as usize;
    let checksum = header(16);

    if found_version != version {
        return Err(StateError::VersionMismatch {
            expected: version,
            found: found_version,
        });
    }
    let payload = &blob[HEADER_LEN..];
    if payload.len() != payload_len {
        return Err(StateError::LengthMismatch {
            expected: payload_len,
            found: payload.len(),
        });
    }
    if crc32fast::hash(payload) != checksum {
        return Err(StateError::ChecksumMismatch);
    }

    let mut verify = Serializer::reading(Mode::Verify, payload);
    target.serialize(&mut verify);
    if let Some(error) = verify.error {
        return Err(error);
    }
    if verify.fields != field_count {
        return Err(StateError::FieldCountMismatch {
            expected: verify.fields,
            found: field_count,
        });
    }
    if verify.position != payload.len() {
        return Err(StateError::LengthMismatch {
            expected: verify.position,
            found: payload.len(),
        });
    }

    let mut load = Serializer::reading(Mode::Load, payload);
    target.serialize(&mut load);
    match load.error {
        Some(error) => Err(error),
        None => Ok(()),
    }
}
