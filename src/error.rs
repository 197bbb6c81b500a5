use failure::Fail;
use std::io;

/// Failures while reading or writing a snapshot. None of these are recoverable: a
/// half-loaded heap is never handed to the interpreter.
#[derive(Debug, Fail)]
pub enum ImageError {
    #[fail(display = "I/O error: {}", _0)]
    Io(#[cause] io::Error),
    #[fail(display = "not an image file (no known version word, first word {:#010x})", _0)]
    BadVersion(u32),
    #[fail(display = "64-bit image format {} is not supported", _0)]
    Unsupported64Bit(u32),
    #[fail(display = "malformed segment at offset {}: {}", offset, reason)]
    InvalidSegment { offset: usize, reason: String },
    #[fail(display = "object {:#x} has unknown format {}", oop, format)]
    UnknownFormat { oop: u64, format: u8 },
    #[fail(display = "object {:#x} refers to {:#x}, which is not an object", from, oop)]
    DanglingOop { from: u64, oop: u64 },
    #[fail(display = "cannot resolve the class of object {:#x}", _0)]
    MissingClass(u64),
    #[fail(display = "special object {} is missing", _0)]
    MissingSpecialObject(usize),
    #[fail(display = "size mismatch: {}", _0)]
    SizeMismatch(String),
    #[fail(display = "cannot write snapshot: {}", _0)]
    CannotSnapshot(String),
}

impl From<io::Error> for ImageError {
    fn from(err: io::Error) -> Self {
        ImageError::Io(err)
    }
}

/// Host-level faults. The interpreter stops when one of these surfaces; Smalltalk-level
/// conditions (doesNotUnderstand:, cannotReturn:, primitive failure) are sends, not errors.
#[derive(Debug, Fail)]
pub enum VmError {
    #[fail(display = "illegal bytecode {:#04x} at pc {}", byte, pc)]
    IllegalBytecode { byte: u8, pc: usize },
    #[fail(display = "illegal store: {}", _0)]
    IllegalStore(String),
    #[fail(display = "recursive doesNotUnderstand: for {}", _0)]
    RecursiveDoesNotUnderstand(String),
    #[fail(display = "scheduler could not find a runnable process")]
    NoRunnableProcess,
    #[fail(display = "bad context: {}", _0)]
    BadContext(String),
    #[fail(display = "{}", _0)]
    Image(#[cause] ImageError),
}

impl From<ImageError> for VmError {
    fn from(err: ImageError) -> Self {
        VmError::Image(err)
    }
}
