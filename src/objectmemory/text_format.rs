//! The text format is a debugging dump of old space, independent of word size and header
//! layout, meant to be read and diffed by people.
//!
//! Tokens:
//! OOP: `@16rDEADBEEF` (the object's address in the snapshot)
//! integers: `[-+]16rDEADBEEF`
//! characters: `$16r263A`
//! format: `#byte`|`#word`|`#ptr`|`#method`|`#float`
//!
//! Objects start with lines containing "!Object: <OOP> ofClass: <OOP> format: <format>!"
//!
//! Pointer objects are followed by one slot per line.
//!
//! Byte objects contain a hex-encoded string of their contents, with spaces between bytes
//! and at most 16 bytes per line. Word objects print one big-endian word per group, four
//! words per line.
//!
//! Method objects start with their header and literals, one per line (as in a pointer object),
//! followed by the bytecodes in hex.

use std::fmt::{self, Display, Formatter};
use std::fs::File;
use std::io::{self, prelude::*, BufWriter};
use std::path::Path;

use super::{Body, ObjectMemory, OOP};
use crate::error::ImageError;

pub enum TextFormat {}

#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Debug)]
enum InnerFormat {
    Byte,
    Word,
    Ptr,
    Method,
    Float,
}

impl Display for InnerFormat {
    fn fmt(&self, f: &mut Formatter) -> Result<(), fmt::Error> {
        let s = match self {
            InnerFormat::Byte => "#byte",
            InnerFormat::Word => "#word",
            InnerFormat::Ptr => "#ptr",
            InnerFormat::Method => "#method",
            InnerFormat::Float => "#float",
        };
        write!(f, "{}", s)
    }
}

fn obj_format(body: &Body) -> InnerFormat {
    match body {
        Body::Pointers(_) => InnerFormat::Ptr,
        Body::Words(_) => InnerFormat::Word,
        Body::Bytes(_) => InnerFormat::Byte,
        Body::Float(_) => InnerFormat::Float,
        Body::Method { .. } => InnerFormat::Method,
    }
}

struct Token<'a>(&'a ObjectMemory, OOP);

impl<'a> Display for Token<'a> {
    fn fmt(&self, f: &mut Formatter) -> Result<(), fmt::Error> {
        match self.1 {
            OOP::Int(value) if value < 0 => write!(f, "-16r{:X}", -(value as i64)),
            OOP::Int(value) => write!(f, "+16r{:X}", value),
            OOP::Char(value) => write!(f, "$16r{:X}", value),
            oop => match self.0.get_obj(oop) {
                Some(obj) => write!(f, "@16r{:X}", obj.oop),
                None => write!(f, "@dangling"),
            },
        }
    }
}

fn write_hex<W: Write>(w: &mut W, bytes: &[u8]) -> io::Result<()> {
    for line in bytes.chunks(16) {
        write!(w, "\t")?;
        for chunk in line.chunks(4) {
            for byte in chunk {
                write!(w, "{:02x} ", byte)?;
            }
            write!(w, " ")?;
        }
        writeln!(w)?;
    }
    Ok(())
}

impl TextFormat {
    pub fn save<P: AsRef<Path>>(path: P, memory: &ObjectMemory) -> Result<(), ImageError> {
        let f = File::create(path)?;
        let mut w = BufWriter::new(f);
        Self::write_to(&mut w, memory)?;
        w.flush()?;
        Ok(())
    }

    pub fn write_to<W: Write>(w: &mut W, memory: &ObjectMemory) -> io::Result<()> {
        for &id in &memory.old_space {
            let oop = OOP::Object(id);
            let obj = match memory.object(id) {
                Some(obj) => obj,
                None => continue,
            };
            let format = obj_format(&obj.body);
            writeln!(
                w,
                "!Object: {} ofClass: {} format: {}!",
                Token(memory, oop),
                Token(memory, memory.get_class_of(oop)),
                format,
            )?;

            match &obj.body {
                Body::Bytes(bytes) => write_hex(w, bytes)?,
                Body::Words(words) => {
                    for line in words.chunks(4) {
                        write!(w, "\t")?;
                        for word in line {
                            write!(w, "{:08x} ", word)?;
                        }
                        writeln!(w)?;
                    }
                }
                Body::Float(value) => writeln!(w, "\t{:?}", value)?,
                Body::Pointers(slots) => {
                    for &slot in slots {
                        writeln!(w, "\t{}", Token(memory, slot))?;
                    }
                }
                Body::Method { pointers, bytes } => {
                    for &slot in pointers {
                        writeln!(w, "\t{}", Token(memory, slot))?;
                    }
                    write_hex(w, bytes)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objectmemory::builder::MemoryBuilder;
    use crate::objectmemory::MemoryKind;

    #[test]
    fn dump_lists_every_old_object() {
        let memory = MemoryBuilder::new(MemoryKind::V3).build();
        let mut out = Vec::new();
        TextFormat::write_to(&mut out, &memory).unwrap();
        let text = String::from_utf8(out).unwrap();
        let headers = text.lines().filter(|line| line.starts_with("!Object: ")).count();
        assert_eq!(headers, memory.object_count());
        assert!(text.contains("format: #method!"));
        assert!(text.contains("\t+16r28\n"));
    }
}
