//! Snapshot files: header sniffing and the format-independent half of loading.
//!
//! Each format reader walks its file and produces a flat list of [`RawObject`]s, addressed by
//! their on-disk oop. [`install`] then turns those into heap objects, giving nil, false and
//! true the fixed ids 0, 1 and 2.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use log::info;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use super::format::*;
use super::spur_format::SpurFormat;
use super::v3_format::V3Format;
use super::{specials, Body, Object, ObjectId, ObjectMemory, OOP};
use crate::error::ImageError;

pub trait ImageFormat {
    fn read(data: &[u8]) -> Result<ObjectMemory, ImageError>;

    fn write(memory: &ObjectMemory) -> Result<Vec<u8>, ImageError>;

    fn load<P: AsRef<Path>>(path: P) -> Result<ObjectMemory, ImageError> {
        let data = fs::read(path)?;
        Self::read(&data)
    }

    fn save<P: AsRef<Path>>(path: P, memory: &ObjectMemory) -> Result<(), ImageError> {
        let data = Self::write(memory)?;
        fs::write(path.as_ref(), &data)?;
        info!("wrote {} bytes to {}", data.len(), path.as_ref().display());
        Ok(())
    }
}

const KNOWN_VERSIONS: [u32; 9] = [6501, 6502, 6504, 6505, 6521, 68000, 68002, 68003, 68021];
const NATIVE_FLOAT_VERSIONS: [u32; 4] = [6505, 6521, 68003, 68021];
const PRE_CLOSURE_VERSIONS: [u32; 3] = [6501, 6502, 68000];

pub(crate) const HEADER_BYTES: usize = 64;

/// Header fields that survive a load and are written back on snapshot.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageInfo {
    pub version: u32,
    pub little_endian: bool,
    pub header_size: u32,
    pub old_base: u64,
    pub last_hash: u32,
    pub window_size: u32,
    pub flags: u32,
    pub extra: [u32; 4],
    pub first_segment_size: u32,
    /// Where the header starts in the file; 512 for images behind a Mac resource header.
    pub file_offset: usize,
}

impl ImageInfo {
    pub fn new(kind: MemoryKind) -> Self {
        ImageInfo {
            version: kind.default_version(),
            little_endian: kind == MemoryKind::Spur,
            header_size: HEADER_BYTES as u32,
            old_base: 0,
            last_hash: 1,
            window_size: (640 << 16) | 480,
            flags: 0,
            extra: [0; 4],
            first_segment_size: 0,
            file_offset: 0,
        }
    }

    pub fn native_floats(&self) -> bool {
        NATIVE_FLOAT_VERSIONS.contains(&self.version)
    }

    pub fn has_closures(&self) -> bool {
        !PRE_CLOSURE_VERSIONS.contains(&self.version)
    }
}

/// Bounds-checked word access in the file's byte order.
#[derive(Copy, Clone)]
pub(crate) struct WordReader<'a> {
    pub data: &'a [u8],
    pub little_endian: bool,
}

impl<'a> WordReader<'a> {
    pub fn new(data: &'a [u8], little_endian: bool) -> Self {
        WordReader {
            data,
            little_endian,
        }
    }

    pub fn word(&self, pos: usize) -> Result<u32, ImageError> {
        let bytes = self
            .data
            .get(pos..pos + 4)
            .ok_or_else(|| ImageError::InvalidSegment {
                offset: pos,
                reason: "truncated file".to_string(),
            })?;
        Ok(if self.little_endian {
            LittleEndian::read_u32(bytes)
        } else {
            BigEndian::read_u32(bytes)
        })
    }

    pub fn bytes(&self, pos: usize, len: usize) -> Result<&'a [u8], ImageError> {
        self.data
            .get(pos..pos + len)
            .ok_or_else(|| ImageError::InvalidSegment {
                offset: pos,
                reason: format!("object body of {} bytes runs past end of file", len),
            })
    }
}

/// Find the version word: at offset 0 or 512, in either byte order.
pub fn sniff(data: &[u8]) -> Result<(u32, bool, usize), ImageError> {
    for &offset in &[0usize, 512] {
        let word = match data.get(offset..offset + 4) {
            Some(word) => word,
            None => continue,
        };
        for &little_endian in &[false, true] {
            let version = if little_endian {
                LittleEndian::read_u32(word)
            } else {
                BigEndian::read_u32(word)
            };
            if KNOWN_VERSIONS.contains(&version) {
                return Ok((version, little_endian, offset));
            }
        }
    }
    let first = data.get(0..4).map_or(0, BigEndian::read_u32);
    Err(ImageError::BadVersion(first))
}

pub(crate) struct Header {
    pub info: ImageInfo,
    pub data_size: usize,
    pub specials_oop: u64,
}

pub(crate) fn read_header(data: &[u8]) -> Result<Header, ImageError> {
    let (version, little_endian, offset) = sniff(data)?;
    if version >= 68000 {
        return Err(ImageError::Unsupported64Bit(version));
    }
    let r = WordReader::new(data, little_endian);
    let w = |i: usize| r.word(offset + i * 4);
    let info = ImageInfo {
        version,
        little_endian,
        header_size: w(1)?,
        old_base: w(3)? as u64,
        last_hash: w(5)?,
        window_size: w(6)?,
        flags: w(7)?,
        extra: [w(8)?, w(9)?, w(10)?, w(11)?],
        first_segment_size: w(12)?,
        file_offset: offset,
    };
    Ok(Header {
        data_size: w(2)? as usize,
        specials_oop: w(4)? as u64,
        info,
    })
}

/// Header words in file order, ready for the writer.
pub(crate) fn header_words(info: &ImageInfo, data_size: u32, specials_oop: u32) -> [u32; 16] {
    [
        info.version,
        HEADER_BYTES as u32,
        data_size,
        info.old_base as u32,
        specials_oop,
        info.last_hash,
        info.window_size,
        info.flags,
        info.extra[0],
        info.extra[1],
        info.extra[2],
        info.extra[3],
        info.first_segment_size,
        0,
        0,
        0,
    ]
}

/// Accumulates an image in a given byte order.
pub(crate) struct WordWriter {
    pub out: Vec<u8>,
    little_endian: bool,
}

impl WordWriter {
    pub fn new(little_endian: bool, capacity: usize) -> Self {
        WordWriter {
            out: Vec::with_capacity(capacity),
            little_endian,
        }
    }

    pub fn word(&mut self, word: u32) {
        let mut buf = [0; 4];
        if self.little_endian {
            LittleEndian::write_u32(&mut buf, word);
        } else {
            BigEndian::write_u32(&mut buf, word);
        }
        self.out.extend_from_slice(&buf);
    }

    /// Raw bytes, zero-padded to a word boundary.
    pub fn padded_bytes(&mut self, bytes: &[u8]) {
        self.out.extend_from_slice(bytes);
        let pad = (4 - bytes.len() % 4) % 4;
        self.out.extend(std::iter::repeat(0).take(pad));
    }

    pub fn len(&self) -> usize {
        self.out.len()
    }
}

/// File address of every object being written, indexed by object id.
pub(crate) struct AddressMap {
    addresses: Vec<Option<u32>>,
    kind: MemoryKind,
}

impl AddressMap {
    pub fn new(kind: MemoryKind, id_limit: usize) -> Self {
        AddressMap {
            addresses: vec![None; id_limit],
            kind,
        }
    }

    pub fn insert(&mut self, id: ObjectId, address: u32) {
        self.addresses[id.index()] = Some(address);
    }

    pub fn get(&self, id: ObjectId) -> Option<u32> {
        self.addresses.get(id.index()).copied().flatten()
    }

    pub fn encode(&self, oop: OOP) -> Result<u32, ImageError> {
        match oop {
            OOP::Int(value) => Ok(((value as u32) << 1) | 1),
            OOP::Char(value) if self.kind == MemoryKind::Spur => Ok((value << 2) | 2),
            OOP::Char(value) => Err(ImageError::CannotSnapshot(format!(
                "immediate character {} in a V3 memory",
                value
            ))),
            OOP::Object(id) => self.get(id).ok_or_else(|| {
                ImageError::CannotSnapshot(format!("reference to unwritten object {:?}", id))
            }),
        }
    }
}

/// Objects in the order a snapshot lays them out: nil, false and true first.
pub(crate) fn snapshot_order(memory: &ObjectMemory) -> Vec<ObjectId> {
    let fixed = [super::NIL_PTR, super::FALSE_PTR, super::TRUE_PTR];
    let fixed_ids: Vec<ObjectId> = fixed.iter().filter_map(|oop| oop.as_oid()).collect();
    fixed_ids
        .iter()
        .copied()
        .chain(memory.object_ids().filter(|id| !fixed_ids.contains(id)))
        .collect()
}

/// The two words of a float in file order.
pub(crate) fn float_words(info: &ImageInfo, value: f64) -> [u32; 2] {
    let bits = value.to_bits();
    let (hi, lo) = ((bits >> 32) as u32, bits as u32);
    if info.native_floats() && info.little_endian {
        [lo, hi]
    } else {
        [hi, lo]
    }
}

/// One object as found in the file, before references are resolved.
#[derive(Clone, Debug)]
pub(crate) struct RawObject {
    pub oop: u64,
    pub class: u64,
    /// Internal format number, including the unused-byte count of byte formats.
    pub format: u8,
    pub hash: u32,
    /// File offset of the first body word.
    pub body_pos: usize,
    pub body_words: usize,
}

pub(crate) struct RawImage<'a> {
    pub reader: WordReader<'a>,
    pub kind: MemoryKind,
    pub info: ImageInfo,
    pub specials_oop: u64,
    /// In file order; nil, false and true come first.
    pub objects: Vec<RawObject>,
    /// Spur class table, class index to class oop.
    pub class_table: BTreeMap<u32, u64>,
}

impl<'a> RawImage<'a> {
    pub fn raw_slot(&self, obj: &RawObject, index: usize) -> Result<u32, ImageError> {
        self.reader.word(obj.body_pos + index * 4)
    }
}

pub(crate) fn install(raw: RawImage) -> Result<ObjectMemory, ImageError> {
    let index: HashMap<u64, usize> = raw
        .objects
        .iter()
        .enumerate()
        .map(|(i, obj)| (obj.oop, i))
        .collect();

    let specials_pos = *index
        .get(&raw.specials_oop)
        .ok_or(ImageError::MissingSpecialObject(0))?;
    let specials = &raw.objects[specials_pos];
    for slot in 0..3 {
        let word = raw.raw_slot(specials, slot)? as u64;
        if raw.objects.get(slot).map(|obj| obj.oop) != Some(word) {
            return Err(ImageError::MissingSpecialObject(slot));
        }
    }
    let float_class = raw.raw_slot(specials, specials::CLASS_FLOAT)? as u64;

    let kind = raw.kind;
    let resolve = |from: u64, word: u32| -> Result<OOP, ImageError> {
        if word & 1 == 1 {
            return Ok(OOP::Int((word as i32) >> 1));
        }
        if kind == MemoryKind::Spur && word & 3 == 2 {
            return Ok(OOP::Char(word >> 2));
        }
        index
            .get(&(word as u64))
            .map(|&i| OOP::Object(ObjectId::new(i as u32)))
            .ok_or(ImageError::DanglingOop {
                from,
                oop: word as u64,
            })
    };

    let mut objects = Vec::with_capacity(raw.objects.len());
    for obj in &raw.objects {
        let class = *index.get(&obj.class).ok_or(ImageError::MissingClass(obj.oop))?;
        let r = &raw.reader;
        let total_bytes = obj.body_words * 4;
        let pointers = |n: usize| -> Result<Vec<OOP>, ImageError> {
            (0..n)
                .map(|i| resolve(obj.oop, r.word(obj.body_pos + i * 4)?))
                .collect()
        };
        let unused = (obj.format & 3) as usize;
        let (format, body) = match obj.format {
            0..=5 => (obj.format, Body::Pointers(pointers(obj.body_words)?)),
            9..=11 if obj.class == float_class && obj.body_words == 2 => {
                let w0 = r.word(obj.body_pos)? as u64;
                let w1 = r.word(obj.body_pos + 4)? as u64;
                let bits = if raw.info.native_floats() && raw.info.little_endian {
                    (w1 << 32) | w0
                } else {
                    (w0 << 32) | w1
                };
                (FMT_WORDS, Body::Float(f64::from_bits(bits)))
            }
            9..=11 => {
                let words = (0..obj.body_words)
                    .map(|i| r.word(obj.body_pos + i * 4))
                    .collect::<Result<Vec<_>, _>>()?;
                (obj.format.min(FMT_WORDS), Body::Words(words))
            }
            12..=15 => {
                let len = total_bytes.saturating_sub(unused * 2);
                (FMT_SHORTS, Body::Bytes(r.bytes(obj.body_pos, len)?.to_vec()))
            }
            16..=23 => {
                let len = total_bytes.saturating_sub(obj.format as usize & 7);
                (FMT_BYTES, Body::Bytes(r.bytes(obj.body_pos, len)?.to_vec()))
            }
            24..=31 => {
                let header = r.word(obj.body_pos)?;
                let literals = kind.raw_literal_count(header);
                let pointer_words = literals + 1;
                if pointer_words > obj.body_words {
                    return Err(ImageError::SizeMismatch(format!(
                        "method {:#x} claims {} literals in {} words",
                        obj.oop, literals, obj.body_words
                    )));
                }
                let start = obj.body_pos + pointer_words * 4;
                let len = (total_bytes - pointer_words * 4).saturating_sub(obj.format as usize & 7);
                (
                    FMT_METHOD,
                    Body::Method {
                        pointers: pointers(pointer_words)?,
                        bytes: r.bytes(start, len)?.to_vec(),
                    },
                )
            }
            format => {
                return Err(ImageError::UnknownFormat {
                    oop: obj.oop,
                    format,
                })
            }
        };
        objects.push(Some(Object {
            class: ObjectId::new(class as u32),
            hash: obj.hash,
            format,
            body,
            oop: obj.oop as i64,
            mark: false,
            dirty: false,
            position: 0,
        }));
    }

    let order = (0..objects.len() as u32).map(ObjectId::new).collect();
    let mut memory = ObjectMemory::from_parts(
        kind,
        raw.info,
        objects,
        order,
        ObjectId::new(specials_pos as u32),
    );
    if kind == MemoryKind::Spur {
        let mut highest = 0;
        for (&class_index, oop) in &raw.class_table {
            if let Some(&i) = index.get(oop) {
                memory.class_table.insert(class_index, ObjectId::new(i as u32));
                highest = highest.max(class_index);
            }
        }
        memory.set_next_class_index(highest + 1);
    }
    info!(
        "loaded {:?} image version {}: {} objects, {} bytes",
        kind,
        memory.info.version,
        memory.object_count(),
        memory.bytes_in_use()
    );
    Ok(memory)
}

/// Parse an image held in memory, picking the reader from the version word.
pub fn read_image(data: &[u8]) -> Result<ObjectMemory, ImageError> {
    let header = read_header(data)?;
    match MemoryKind::from_version(header.info.version) {
        Some(MemoryKind::V3) => V3Format::read(data),
        Some(MemoryKind::Spur) => SpurFormat::read(data),
        None => Err(ImageError::BadVersion(header.info.version)),
    }
}

pub fn load_image<P: AsRef<Path>>(path: P) -> Result<ObjectMemory, ImageError> {
    let path = path.as_ref();
    info!("loading image {}", path.display());
    let data = fs::read(path)?;
    read_image(&data)
}

/// Write a snapshot in the memory's own format.
pub fn save_image<P: AsRef<Path>>(path: P, memory: &ObjectMemory) -> Result<(), ImageError> {
    match memory.kind() {
        MemoryKind::V3 => V3Format::save(path, memory),
        MemoryKind::Spur => SpurFormat::save(path, memory),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniff_finds_version_in_either_order_and_offset() {
        let mut data = vec![0u8; 1024];
        BigEndian::write_u32(&mut data[0..4], 6505);
        assert_eq!(sniff(&data).unwrap(), (6505, false, 0));

        let mut data = vec![0u8; 1024];
        LittleEndian::write_u32(&mut data[512..516], 6521);
        assert_eq!(sniff(&data).unwrap(), (6521, true, 512));
    }

    #[test]
    fn sixty_four_bit_images_are_rejected() {
        let mut data = vec![0u8; 128];
        LittleEndian::write_u32(&mut data[0..4], 68021);
        match read_image(&data) {
            Err(ImageError::Unsupported64Bit(68021)) => {}
            other => panic!("unexpected result {:?}", other.map(|m| m.object_count())),
        }
    }

    #[test]
    fn garbage_is_not_an_image() {
        match read_image(b"definitely not a snapshot") {
            Err(ImageError::BadVersion(_)) => {}
            other => panic!("unexpected result {:?}", other.map(|m| m.object_count())),
        }
    }

    #[test]
    fn version_flags() {
        let mut info = ImageInfo::new(MemoryKind::V3);
        assert!(info.native_floats());
        info.version = 6502;
        assert!(!info.has_closures());
        assert!(!info.native_floats());
    }
}
