//! The V3 object memory: variable-length headers, 12-bit hashes, and up to 31 compact classes
//! that objects may name by index instead of by class pointer.

use std::collections::{BTreeMap, HashMap};

use super::format::*;
use super::image::{
    float_words, header_words, install, read_header, snapshot_order, AddressMap, ImageFormat,
    RawImage, RawObject, WordReader, WordWriter, HEADER_BYTES,
};
use super::{specials, Body, ObjectId, ObjectMemory};
use crate::error::ImageError;

pub enum V3Format {}

const HEADER_TYPE_SIZE_AND_CLASS: u32 = 0;
const HEADER_TYPE_CLASS: u32 = 1;
const HEADER_TYPE_FREE: u32 = 2;
const HEADER_TYPE_SHORT: u32 = 3;

const MAX_SHORT_SIZE: usize = 63;

/// The word every V3 object starts its body with.
#[derive(Copy, Clone, Debug)]
struct BaseHeader(u32);

impl BaseHeader {
    fn header_type(self) -> u32 {
        self.0 & 3
    }

    /// Object size in words, counting this header; zero when a size word precedes it.
    fn size_words(self) -> usize {
        ((self.0 >> 2) & 0x3F) as usize
    }

    fn format(self) -> u8 {
        ((self.0 >> 8) & 0xF) as u8
    }

    fn compact_class(self) -> u32 {
        (self.0 >> 12) & 0x1F
    }

    fn hash(self) -> u32 {
        (self.0 >> 17) & V3_HASH_MASK
    }

    fn encode(header_type: u32, size_words: usize, format: u8, compact_class: u32, hash: u32) -> u32 {
        header_type
            | (size_words as u32 & 0x3F) << 2
            | (format as u32 & 0xF) << 8
            | (compact_class & 0x1F) << 12
            | (hash & V3_HASH_MASK) << 17
    }
}

fn internal_format(format: u8) -> Option<u8> {
    match format {
        0..=4 => Some(format),
        6 => Some(FMT_WORDS),
        8..=11 => Some(FMT_BYTES + (format - 8)),
        12..=15 => Some(FMT_METHOD + (format - 12)),
        _ => None,
    }
}

/// Body size in words and the V3 format nibble of an object about to be written.
fn external_layout(body: &Body, format: u8) -> (usize, u8) {
    let unused = |len: usize| ((4 - len % 4) % 4) as u8;
    match body {
        Body::Pointers(slots) => (slots.len(), if format == FMT_EPHEMERON { FMT_FIXED } else { format }),
        Body::Words(words) => (words.len(), 6),
        Body::Float(_) => (2, 6),
        Body::Bytes(bytes) => ((bytes.len() + 3) / 4, 8 + unused(bytes.len())),
        Body::Method { pointers, bytes } => {
            (pointers.len() + (bytes.len() + 3) / 4, 12 + unused(bytes.len()))
        }
    }
}

impl ImageFormat for V3Format {
    fn read(data: &[u8]) -> Result<ObjectMemory, ImageError> {
        let header = read_header(data)?;
        let r = WordReader::new(data, header.info.little_endian);
        let start = header.info.file_offset + header.info.header_size as usize;
        let end = start + header.data_size;
        if end > data.len() {
            return Err(ImageError::InvalidSegment {
                offset: start,
                reason: format!("{} bytes of objects promised, file too short", header.data_size),
            });
        }
        let old_base = header.info.old_base;

        let mut objects = Vec::new();
        let mut compact_refs = Vec::new();
        let mut pos = start;
        while pos < end {
            let first = r.word(pos)?;
            let (class_word, base_pos, size) = match first & 3 {
                HEADER_TYPE_SIZE_AND_CLASS => {
                    let class = r.word(pos + 4)?;
                    (Some(class & !3), pos + 8, (first & !3) as usize / 4)
                }
                HEADER_TYPE_CLASS => {
                    let base = BaseHeader(r.word(pos + 4)?);
                    (Some(first & !3), pos + 4, base.size_words())
                }
                HEADER_TYPE_SHORT => (None, pos, BaseHeader(first).size_words()),
                _ => {
                    return Err(ImageError::InvalidSegment {
                        offset: pos,
                        reason: "free chunk in snapshot".to_string(),
                    })
                }
            };
            let base = BaseHeader(r.word(base_pos)?);
            if size == 0 || base.header_type() == HEADER_TYPE_FREE {
                return Err(ImageError::InvalidSegment {
                    offset: pos,
                    reason: "zero-sized object".to_string(),
                });
            }
            let oop = old_base + (base_pos - start) as u64;
            let format = internal_format(base.format()).ok_or(ImageError::UnknownFormat {
                oop,
                format: base.format(),
            })?;
            let class = match class_word {
                Some(class) => class as u64,
                None => {
                    compact_refs.push((objects.len(), base.compact_class()));
                    0
                }
            };
            objects.push(RawObject {
                oop,
                class,
                format,
                hash: base.hash(),
                body_pos: base_pos + 4,
                body_words: size - 1,
            });
            pos = base_pos + size * 4;
        }

        let mut raw = RawImage {
            reader: r,
            kind: MemoryKind::V3,
            info: header.info,
            specials_oop: header.specials_oop,
            objects,
            class_table: BTreeMap::new(),
        };
        resolve_compact_classes(&mut raw, &compact_refs)?;
        install(raw)
    }

    fn write(memory: &ObjectMemory) -> Result<Vec<u8>, ImageError> {
        let mut info = memory.info().clone();
        info.last_hash = memory.last_hash();
        let order = snapshot_order(memory);

        let compact: HashMap<ObjectId, u32> = memory
            .pointers(memory.special(specials::COMPACT_CLASSES))
            .iter()
            .enumerate()
            .filter_map(|(i, class)| class.as_oid().map(|id| (id, i as u32 + 1)))
            .filter(|&(id, _)| id.index() > 0)
            .collect();

        struct Planned {
            id: ObjectId,
            header_words: usize,
            body_words: usize,
            format: u8,
            compact_class: u32,
        }

        let mut addresses = AddressMap::new(MemoryKind::V3, memory.id_limit());
        let mut plan = Vec::with_capacity(order.len());
        let mut offset = 0usize;
        for id in order {
            let obj = memory.object(id).ok_or_else(|| {
                ImageError::CannotSnapshot(format!("object {:?} vanished during snapshot", id))
            })?;
            let (body_words, format) = external_layout(&obj.body, obj.format);
            let compact_class = compact.get(&obj.class).copied().unwrap_or(0);
            let header_words = if body_words + 1 > MAX_SHORT_SIZE {
                3
            } else if compact_class != 0 {
                1
            } else {
                2
            };
            let address = info.old_base as usize + offset + (header_words - 1) * 4;
            addresses.insert(id, address as u32);
            offset += (header_words + body_words) * 4;
            plan.push(Planned {
                id,
                header_words,
                body_words,
                format,
                compact_class,
            });
        }

        let specials_address = addresses.encode(memory.special_objects())?;
        let mut w = WordWriter::new(info.little_endian, HEADER_BYTES + offset);
        for word in header_words(&info, offset as u32, specials_address).iter() {
            w.word(*word);
        }

        for entry in &plan {
            let obj = match memory.object(entry.id) {
                Some(obj) => obj,
                None => continue,
            };
            let class = addresses.encode(super::OOP::Object(obj.class))?;
            let size = entry.body_words + 1;
            match entry.header_words {
                3 => {
                    w.word((size * 4) as u32 | HEADER_TYPE_SIZE_AND_CLASS);
                    w.word(class | HEADER_TYPE_SIZE_AND_CLASS);
                    w.word(BaseHeader::encode(
                        HEADER_TYPE_SIZE_AND_CLASS,
                        0,
                        entry.format,
                        entry.compact_class,
                        obj.hash,
                    ));
                }
                2 => {
                    w.word(class | HEADER_TYPE_CLASS);
                    w.word(BaseHeader::encode(
                        HEADER_TYPE_CLASS,
                        size,
                        entry.format,
                        entry.compact_class,
                        obj.hash,
                    ));
                }
                _ => w.word(BaseHeader::encode(
                    HEADER_TYPE_SHORT,
                    size,
                    entry.format,
                    entry.compact_class,
                    obj.hash,
                )),
            }
            match &obj.body {
                Body::Pointers(slots) => {
                    for slot in slots {
                        w.word(addresses.encode(*slot)?);
                    }
                }
                Body::Words(words) => words.iter().for_each(|word| w.word(*word)),
                Body::Float(value) => float_words(&info, *value).iter().for_each(|word| w.word(*word)),
                Body::Bytes(bytes) => w.padded_bytes(bytes),
                Body::Method { pointers, bytes } => {
                    for slot in pointers {
                        w.word(addresses.encode(*slot)?);
                    }
                    w.padded_bytes(bytes);
                }
            }
        }
        debug_assert_eq!(w.len(), HEADER_BYTES + offset);
        Ok(w.out)
    }
}

/// Replace compact class indices by the oops found in the compact class array.
fn resolve_compact_classes(raw: &mut RawImage, refs: &[(usize, u32)]) -> Result<(), ImageError> {
    if refs.is_empty() {
        return Ok(());
    }
    let find = |oop: u64| raw.objects.iter().find(|obj| obj.oop == oop);
    let specials = find(raw.specials_oop).ok_or(ImageError::MissingSpecialObject(0))?;
    let table_oop = raw.raw_slot(specials, specials::COMPACT_CLASSES)? as u64;
    let table = find(table_oop).ok_or(ImageError::MissingSpecialObject(specials::COMPACT_CLASSES))?;

    let mut classes = Vec::with_capacity(refs.len());
    for &(position, index) in refs {
        let obj = &raw.objects[position];
        if index == 0 || index as usize > table.body_words {
            return Err(ImageError::MissingClass(obj.oop));
        }
        classes.push((position, raw.raw_slot(table, index as usize - 1)? as u64));
    }
    for (position, class) in classes {
        raw.objects[position].class = class;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objectmemory::builder::MemoryBuilder;
    use crate::objectmemory::OOP;

    #[test]
    fn base_header_fields() {
        let header = BaseHeader(BaseHeader::encode(HEADER_TYPE_SHORT, 5, 8, 17, 0xABC));
        assert_eq!(header.header_type(), HEADER_TYPE_SHORT);
        assert_eq!(header.size_words(), 5);
        assert_eq!(header.format(), 8);
        assert_eq!(header.compact_class(), 17);
        assert_eq!(header.hash(), 0xABC);
    }

    #[test]
    fn snapshot_survives_a_reload() {
        let mut memory = MemoryBuilder::new(MemoryKind::V3).build();
        let text = memory.new_string("hello, world");
        let pi = memory.new_float(3.25);
        let big = memory.new_array(vec![OOP::Int(-9); 100]);
        let holder = memory.new_array(vec![text, pi, big, OOP::Int(42)]);
        memory.set_special(specials::SMALLTALK_DICTIONARY, holder);
        let hash = memory.hash_of(text);

        let data = V3Format::write(&memory).unwrap();
        let loaded = V3Format::read(&data).unwrap();

        assert_eq!(loaded.object_count(), memory.object_count());
        let holder = loaded.special(specials::SMALLTALK_DICTIONARY);
        let slots = loaded.pointers(holder).to_vec();
        assert_eq!(slots[3], OOP::Int(42));
        assert_eq!(loaded.string_of(slots[0]), "hello, world");
        assert_eq!(loaded.hash_of(slots[0]), hash);
        assert_eq!(loaded.float_value(slots[1]), Some(3.25));
        assert_eq!(loaded.slot_count(slots[2]), 100);
        assert_eq!(loaded.get_ptr(slots[2], 99), OOP::Int(-9));
        assert_eq!(
            loaded.get_class_of(slots[0]),
            loaded.special(specials::CLASS_STRING)
        );
    }
}
