//! The Spur object memory: two-word headers, 22-bit hashes, classes named by their index in
//! a paged class table that lives in the heap as hidden objects.

use std::collections::{BTreeMap, HashMap};

use super::format::*;
use super::image::{
    float_words, header_words, install, read_header, snapshot_order, AddressMap, ImageFormat,
    RawImage, RawObject, WordReader, WordWriter, HEADER_BYTES,
};
use super::{Body, ObjectMemory, NIL_PTR, OOP};
use crate::error::ImageError;

pub enum SpurFormat {}

const OVERFLOW_SLOTS: usize = 255;
const CLASS_TABLE_PAGE_SIZE: usize = 1024;
const CLASS_TABLE_ROOT_SLOTS: usize = 4096;
const ARRAY_CLASS_INDEX_PUN: u32 = 16;
const FREE_LISTS_CLASS_INDEX_PUN: u32 = 17;
const FREE_LISTS_SLOTS: usize = 32;
const BRIDGE_BYTES: usize = 16;

#[derive(Copy, Clone, Debug)]
struct SpurHeader {
    class_index: u32,
    format: u8,
    hash: u32,
    num_slots: usize,
}

impl SpurHeader {
    fn decode(word0: u32, word1: u32) -> Self {
        SpurHeader {
            class_index: word0 & 0x3F_FFFF,
            format: ((word0 >> 24) & 0x1F) as u8,
            hash: word1 & SPUR_HASH_MASK,
            num_slots: (word1 >> 24) as usize,
        }
    }

    fn encode(&self) -> (u32, u32) {
        (
            self.class_index | (self.format as u32) << 24,
            self.hash | (self.num_slots.min(OVERFLOW_SLOTS) as u32) << 24,
        )
    }

    fn has_overflow(&self) -> bool {
        self.num_slots >= OVERFLOW_SLOTS
    }

    /// Words taken by the body; every object has room for at least a forwarding pointer.
    fn body_words(num_slots: usize) -> usize {
        ((num_slots + 1) & !1).max(2)
    }

    fn is_hidden(&self) -> bool {
        self.class_index < RESERVED_CLASS_INDICES
    }
}

/// Spur format number and slot count of an object about to be written.
fn external_layout(body: &Body, format: u8) -> (usize, u8) {
    let unused = |len: usize| ((4 - len % 4) % 4) as u8;
    match body {
        Body::Pointers(slots) => (slots.len(), format),
        Body::Words(words) => (words.len(), if format == FMT_WORDS64 { FMT_WORDS64 } else { FMT_WORDS }),
        Body::Float(_) => (2, FMT_WORDS),
        Body::Bytes(bytes) if format == FMT_SHORTS => ((bytes.len() + 3) / 4, FMT_SHORTS + unused(bytes.len()) / 2),
        Body::Bytes(bytes) => ((bytes.len() + 3) / 4, FMT_BYTES + unused(bytes.len())),
        Body::Method { pointers, bytes } => {
            (pointers.len() + (bytes.len() + 3) / 4, FMT_METHOD + unused(bytes.len()))
        }
    }
}

impl ImageFormat for SpurFormat {
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
        let mut class_indices = Vec::new();
        let mut hidden: HashMap<u64, (SpurHeader, usize)> = HashMap::new();
        let mut class_table_root = None;

        let mut pos = start;
        let mut segment_end = start + header.info.first_segment_size as usize;
        let mut gap = 0u64;
        loop {
            if segment_end > end || segment_end < pos + BRIDGE_BYTES {
                return Err(ImageError::InvalidSegment {
                    offset: pos,
                    reason: format!("segment ends at {} beyond data end {}", segment_end, end),
                });
            }
            while pos < segment_end - BRIDGE_BYTES {
                let mut header_pos = pos;
                let mut hdr = SpurHeader::decode(r.word(pos)?, r.word(pos + 4)?);
                if hdr.has_overflow() {
                    let slots = r.word(pos)? as usize;
                    header_pos = pos + 8;
                    hdr = SpurHeader::decode(r.word(header_pos)?, r.word(header_pos + 4)?);
                    hdr.num_slots = slots;
                }
                let oop = old_base + gap + (header_pos - start) as u64;
                let body_pos = header_pos + 8;
                if hdr.is_hidden() {
                    if hdr.class_index == ARRAY_CLASS_INDEX_PUN
                        && hdr.num_slots == CLASS_TABLE_ROOT_SLOTS
                        && class_table_root.is_none()
                    {
                        class_table_root = Some(oop);
                    }
                    hidden.insert(oop, (hdr, body_pos));
                } else {
                    class_indices.push(hdr.class_index);
                    objects.push(RawObject {
                        oop,
                        class: 0,
                        format: hdr.format,
                        hash: hdr.hash,
                        body_pos,
                        body_words: hdr.num_slots,
                    });
                }
                pos = body_pos + SpurHeader::body_words(hdr.num_slots) * 4;
            }

            let bridge = segment_end - BRIDGE_BYTES;
            let delta_words = r.word(bridge)?;
            let delta_words_hi = r.word(bridge + 4)?;
            let next_segment = r.word(bridge + 8)? as usize;
            pos = segment_end;
            if next_segment == 0 || pos >= end {
                break;
            }
            if delta_words_hi & 0xFF00_0000 != 0 {
                gap += (delta_words & 0xFF_FFFF) as u64 * 4;
            }
            segment_end = pos + next_segment;
        }

        let root = class_table_root.ok_or(ImageError::InvalidSegment {
            offset: start,
            reason: "no class table".to_string(),
        })?;
        let nil_oop = objects.first().map_or(0, |obj| obj.oop);
        let mut class_table = BTreeMap::new();
        let (_, root_body) = hidden[&root];
        for page_index in 0..CLASS_TABLE_ROOT_SLOTS {
            let page = r.word(root_body + page_index * 4)? as u64;
            if page == nil_oop {
                continue;
            }
            let (page_hdr, page_body) = match hidden.get(&page) {
                Some(entry) => *entry,
                None => continue,
            };
            for slot in 0..page_hdr.num_slots.min(CLASS_TABLE_PAGE_SIZE) {
                let class = r.word(page_body + slot * 4)? as u64;
                if class != nil_oop && class & 3 == 0 {
                    class_table.insert((page_index * CLASS_TABLE_PAGE_SIZE + slot) as u32, class);
                }
            }
        }

        for (obj, index) in objects.iter_mut().zip(class_indices) {
            obj.class = *class_table.get(&index).ok_or(ImageError::MissingClass(obj.oop))?;
        }

        install(RawImage {
            reader: r,
            kind: MemoryKind::Spur,
            info: header.info,
            specials_oop: header.specials_oop,
            objects,
            class_table,
        })
    }

    fn write(memory: &ObjectMemory) -> Result<Vec<u8>, ImageError> {
        let mut info = memory.info().clone();
        info.last_hash = memory.last_hash();
        info.little_endian = true;
        let order = snapshot_order(memory);

        let mut pages: BTreeMap<usize, Vec<(usize, OOP)>> = BTreeMap::new();
        for (&index, &class) in &memory.class_table {
            if memory.is_live(class) {
                let index = index as usize;
                pages
                    .entry(index / CLASS_TABLE_PAGE_SIZE)
                    .or_insert_with(Vec::new)
                    .push((index % CLASS_TABLE_PAGE_SIZE, OOP::Object(class)));
            }
        }

        enum Item<'a> {
            Heap(super::ObjectId, &'a super::Object),
            FreeLists,
            Root,
            Page(usize),
        }

        let mut items = Vec::with_capacity(order.len() + pages.len() + 2);
        for (position, &id) in order.iter().enumerate() {
            let obj = memory.object(id).ok_or_else(|| {
                ImageError::CannotSnapshot(format!("object {:?} vanished during snapshot", id))
            })?;
            items.push(Item::Heap(id, obj));
            if position == 2 {
                items.push(Item::FreeLists);
                items.push(Item::Root);
                items.extend(pages.keys().map(|&page| Item::Page(page)));
            }
        }

        let mut addresses = AddressMap::new(MemoryKind::Spur, memory.id_limit());
        let mut page_addresses = BTreeMap::new();
        let mut headers = Vec::with_capacity(items.len());
        let mut offset = 0usize;
        for item in &items {
            let hdr = match item {
                Item::Heap(_, obj) => {
                    let (num_slots, format) = external_layout(&obj.body, obj.format);
                    let class_index = memory
                        .class_index_of(OOP::Object(obj.class))
                        .ok_or_else(|| {
                            ImageError::CannotSnapshot(format!(
                                "class {:?} has no class index",
                                obj.class
                            ))
                        })?;
                    SpurHeader {
                        class_index,
                        format,
                        hash: obj.hash,
                        num_slots,
                    }
                }
                Item::FreeLists => SpurHeader {
                    class_index: FREE_LISTS_CLASS_INDEX_PUN,
                    format: FMT_WORDS,
                    hash: 0,
                    num_slots: FREE_LISTS_SLOTS,
                },
                Item::Root => SpurHeader {
                    class_index: ARRAY_CLASS_INDEX_PUN,
                    format: FMT_INDEXABLE,
                    hash: 0,
                    num_slots: CLASS_TABLE_ROOT_SLOTS,
                },
                Item::Page(_) => SpurHeader {
                    class_index: ARRAY_CLASS_INDEX_PUN,
                    format: FMT_INDEXABLE,
                    hash: 0,
                    num_slots: CLASS_TABLE_PAGE_SIZE,
                },
            };
            if hdr.has_overflow() {
                offset += 8;
            }
            let address = (info.old_base as usize + offset) as u32;
            match item {
                Item::Heap(id, _) => addresses.insert(*id, address),
                Item::Page(page) => {
                    page_addresses.insert(*page, address);
                }
                Item::Root | Item::FreeLists => {}
            }
            offset += 8 + SpurHeader::body_words(hdr.num_slots) * 4;
            headers.push(hdr);
        }
        let total = offset + BRIDGE_BYTES;
        info.first_segment_size = total as u32;

        let nil = addresses.encode(NIL_PTR)?;
        let specials_address = addresses.encode(memory.special_objects())?;
        let mut w = WordWriter::new(true, HEADER_BYTES + total);
        for word in header_words(&info, total as u32, specials_address).iter() {
            w.word(*word);
        }

        for (item, hdr) in items.iter().zip(&headers) {
            if hdr.has_overflow() {
                w.word(hdr.num_slots as u32);
                w.word((OVERFLOW_SLOTS as u32) << 24);
            }
            let (word0, word1) = hdr.encode();
            w.word(word0);
            w.word(word1);
            let body_start = w.len();
            match item {
                Item::Heap(_, obj) => match &obj.body {
                    Body::Pointers(slots) => {
                        for slot in slots {
                            w.word(addresses.encode(*slot)?);
                        }
                    }
                    Body::Words(words) => words.iter().for_each(|word| w.word(*word)),
                    Body::Float(value) => {
                        float_words(&info, *value).iter().for_each(|word| w.word(*word))
                    }
                    Body::Bytes(bytes) => w.padded_bytes(bytes),
                    Body::Method { pointers, bytes } => {
                        for slot in pointers {
                            w.word(addresses.encode(*slot)?);
                        }
                        w.padded_bytes(bytes);
                    }
                },
                Item::FreeLists => (0..FREE_LISTS_SLOTS).for_each(|_| w.word(0)),
                Item::Root => {
                    for page in 0..CLASS_TABLE_ROOT_SLOTS {
                        w.word(page_addresses.get(&page).copied().unwrap_or(nil));
                    }
                }
                Item::Page(page) => {
                    let mut slots = vec![nil; CLASS_TABLE_PAGE_SIZE];
                    for &(slot, class) in &pages[page] {
                        slots[slot] = addresses.encode(class)?;
                    }
                    slots.iter().for_each(|slot| w.word(*slot));
                }
            }
            let padded = body_start + SpurHeader::body_words(hdr.num_slots) * 4;
            while w.len() < padded {
                w.word(0);
            }
        }
        for _ in 0..BRIDGE_BYTES / 4 {
            w.word(0);
        }
        debug_assert_eq!(w.len(), HEADER_BYTES + total);
        Ok(w.out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objectmemory::builder::MemoryBuilder;
    use crate::objectmemory::specials;

    #[test]
    fn overflow_header_kicks_in_at_255_slots() {
        let hdr = SpurHeader {
            class_index: 1030,
            format: FMT_INDEXABLE,
            hash: 77,
            num_slots: 300,
        };
        assert!(hdr.has_overflow());
        let (w0, w1) = hdr.encode();
        let decoded = SpurHeader::decode(w0, w1);
        assert_eq!(decoded.num_slots, OVERFLOW_SLOTS);
        assert_eq!(decoded.class_index, 1030);
        assert_eq!(decoded.hash, 77);
    }

    #[test]
    fn bodies_are_padded_to_allocation_units() {
        assert_eq!(SpurHeader::body_words(0), 2);
        assert_eq!(SpurHeader::body_words(1), 2);
        assert_eq!(SpurHeader::body_words(3), 4);
        assert_eq!(SpurHeader::body_words(4), 4);
    }

    #[test]
    fn snapshot_survives_a_reload() {
        let mut memory = MemoryBuilder::new(MemoryKind::Spur).build();
        let text = memory.new_string("spur");
        let shorts = memory.new_array((0..300).map(OOP::Int).collect());
        let holder = memory.new_array(vec![text, OOP::Char(0x263A), shorts, OOP::Int(-1)]);
        memory.set_special(specials::SMALLTALK_DICTIONARY, holder);
        let string_class = memory.special(specials::CLASS_STRING);
        let string_index = memory.class_index_of(string_class);

        let data = SpurFormat::write(&memory).unwrap();
        let loaded = SpurFormat::read(&data).unwrap();

        assert_eq!(loaded.object_count(), memory.object_count());
        let slots = loaded
            .pointers(loaded.special(specials::SMALLTALK_DICTIONARY))
            .to_vec();
        assert_eq!(loaded.string_of(slots[0]), "spur");
        assert_eq!(slots[1], OOP::Char(0x263A));
        assert_eq!(loaded.slot_count(slots[2]), 300);
        assert_eq!(loaded.get_ptr(slots[2], 299), OOP::Int(299));
        assert_eq!(slots[3], OOP::Int(-1));
        let loaded_string_class = loaded.get_class_of(slots[0]);
        assert_eq!(loaded.class_index_of(loaded_string_class), string_index);
    }
}
