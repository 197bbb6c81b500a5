use log::{debug, warn};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt::{self, Debug};

pub mod builder;
pub mod format;
pub mod gc;
pub mod image;
pub mod specials;
pub mod spur_format;
pub mod text_format;
pub mod v3_format;

pub use self::format::{ClassFormat, MemoryKind, MethodHeader};
pub use self::gc::{BecomeError, GcReport, GcRequest, GcStats};
pub use self::image::{load_image, read_image, ImageFormat, ImageInfo};

use self::format::*;
use crate::config::VmConfig;

pub type Word = u32;

pub const SMALLINT_MIN: i64 = -0x4000_0000;
pub const SMALLINT_MAX: i64 = 0x3FFF_FFFF;

/// Index of an object in the heap arena. Stable for the lifetime of the object; ids of
/// collected objects are recycled.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct ObjectId(u32);

impl ObjectId {
    pub const fn new(index: u32) -> Self {
        ObjectId(index)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A Smalltalk value: an immediate or a reference into the heap.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub enum OOP {
    Int(i32),
    /// Immediate character; only Spur memories produce these.
    Char(u32),
    Object(ObjectId),
}

pub const NIL_PTR: OOP = OOP::Object(ObjectId(0));
pub const FALSE_PTR: OOP = OOP::Object(ObjectId(1));
pub const TRUE_PTR: OOP = OOP::Object(ObjectId(2));

impl Default for OOP {
    fn default() -> Self {
        NIL_PTR
    }
}

impl Debug for OOP {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        match *self {
            OOP::Int(value) => write!(f, "${}", value),
            OOP::Char(value) => match std::char::from_u32(value) {
                Some(c) => write!(f, "${:?}", c),
                None => write!(f, "$U+{:X}", value),
            },
            OOP::Object(id) => write!(f, "@{:?}", id),
        }
    }
}

impl OOP {
    pub const fn pointer(id: ObjectId) -> Self {
        OOP::Object(id)
    }

    pub fn try_from_integer(value: i64) -> Option<OOP> {
        if value >= SMALLINT_MIN && value <= SMALLINT_MAX {
            Some(OOP::Int(value as i32))
        } else {
            None
        }
    }

    pub fn try_as_integer(self) -> Option<i64> {
        match self {
            OOP::Int(value) => Some(value as i64),
            _ => None,
        }
    }

    pub fn try_as_char(self) -> Option<u32> {
        match self {
            OOP::Char(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_oid(self) -> Option<ObjectId> {
        match self {
            OOP::Object(id) => Some(id),
            _ => None,
        }
    }

    pub fn is_integer(self) -> bool {
        match self {
            OOP::Int(_) => true,
            _ => false,
        }
    }

    pub fn is_object(self) -> bool {
        self.as_oid().is_some()
    }

    pub fn is_nil(self) -> bool {
        self == NIL_PTR
    }
}

impl From<i16> for OOP {
    fn from(v: i16) -> Self {
        OOP::Int(v as i32)
    }
}

impl From<bool> for OOP {
    fn from(v: bool) -> Self {
        if v {
            TRUE_PTR
        } else {
            FALSE_PTR
        }
    }
}

/// Payload of a heap object. Methods are the one kind carrying two payloads.
#[derive(Clone, Debug, PartialEq)]
pub enum Body {
    Pointers(Vec<OOP>),
    Words(Vec<Word>),
    Bytes(Vec<u8>),
    Float(f64),
    Method { pointers: Vec<OOP>, bytes: Vec<u8> },
}

impl Body {
    fn payload_bytes(&self) -> usize {
        match self {
            Body::Pointers(slots) => slots.len() * 4,
            Body::Words(words) => words.len() * 4,
            Body::Bytes(bytes) => (bytes.len() + 3) & !3,
            Body::Float(_) => 8,
            Body::Method { pointers, bytes } => pointers.len() * 4 + ((bytes.len() + 3) & !3),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Object {
    pub(crate) class: ObjectId,
    pub(crate) hash: u32,
    /// Layout tag in Spur numbering, whatever memory the object came from.
    pub(crate) format: u8,
    pub(crate) body: Body,
    /// Serialized address. Negative while the object lives in new space.
    pub(crate) oop: i64,
    pub(crate) mark: bool,
    pub(crate) dirty: bool,
    /// Index in enumeration order: old space first, then new space.
    pub(crate) position: u32,
}

impl Object {
    pub fn class(&self) -> ObjectId {
        self.class
    }

    pub fn format(&self) -> u8 {
        self.format
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn hash(&self) -> u32 {
        self.hash
    }

    pub fn is_young(&self) -> bool {
        self.oop < 0
    }

    pub fn pointers(&self) -> &[OOP] {
        match &self.body {
            Body::Pointers(slots) => slots,
            Body::Method { pointers, .. } => pointers,
            _ => &[],
        }
    }

    pub(crate) fn pointers_mut(&mut self) -> &mut [OOP] {
        match &mut self.body {
            Body::Pointers(slots) => slots,
            Body::Method { pointers, .. } => pointers,
            _ => &mut [],
        }
    }

    pub(crate) fn size_in_bytes(&self) -> usize {
        let header = if self.pointers().len() >= 255 { 16 } else { 8 };
        header + self.body.payload_bytes()
    }
}

pub struct ObjectMemory {
    objects: Vec<Option<Object>>,
    free_ids: Vec<u32>,
    pub(crate) old_space: Vec<ObjectId>,
    pub(crate) young_space: Vec<ObjectId>,
    pub(crate) kind: MemoryKind,
    pub(crate) info: ImageInfo,
    special_objects: ObjectId,
    /// Spur class table: class index to class. Classes carry their index as identity hash.
    pub(crate) class_table: BTreeMap<u32, ObjectId>,
    next_class_index: u32,
    last_hash: u32,
    next_young_oop: i64,

    pub(crate) bytes_in_use: usize,
    pub(crate) young_bytes: usize,
    pub(crate) memory_limit: usize,
    pub(crate) young_space_limit: usize,
    pub(crate) tenure_threshold: usize,
    pub(crate) gc_request: GcRequest,
    pub(crate) stats: GcStats,
}

impl ObjectMemory {
    pub(crate) fn new(kind: MemoryKind, info: ImageInfo) -> Self {
        let defaults = VmConfig::default();
        ObjectMemory {
            objects: Vec::new(),
            free_ids: Vec::new(),
            old_space: Vec::new(),
            young_space: Vec::new(),
            kind,
            info,
            special_objects: NIL_PTR.as_oid().unwrap_or(ObjectId(0)),
            class_table: BTreeMap::new(),
            next_class_index: FIRST_USER_CLASS_INDEX,
            last_hash: 1,
            next_young_oop: -1,
            bytes_in_use: 0,
            young_bytes: 0,
            memory_limit: defaults.memory_limit,
            young_space_limit: defaults.young_space_limit,
            tenure_threshold: defaults.tenure_threshold,
            gc_request: GcRequest::None,
            stats: GcStats::default(),
        }
    }

    /// Assemble a loaded heap. `objects` is indexed by id, `order` is the old-space order.
    pub(crate) fn from_parts(
        kind: MemoryKind,
        info: ImageInfo,
        objects: Vec<Option<Object>>,
        order: Vec<ObjectId>,
        special_objects: ObjectId,
    ) -> Self {
        let mut memory = ObjectMemory::new(kind, info);
        memory.last_hash = memory.info.last_hash.max(1);
        memory.bytes_in_use = objects
            .iter()
            .filter_map(|obj| obj.as_ref().map(Object::size_in_bytes))
            .sum();
        memory.free_ids = objects
            .iter()
            .enumerate()
            .filter(|(_, obj)| obj.is_none())
            .map(|(index, _)| index as u32)
            .collect();
        memory.objects = objects;
        memory.old_space = order;
        memory.special_objects = special_objects;
        memory.renumber();
        memory
    }

    pub fn configure(&mut self, config: &VmConfig) {
        self.memory_limit = config.memory_limit;
        self.young_space_limit = config.young_space_limit;
        self.tenure_threshold = config.tenure_threshold;
    }

    pub fn kind(&self) -> MemoryKind {
        self.kind
    }

    pub fn info(&self) -> &ImageInfo {
        &self.info
    }

    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    pub fn object_count(&self) -> usize {
        self.old_space.len() + self.young_space.len()
    }

    pub fn young_count(&self) -> usize {
        self.young_space.len()
    }

    pub fn bytes_in_use(&self) -> usize {
        self.bytes_in_use
    }

    pub fn bytes_left(&self) -> usize {
        self.memory_limit.saturating_sub(self.bytes_in_use)
    }

    pub fn gc_requested(&self) -> GcRequest {
        self.gc_request
    }

    pub fn request_gc(&mut self, request: GcRequest) {
        if request > self.gc_request {
            self.gc_request = request;
        }
    }

    /// Every live object, old space first, each in its allocation order.
    pub fn object_ids(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.old_space.iter().chain(self.young_space.iter()).copied()
    }

    /// Refresh every object's enumeration position after the spaces were rebuilt.
    pub(crate) fn renumber(&mut self) {
        let order: Vec<ObjectId> = self.object_ids().collect();
        for (position, id) in order.into_iter().enumerate() {
            if let Some(obj) = self.object_mut(id) {
                obj.position = position as u32;
            }
        }
    }

    pub(crate) fn renumber_young(&mut self) {
        let base = self.old_space.len();
        for index in 0..self.young_space.len() {
            let id = self.young_space[index];
            if let Some(obj) = self.object_mut(id) {
                obj.position = (base + index) as u32;
            }
        }
    }

    fn object_at(&self, position: usize) -> Option<ObjectId> {
        match position.checked_sub(self.old_space.len()) {
            None => self.old_space.get(position).copied(),
            Some(young) => self.young_space.get(young).copied(),
        }
    }

    fn position_of(&self, oop: OOP) -> Option<usize> {
        let id = oop.as_oid()?;
        let position = self.object(id)?.position as usize;
        if self.object_at(position) == Some(id) {
            Some(position)
        } else {
            warn!("stale enumeration position for {:?}", oop);
            None
        }
    }

    /// One past the highest object id ever handed out.
    pub(crate) fn id_limit(&self) -> usize {
        self.objects.len()
    }

    pub fn is_live(&self, id: ObjectId) -> bool {
        match self.objects.get(id.index()) {
            Some(Some(_)) => true,
            _ => false,
        }
    }

    pub fn get_obj(&self, oop: OOP) -> Option<&Object> {
        match oop {
            OOP::Object(id) => self.objects.get(id.index()).and_then(Option::as_ref),
            _ => None,
        }
    }

    pub(crate) fn get_obj_mut(&mut self, oop: OOP) -> Option<&mut Object> {
        match oop {
            OOP::Object(id) => self.objects.get_mut(id.index()).and_then(Option::as_mut),
            _ => None,
        }
    }

    pub(crate) fn object(&self, id: ObjectId) -> Option<&Object> {
        self.objects.get(id.index()).and_then(Option::as_ref)
    }

    pub(crate) fn object_mut(&mut self, id: ObjectId) -> Option<&mut Object> {
        self.objects.get_mut(id.index()).and_then(Option::as_mut)
    }

    pub(crate) fn release(&mut self, id: ObjectId) -> Option<Object> {
        let obj = self.objects.get_mut(id.index()).and_then(Option::take)?;
        self.bytes_in_use = self.bytes_in_use.saturating_sub(obj.size_in_bytes());
        self.free_ids.push(id.0);
        Some(obj)
    }

    pub fn is_young(&self, oop: OOP) -> bool {
        self.get_obj(oop).map_or(false, Object::is_young)
    }

    fn next_hash(&mut self) -> u32 {
        self.last_hash = (13849 + 27181 * self.last_hash) & 0xFFFF;
        self.last_hash
    }

    pub(crate) fn last_hash(&self) -> u32 {
        self.last_hash
    }

    /// Put a fresh object into new space.
    pub(crate) fn allocate(&mut self, class: ObjectId, format: u8, body: Body) -> ObjectId {
        if self.kind == MemoryKind::Spur {
            self.ensure_class_index(class);
        }
        self.allocate_unindexed(class, format, body)
    }

    /// Allocation that leaves the class table alone, for bootstrapping before classes exist.
    pub(crate) fn allocate_unindexed(&mut self, class: ObjectId, format: u8, body: Body) -> ObjectId {
        let hash = match self.kind {
            MemoryKind::V3 => self.next_hash() & V3_HASH_MASK,
            MemoryKind::Spur => 0,
        };
        let obj = Object {
            class,
            hash,
            format,
            body,
            oop: self.next_young_oop,
            mark: false,
            dirty: false,
            position: (self.old_space.len() + self.young_space.len()) as u32,
        };
        self.next_young_oop -= 1;
        let size = obj.size_in_bytes();
        self.bytes_in_use += size;
        self.young_bytes += size;
        if self.young_bytes > self.young_space_limit {
            self.request_gc(GcRequest::Partial);
        }
        if self.bytes_in_use > self.memory_limit {
            self.request_gc(GcRequest::Full);
        }

        let id = match self.free_ids.pop() {
            Some(index) => {
                self.objects[index as usize] = Some(obj);
                ObjectId(index)
            }
            None => {
                self.objects.push(Some(obj));
                ObjectId(self.objects.len() as u32 - 1)
            }
        };
        self.young_space.push(id);
        id
    }

    pub(crate) fn next_young_oop(&mut self) -> i64 {
        let oop = self.next_young_oop;
        self.next_young_oop -= 1;
        oop
    }

    pub(crate) fn reset_young_oops(&mut self) {
        self.next_young_oop = -1;
    }

    /// Whether an allocation of `bytes` more would stay within the memory limit.
    pub fn has_room_for(&self, bytes: usize) -> bool {
        self.bytes_in_use + bytes <= self.memory_limit
    }

    // Classes and formats

    fn class_id(oop: OOP) -> ObjectId {
        oop.as_oid().unwrap_or(ObjectId(0))
    }

    pub fn class_format(&self, class: OOP) -> Option<ClassFormat> {
        let raw = self.fetch_pointer(class, specials::CLASS_FORMAT_INDEX)?.try_as_integer()?;
        Some(self.kind.class_format(raw))
    }

    pub fn method_header(&self, method: OOP) -> Option<MethodHeader> {
        let obj = self.get_obj(method)?;
        match &obj.body {
            Body::Method { pointers, bytes } => {
                let raw = pointers.first()?.try_as_integer()?;
                Some(self.kind.method_header(raw, bytes))
            }
            _ => None,
        }
    }

    pub fn is_method(&self, oop: OOP) -> bool {
        self.get_obj(oop).map_or(false, |obj| is_method_format(obj.format))
    }

    /// Build the payload for an instance of a class with the given format.
    fn body_for(&self, class: OOP, format: ClassFormat, indexable: usize) -> Option<(u8, Body)> {
        let spec = format.inst_spec;
        let fixed = format.inst_size;
        let nils = |n: usize| Body::Pointers(vec![NIL_PTR; n]);
        Some(match spec {
            FMT_EMPTY => (FMT_EMPTY, nils(0)),
            FMT_FIXED | FMT_EPHEMERON => (spec, nils(fixed)),
            FMT_INDEXABLE => (FMT_INDEXABLE, nils(indexable)),
            FMT_FIXED_INDEXABLE | FMT_WEAK => (spec, nils(fixed + indexable)),
            FMT_WORDS64 => (FMT_WORDS64, Body::Words(vec![0; indexable * 2])),
            10..=11 => {
                if class == self.special(specials::CLASS_FLOAT) {
                    (FMT_WORDS, Body::Float(0.0))
                } else {
                    (FMT_WORDS, Body::Words(vec![0; indexable]))
                }
            }
            12..=15 => (FMT_SHORTS, Body::Bytes(vec![0; indexable * 2])),
            16..=23 => (FMT_BYTES, Body::Bytes(vec![0; indexable])),
            _ => return None,
        })
    }

    /// Allocate an instance from the class's declared format, nil- or zero-filled.
    /// Fails for malformed classes and method classes.
    pub fn instantiate_class(&mut self, class: OOP, indexable: usize) -> Option<OOP> {
        let format = self.class_format(class)?;
        let (fmt, body) = self.body_for(class, format, indexable)?;
        let id = self.allocate(Self::class_id(class), fmt, body);
        Some(OOP::Object(id))
    }

    /// As `instantiate_class`, but refuses to grow the heap past its limit.
    pub fn try_instantiate_class(&mut self, class: OOP, indexable: usize) -> Option<OOP> {
        let format = self.class_format(class)?;
        let estimate = 16 + (format.inst_size + indexable) * 4;
        if !self.has_room_for(estimate) {
            self.request_gc(GcRequest::Full);
            return None;
        }
        self.instantiate_class(class, indexable)
    }

    pub fn new_pointers(&mut self, class: OOP, format: u8, slots: Vec<OOP>) -> OOP {
        OOP::Object(self.allocate(Self::class_id(class), format, Body::Pointers(slots)))
    }

    pub fn new_array(&mut self, elements: Vec<OOP>) -> OOP {
        let class = self.special(specials::CLASS_ARRAY);
        self.new_pointers(class, FMT_INDEXABLE, elements)
    }

    pub fn new_bytes(&mut self, class: OOP, bytes: Vec<u8>) -> OOP {
        OOP::Object(self.allocate(Self::class_id(class), FMT_BYTES, Body::Bytes(bytes)))
    }

    pub fn new_words(&mut self, class: OOP, words: Vec<Word>) -> OOP {
        OOP::Object(self.allocate(Self::class_id(class), FMT_WORDS, Body::Words(words)))
    }

    pub fn new_string(&mut self, text: &str) -> OOP {
        let class = self.special(specials::CLASS_STRING);
        self.new_bytes(class, text.as_bytes().to_vec())
    }

    pub fn new_method(&mut self, class: OOP, pointers: Vec<OOP>, bytes: Vec<u8>) -> OOP {
        OOP::Object(self.allocate(
            Self::class_id(class),
            FMT_METHOD,
            Body::Method { pointers, bytes },
        ))
    }

    pub fn new_float(&mut self, value: f64) -> OOP {
        let class = self.special(specials::CLASS_FLOAT);
        OOP::Object(self.allocate(Self::class_id(class), FMT_WORDS, Body::Float(value)))
    }

    pub fn float_value(&self, oop: OOP) -> Option<f64> {
        match self.get_obj(oop)?.body {
            Body::Float(value) => Some(value),
            _ => None,
        }
    }

    pub fn set_float_value(&mut self, oop: OOP, value: f64) -> Option<()> {
        match &mut self.get_obj_mut(oop)?.body {
            Body::Float(slot) => {
                *slot = value;
                Some(())
            }
            _ => None,
        }
    }

    /// Shallow copy; the copy is young and gets its own identity hash.
    pub fn clone_object(&mut self, oop: OOP) -> Option<OOP> {
        let (class, format, body) = {
            let obj = self.get_obj(oop)?;
            (obj.class, obj.format, obj.body.clone())
        };
        if !self.has_room_for(8 + body.payload_bytes()) {
            self.request_gc(GcRequest::Full);
            return None;
        }
        Some(OOP::Object(self.allocate(class, format, body)))
    }

    pub fn get_class_of(&self, oop: OOP) -> OOP {
        match oop {
            OOP::Int(_) => self.special(specials::CLASS_SMALL_INTEGER),
            OOP::Char(_) => self.special(specials::CLASS_CHARACTER),
            OOP::Object(_) => match self.get_obj(oop) {
                Some(obj) => OOP::Object(obj.class),
                None => NIL_PTR,
            },
        }
    }

    pub fn format_of(&self, oop: OOP) -> Option<u8> {
        self.get_obj(oop).map(|obj| obj.format)
    }

    /// Change the class of an object in place; the caller checks layout compatibility.
    pub(crate) fn set_class(&mut self, oop: OOP, class: OOP) -> Option<()> {
        let class_id = class.as_oid()?;
        if self.kind == MemoryKind::Spur {
            self.ensure_class_index(class_id);
        }
        let young_class = self.is_young(class);
        let obj = self.get_obj_mut(oop)?;
        obj.class = class_id;
        if young_class && !obj.is_young() {
            obj.dirty = true;
        }
        Some(())
    }

    /// Give `oop` a new class whose instances are laid out the same way. Fails, leaving the
    /// object alone, when the layouts differ.
    pub(crate) fn change_class(&mut self, oop: OOP, class: OOP) -> Option<()> {
        let format = self.class_format(class)?;
        let spec = format.inst_spec;
        let new_format = {
            let obj = self.get_obj(oop)?;
            match &obj.body {
                Body::Pointers(slots) if is_pointers_format(spec) => {
                    let fits = if format.is_indexable() {
                        slots.len() >= format.inst_size
                    } else {
                        slots.len() == format.inst_size
                    };
                    if !fits {
                        return None;
                    }
                    spec
                }
                Body::Words(_) | Body::Float(_) if is_words_format(spec) => obj.format,
                Body::Bytes(_) if is_bytes_format(spec) => {
                    let shorts = spec < FMT_BYTES;
                    if shorts != (obj.format == FMT_SHORTS) {
                        return None;
                    }
                    obj.format
                }
                Body::Method { .. } if is_method_format(spec) => obj.format,
                _ => return None,
            }
        };
        self.set_class(oop, class)?;
        self.get_obj_mut(oop)?.format = new_format;
        Some(())
    }

    pub(crate) fn set_class_unindexed(&mut self, oop: OOP, class: OOP) {
        if let (Some(obj), Some(class)) = (self.get_obj_mut(oop), class.as_oid()) {
            obj.class = class;
        }
    }

    /// Identity hash without side effects; unassigned Spur hashes read as zero.
    pub fn hash_of(&self, oop: OOP) -> u32 {
        match oop {
            OOP::Int(value) => value as u32,
            OOP::Char(value) => value,
            OOP::Object(_) => self.get_obj(oop).map_or(0, |obj| obj.hash),
        }
    }

    /// Identity hash, assigning one on first use in Spur memories.
    pub fn identity_hash(&mut self, oop: OOP) -> u32 {
        let current = self.hash_of(oop);
        if current != 0 || !oop.is_object() || self.kind != MemoryKind::Spur {
            return current;
        }
        let mut hash = self.next_hash() & SPUR_HASH_MASK;
        while hash == 0 {
            hash = self.next_hash() & SPUR_HASH_MASK;
        }
        if let Some(obj) = self.get_obj_mut(oop) {
            obj.hash = hash;
        }
        hash
    }

    pub fn max_identity_hash(&self) -> u32 {
        match self.kind {
            MemoryKind::V3 => V3_HASH_MASK,
            MemoryKind::Spur => SPUR_HASH_MASK,
        }
    }

    /// Class-table index of a class (Spur), assigning one if the class has none yet.
    pub fn ensure_class_index(&mut self, class: ObjectId) -> u32 {
        let hash = match self.object(class) {
            Some(obj) => obj.hash,
            None => return 0,
        };
        if hash != 0 {
            match self.class_table.get(&hash) {
                Some(&existing) if existing == class => return hash,
                None if hash >= RESERVED_CLASS_INDICES => {
                    self.class_table.insert(hash, class);
                    return hash;
                }
                _ => {}
            }
        }
        while self.class_table.contains_key(&self.next_class_index) {
            self.next_class_index += 1;
        }
        let index = self.next_class_index;
        self.next_class_index += 1;
        self.class_table.insert(index, class);
        if let Some(obj) = self.object_mut(class) {
            if hash != 0 {
                debug!("class {:?} rehashed from {} to class index {}", class, hash, index);
            }
            obj.hash = index;
        }
        index
    }

    /// Pin a class to a well-known class index.
    pub(crate) fn register_class_index(&mut self, index: u32, class: ObjectId) {
        self.class_table.insert(index, class);
        if let Some(obj) = self.object_mut(class) {
            obj.hash = index;
        }
    }

    pub fn class_index_of(&self, class: OOP) -> Option<u32> {
        let hash = self.get_obj(class)?.hash;
        match self.class_table.get(&hash) {
            Some(&id) if OOP::Object(id) == class => Some(hash),
            _ => None,
        }
    }

    pub(crate) fn set_next_class_index(&mut self, index: u32) {
        self.next_class_index = index.max(FIRST_USER_CLASS_INDEX);
    }

    // Special objects

    pub fn special_objects(&self) -> OOP {
        OOP::Object(self.special_objects)
    }

    pub(crate) fn set_special_objects(&mut self, array: OOP) {
        if let Some(id) = array.as_oid() {
            self.special_objects = id;
        }
    }

    pub fn special(&self, index: usize) -> OOP {
        self.fetch_pointer(self.special_objects(), index).unwrap_or(NIL_PTR)
    }

    pub fn set_special(&mut self, index: usize, value: OOP) {
        self.put_ptr(self.special_objects(), index, value);
    }

    // Slot access

    pub fn fetch_pointer(&self, oop: OOP, field: usize) -> Option<OOP> {
        self.get_obj(oop)?.pointers().get(field).copied()
    }

    pub fn get_ptr(&self, oop: OOP, field: usize) -> OOP {
        match self.fetch_pointer(oop, field) {
            Some(value) => value,
            None => {
                warn!("read of {:?}[{}] out of range", oop, field);
                NIL_PTR
            }
        }
    }

    /// Store with the write barrier: an old object that gains a young referent turns dirty.
    pub fn store_pointer(&mut self, oop: OOP, field: usize, value: OOP) -> Option<()> {
        let young_value = self.is_young(value);
        let obj = self.get_obj_mut(oop)?;
        let slot = obj.pointers_mut().get_mut(field)?;
        *slot = value;
        if young_value && !obj.is_young() {
            obj.dirty = true;
        }
        Some(())
    }

    pub fn put_ptr(&mut self, oop: OOP, field: usize, value: OOP) {
        if self.store_pointer(oop, field, value).is_none() {
            warn!("store into {:?}[{}] out of range", oop, field);
        }
    }

    pub fn pointers(&self, oop: OOP) -> &[OOP] {
        self.get_obj(oop).map_or(&[], Object::pointers)
    }

    /// Bulk pointer access. Old objects are marked dirty unconditionally.
    pub fn pointers_mut(&mut self, oop: OOP) -> Option<&mut [OOP]> {
        let obj = self.get_obj_mut(oop)?;
        if !obj.is_young() {
            obj.dirty = true;
        }
        Some(obj.pointers_mut())
    }

    pub fn slot_count(&self, oop: OOP) -> usize {
        self.pointers(oop).len()
    }

    pub fn get_word(&self, oop: OOP, index: usize) -> Option<Word> {
        match &self.get_obj(oop)?.body {
            Body::Words(words) => words.get(index).copied(),
            Body::Float(value) => {
                let bits = value.to_bits();
                match index {
                    0 => Some((bits >> 32) as Word),
                    1 => Some(bits as Word),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    pub fn put_word(&mut self, oop: OOP, index: usize, value: Word) -> Option<()> {
        match &mut self.get_obj_mut(oop)?.body {
            Body::Words(words) => {
                *words.get_mut(index)? = value;
            }
            Body::Float(float) => {
                let bits = float.to_bits();
                let bits = match index {
                    0 => (bits & 0xFFFF_FFFF) | ((value as u64) << 32),
                    1 => (bits & !0xFFFF_FFFF) | value as u64,
                    _ => return None,
                };
                *float = f64::from_bits(bits);
            }
            _ => return None,
        }
        Some(())
    }

    pub fn words(&self, oop: OOP) -> &[Word] {
        match self.get_obj(oop).map(|obj| &obj.body) {
            Some(Body::Words(words)) => words,
            _ => &[],
        }
    }

    pub fn words_mut(&mut self, oop: OOP) -> Option<&mut Vec<Word>> {
        match &mut self.get_obj_mut(oop)?.body {
            Body::Words(words) => Some(words),
            _ => None,
        }
    }

    pub fn word_length(&self, oop: OOP) -> usize {
        match self.get_obj(oop).map(|obj| &obj.body) {
            Some(Body::Words(words)) => words.len(),
            Some(Body::Float(_)) => 2,
            _ => 0,
        }
    }

    /// Raw bytes of a byte object, or the bytecode part of a method.
    pub fn bytes(&self, oop: OOP) -> &[u8] {
        match self.get_obj(oop).map(|obj| &obj.body) {
            Some(Body::Bytes(bytes)) => bytes,
            Some(Body::Method { bytes, .. }) => bytes,
            _ => &[],
        }
    }

    pub fn bytes_mut(&mut self, oop: OOP) -> Option<&mut Vec<u8>> {
        match &mut self.get_obj_mut(oop)?.body {
            Body::Bytes(bytes) => Some(bytes),
            Body::Method { bytes, .. } => Some(bytes),
            _ => None,
        }
    }

    pub fn get_byte(&self, oop: OOP, index: usize) -> Option<u8> {
        self.bytes(oop).get(index).copied()
    }

    pub fn put_byte(&mut self, oop: OOP, index: usize, value: u8) -> Option<()> {
        *self.bytes_mut(oop)?.get_mut(index)? = value;
        Some(())
    }

    pub fn byte_length(&self, oop: OOP) -> usize {
        self.bytes(oop).len()
    }

    pub fn is_bytes(&self, oop: OOP) -> bool {
        match self.get_obj(oop).map(|obj| &obj.body) {
            Some(Body::Bytes(_)) => true,
            _ => false,
        }
    }

    pub fn is_words(&self, oop: OOP) -> bool {
        match self.get_obj(oop).map(|obj| &obj.body) {
            Some(Body::Words(_)) => true,
            _ => false,
        }
    }

    pub fn is_pointers(&self, oop: OOP) -> bool {
        self.get_obj(oop).map_or(false, |obj| is_pointers_format(obj.format))
    }

    pub fn string_of(&self, oop: OOP) -> Cow<str> {
        String::from_utf8_lossy(self.bytes(oop))
    }

    pub fn transfer_fields(
        &mut self,
        count: usize,
        from_obj: OOP,
        from_field: usize,
        to_obj: OOP,
        to_field: usize,
    ) {
        for i in 0..count {
            let value = self.get_ptr(from_obj, from_field + i);
            self.put_ptr(to_obj, to_field + i, value);
            self.put_ptr(from_obj, from_field + i, NIL_PTR);
        }
    }

    // Enumeration

    pub fn initial_instance_of(&self, class: OOP) -> Option<OOP> {
        let class = class.as_oid()?;
        self.object_ids()
            .find(|&id| self.object(id).map_or(false, |obj| obj.class == class))
            .map(OOP::Object)
    }

    pub fn next_instance_of(&self, oop: OOP) -> Option<OOP> {
        let class = self.get_obj(oop)?.class;
        let mut position = self.position_of(oop)?;
        loop {
            position += 1;
            let id = self.object_at(position)?;
            if self.object(id).map_or(false, |obj| obj.class == class) {
                return Some(OOP::Object(id));
            }
        }
    }

    pub fn first_object(&self) -> Option<OOP> {
        self.object_at(0).map(OOP::Object)
    }

    pub fn next_object(&self, oop: OOP) -> Option<OOP> {
        let position = self.position_of(oop)?;
        self.object_at(position + 1).map(OOP::Object)
    }
}

#[cfg(test)]
mod tests {
    use super::builder::MemoryBuilder;
    use super::*;

    #[test]
    fn immediates_are_tagged_by_variant() {
        assert_eq!(OOP::try_from_integer(SMALLINT_MAX), Some(OOP::Int(0x3FFF_FFFF)));
        assert_eq!(OOP::try_from_integer(SMALLINT_MAX + 1), None);
        assert_eq!(OOP::try_from_integer(SMALLINT_MIN - 1), None);
        assert!(OOP::Int(3).is_integer());
        assert!(!OOP::Char(65).is_object());
        assert!(NIL_PTR.is_nil());
    }

    #[test]
    fn store_into_old_object_sets_dirty_bit() {
        let mut memory = MemoryBuilder::new(MemoryKind::V3).build();
        let array = memory.new_array(vec![NIL_PTR; 2]);
        memory.tenure_all();
        assert!(!memory.is_young(array));

        memory.put_ptr(array, 0, OOP::Int(7));
        assert!(!memory.get_obj(array).unwrap().dirty);

        let young = memory.new_array(vec![]);
        memory.put_ptr(array, 1, young);
        assert!(memory.get_obj(array).unwrap().dirty);
    }

    #[test]
    fn instantiate_follows_class_format() {
        let mut builder = MemoryBuilder::new(MemoryKind::Spur);
        let point = builder.class_named("Point");
        let byte_array = builder.class_named("ByteArray");
        let mut memory = builder.build();

        let pt = memory.instantiate_class(point, 0).unwrap();
        assert_eq!(memory.pointers(pt), &[NIL_PTR, NIL_PTR]);

        let bytes = memory.instantiate_class(byte_array, 5).unwrap();
        assert_eq!(memory.bytes(bytes), &[0; 5]);
        assert_eq!(memory.get_class_of(bytes), byte_array);
    }

    #[test]
    fn float_words_are_high_word_first() {
        let mut memory = MemoryBuilder::new(MemoryKind::V3).build();
        let one = memory.new_float(1.0);
        assert_eq!(memory.get_word(one, 0), Some(0x3FF0_0000));
        assert_eq!(memory.get_word(one, 1), Some(0));
        memory.put_word(one, 0, 0x4000_0000).unwrap();
        assert_eq!(memory.float_value(one), Some(2.0));
    }

    #[test]
    fn spur_hashes_are_assigned_lazily() {
        let mut memory = MemoryBuilder::new(MemoryKind::Spur).build();
        let obj = memory.new_array(vec![]);
        assert_eq!(memory.hash_of(obj), 0);
        let hash = memory.identity_hash(obj);
        assert_ne!(hash, 0);
        assert_eq!(memory.identity_hash(obj), hash);
    }

    #[test]
    fn enumeration_resumes_from_each_object_across_collections() {
        let mut memory = MemoryBuilder::new(MemoryKind::V3).build();
        memory.tenure_all();
        let a = memory.new_array(vec![]);
        let b = memory.new_array(vec![]);
        let c = memory.new_array(vec![]);
        memory.partial_gc(&[a, c]);
        assert!(memory.get_obj(b).is_none());
        let d = memory.new_array(vec![]);

        assert_eq!(memory.next_object(a), Some(c));
        assert_eq!(memory.next_instance_of(a), Some(c));
        assert_eq!(memory.next_instance_of(c), Some(d));
        assert_eq!(memory.next_instance_of(d), None);

        let mut seen = Vec::new();
        let mut cursor = memory.first_object();
        while let Some(oop) = cursor {
            seen.push(oop);
            cursor = memory.next_object(oop);
        }
        assert_eq!(seen.len(), memory.object_count());
        assert_eq!(&seen[seen.len() - 3..], &[a, c, d]);

        memory.full_gc(&[d]);
        let first = memory.first_object().unwrap();
        let mut count = 1;
        let mut cursor = memory.next_object(first);
        while let Some(oop) = cursor {
            count += 1;
            cursor = memory.next_object(oop);
        }
        assert_eq!(count, memory.object_count());
    }
}
