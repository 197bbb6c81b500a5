//! Object format numbers and the two word encodings (class format, method header) that
//! differ between V3 and Spur memories.

pub const FMT_EMPTY: u8 = 0;
pub const FMT_FIXED: u8 = 1;
pub const FMT_INDEXABLE: u8 = 2;
pub const FMT_FIXED_INDEXABLE: u8 = 3;
pub const FMT_WEAK: u8 = 4;
pub const FMT_EPHEMERON: u8 = 5;
pub const FMT_WORDS64: u8 = 9;
pub const FMT_WORDS: u8 = 10;
pub const FMT_SHORTS: u8 = 12;
pub const FMT_BYTES: u8 = 16;
pub const FMT_METHOD: u8 = 24;

pub const V3_HASH_MASK: u32 = 0xFFF;
pub const SPUR_HASH_MASK: u32 = 0x3F_FFFF;

/// Class indices below this are reserved for the memory manager's own bookkeeping.
pub const RESERVED_CLASS_INDICES: u32 = 32;
pub const FIRST_USER_CLASS_INDEX: u32 = 1024;

pub const SPUR_SMALL_INTEGER_CLASS_INDEX: u32 = 1;
pub const SPUR_CHARACTER_CLASS_INDEX: u32 = 2;

pub fn is_pointers_format(format: u8) -> bool {
    format <= FMT_EPHEMERON
}

pub fn is_indexable_pointers(format: u8) -> bool {
    format == FMT_INDEXABLE || format == FMT_FIXED_INDEXABLE || format == FMT_WEAK
}

pub fn is_weak_format(format: u8) -> bool {
    format == FMT_WEAK
}

pub fn is_words_format(format: u8) -> bool {
    format >= FMT_WORDS64 && format < FMT_SHORTS
}

pub fn is_bytes_format(format: u8) -> bool {
    format >= FMT_SHORTS && format < FMT_METHOD
}

pub fn is_method_format(format: u8) -> bool {
    format >= FMT_METHOD
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ClassFormat {
    pub inst_size: usize,
    pub inst_spec: u8,
}

impl ClassFormat {
    pub fn new(inst_size: usize, inst_spec: u8) -> Self {
        ClassFormat {
            inst_size,
            inst_spec,
        }
    }

    pub fn is_indexable(&self) -> bool {
        self.inst_spec >= FMT_INDEXABLE && self.inst_spec != FMT_EPHEMERON
    }

    pub fn is_pointers(&self) -> bool {
        is_pointers_format(self.inst_spec)
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MethodHeader {
    pub num_literals: usize,
    pub num_temps: usize,
    pub num_args: usize,
    /// Zero for methods without a primitive.
    pub primitive: usize,
    pub large_frame: bool,
    /// The method is encoded in the Sista V1 bytecode set.
    pub sista: bool,
}

impl MethodHeader {
    /// Offset of the first bytecode as seen by the image (header plus literal frame).
    pub fn initial_pc_offset(&self) -> usize {
        (self.num_literals + 1) * 4
    }

    pub fn frame_size(&self) -> usize {
        if self.large_frame {
            super::specials::CONTEXT_LARGE_FRAME
        } else {
            super::specials::CONTEXT_SMALL_FRAME
        }
    }
}

pub const V3_CALL_PRIMITIVE: u8 = 139;
pub const SISTA_CALL_PRIMITIVE: u8 = 248;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MemoryKind {
    V3,
    Spur,
}

impl MemoryKind {
    pub fn from_version(version: u32) -> Option<MemoryKind> {
        match version {
            6501 | 6502 | 6504 | 6505 => Some(MemoryKind::V3),
            6521 => Some(MemoryKind::Spur),
            _ => None,
        }
    }

    pub fn default_version(self) -> u32 {
        match self {
            MemoryKind::V3 => 6505,
            MemoryKind::Spur => 6521,
        }
    }

    pub fn class_format(self, raw: i64) -> ClassFormat {
        let f = raw as u32;
        match self {
            MemoryKind::V3 => {
                let inst_size = (((f >> 10) & 0xC0) + ((f >> 1) & 0x3F)).saturating_sub(1);
                let spec = ((f >> 7) & 0xF) as u8;
                let inst_spec = match spec {
                    0..=5 => spec,
                    6 | 7 => FMT_WORDS,
                    8..=11 => FMT_BYTES + (spec - 8),
                    _ => FMT_METHOD + (spec - 12),
                };
                ClassFormat::new(inst_size as usize, inst_spec)
            }
            MemoryKind::Spur => ClassFormat::new((f & 0xFFFF) as usize, ((f >> 16) & 0x1F) as u8),
        }
    }

    pub fn encode_class_format(self, format: ClassFormat) -> i64 {
        match self {
            MemoryKind::V3 => {
                let s = format.inst_size as i64 + 1;
                let spec = match format.inst_spec {
                    FMT_EPHEMERON => FMT_FIXED,
                    spec @ 0..=4 => spec,
                    9..=11 => 6,
                    12..=23 => 8,
                    _ => 12,
                } as i64;
                ((s & 0x3F) << 1) | ((s & 0xC0) << 10) | (spec << 7)
            }
            MemoryKind::Spur => ((format.inst_spec as i64) << 16) | format.inst_size as i64,
        }
    }

    /// Decode a method header word. Spur keeps the primitive index in the operand of the
    /// leading callPrimitive bytecode, so the bytecodes are needed too.
    pub fn method_header(self, raw: i64, bytecodes: &[u8]) -> MethodHeader {
        let h = (raw & 0x3FFF_FFFF) as u32;
        let large_frame = h & (1 << 17) != 0;
        let num_temps = ((h >> 18) & 0x3F) as usize;
        let num_args = ((h >> 24) & 0xF) as usize;
        match self {
            MemoryKind::V3 => MethodHeader {
                num_literals: ((h >> 9) & 0xFF) as usize,
                num_temps,
                num_args,
                primitive: ((h & 0x1FF) | ((h >> 19) & 0x600)) as usize,
                large_frame,
                sista: false,
            },
            MemoryKind::Spur => {
                let primitive = match bytecodes {
                    [op, lo, hi, ..]
                        if h & (1 << 16) != 0
                            && (*op == V3_CALL_PRIMITIVE || *op == SISTA_CALL_PRIMITIVE) =>
                    {
                        *lo as usize | (*hi as usize) << 8
                    }
                    _ => 0,
                };
                MethodHeader {
                    num_literals: (h & 0x7FFF) as usize,
                    num_temps,
                    num_args,
                    primitive,
                    large_frame,
                    sista: raw < 0,
                }
            }
        }
    }

    pub fn encode_method_header(self, header: &MethodHeader) -> i64 {
        let common = (header.large_frame as i64) << 17
            | (header.num_temps as i64 & 0x3F) << 18
            | (header.num_args as i64 & 0xF) << 24;
        match self {
            MemoryKind::V3 => {
                let prim = header.primitive as i64;
                common
                    | (prim & 0x1FF)
                    | (prim & 0x600) << 19
                    | (header.num_literals as i64 & 0xFF) << 9
            }
            MemoryKind::Spur => {
                let word = common
                    | (header.num_literals as i64 & 0x7FFF)
                    | ((header.primitive > 0) as i64) << 16;
                if header.sista {
                    word + super::SMALLINT_MIN
                } else {
                    word
                }
            }
        }
    }

    /// Literal count straight from the raw header word of an image file.
    pub(crate) fn raw_literal_count(self, raw: u32) -> usize {
        match self {
            MemoryKind::V3 => ((raw >> 10) & 0xFF) as usize,
            MemoryKind::Spur => (((raw as i32) >> 1) & 0x7FFF) as usize,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v3_class_format_maps_to_spur_numbering() {
        // Array: variable pointers, no named slots
        let array = MemoryKind::V3.class_format(0x0102);
        assert_eq!(array, ClassFormat::new(0, FMT_INDEXABLE));
        // Point: two named slots
        let point = MemoryKind::V3.class_format(0x0086);
        assert_eq!(point, ClassFormat::new(2, FMT_FIXED));
        // ByteString
        assert_eq!(MemoryKind::V3.class_format(0x0402).inst_spec, FMT_BYTES);
        // CompiledMethod
        assert_eq!(MemoryKind::V3.class_format(0x0602).inst_spec, FMT_METHOD);
    }

    #[test]
    fn class_format_encoding_is_stable() {
        for &kind in &[MemoryKind::V3, MemoryKind::Spur] {
            let fmt = ClassFormat::new(200, FMT_FIXED_INDEXABLE);
            assert_eq!(kind.class_format(kind.encode_class_format(fmt)), fmt);
        }
    }

    #[test]
    fn v3_primitive_uses_high_bits() {
        let header = MethodHeader {
            num_literals: 3,
            num_temps: 2,
            num_args: 1,
            primitive: 0x610,
            large_frame: true,
            sista: false,
        };
        let raw = MemoryKind::V3.encode_method_header(&header);
        assert!(raw <= super::super::SMALLINT_MAX);
        assert_eq!(MemoryKind::V3.method_header(raw, &[]), header);
    }

    #[test]
    fn spur_primitive_comes_from_call_primitive_operand() {
        let header = MethodHeader {
            num_literals: 2,
            num_temps: 0,
            num_args: 0,
            primitive: 0,
            large_frame: false,
            sista: true,
        };
        let raw = MemoryKind::Spur.encode_method_header(&MethodHeader {
            primitive: 60,
            ..header
        });
        assert!(raw < 0);
        let decoded = MemoryKind::Spur.method_header(raw, &[248, 60, 0, 0x5C]);
        assert_eq!(decoded.primitive, 60);
        assert!(decoded.sista);
        assert_eq!(decoded.num_literals, 2);
        assert_eq!(MemoryKind::Spur.method_header(raw, &[0x5C]).primitive, 0);
    }
}
