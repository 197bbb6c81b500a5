//! Bytecode decoders. Each instruction set gets its own table-driven decoder; both produce the
//! same `Insn` so the dispatcher and the compiler only have to know one vocabulary.

use crate::objectmemory::{FALSE_PTR, NIL_PTR, OOP, TRUE_PTR};

#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Debug)]
pub enum Insn {
    PushReceiverVar(usize),
    PushTemporary(usize),
    PushConst(OOP),
    PushLiteralConst(usize),
    PushLiteralVar(usize),
    PushReceiver,
    PushCtx,
    PushNewArray(usize),
    PopIntoNewArray(usize),
    /// temp index, index of the temp holding the vector
    PushRemoteTemp(usize, usize),
    StoreRemoteTemp(usize, usize),
    PopRemoteTemp(usize, usize),
    PushClosure {
        num_args: usize,
        num_copied: usize,
        block_size: usize,
    },
    PushFullClosure {
        literal: usize,
        num_copied: usize,
        ignore_outer: bool,
        receiver_on_stack: bool,
    },
    PopReceiverVar(usize),
    PopTemporary(usize),
    PopLiteralVar(usize),
    StoreReceiverVar(usize),
    StoreTemporary(usize),
    StoreLiteralVar(usize),
    MessageReturnRcvr,
    MessageReturnOOP(OOP),
    MessageReturn,
    BlockReturn,
    BlockReturnOOP(OOP),
    SendLiteral(usize, usize), // selector, arguments
    SendLiteralSuper(usize, usize),
    /// Super send starting above a class popped off the stack.
    SendDirectedSuper(usize, usize),
    SendSpecial(usize),
    Pop,
    Dup,
    Nop,
    Jump(isize),
    JumpFalse(isize), // pop and jump
    JumpTrue(isize),
    CallPrimitive(usize),
    Trap,

    Illegal(u8),
}

impl Insn {
    pub fn jump_offset(self) -> Option<isize> {
        match self {
            Insn::Jump(offset) | Insn::JumpFalse(offset) | Insn::JumpTrue(offset) => Some(offset),
            _ => None,
        }
    }
}

/// Decode the instruction at `ip`, returning it and its length in bytes.
pub fn decode_insn(bytecode: &[u8], ip: usize, sista: bool) -> (Insn, usize) {
    let (insn, size) = if sista {
        decode_sista(bytecode, ip)
    } else {
        decode_v3(bytecode, ip)
    };
    if ip + size > bytecode.len() {
        // ran off the end of the method
        (Insn::Illegal(bytecode.get(ip).copied().unwrap_or(0)), 1)
    } else {
        (insn, size)
    }
}

pub fn decode_v3(bytecode: &[u8], ip: usize) -> (Insn, usize) {
    let mut fetch_ip = ip;
    let mut next_byte = || {
        let byte = bytecode.get(fetch_ip).copied().unwrap_or(0);
        fetch_ip += 1;
        byte
    };
    let insn = next_byte();
    let decoded = match insn {
        0x00..=0x0F => Insn::PushReceiverVar(insn as usize & 0xF),
        0x10..=0x1F => Insn::PushTemporary(insn as usize & 0xF),
        0x20..=0x3F => Insn::PushLiteralConst(insn as usize & 0x1F),
        0x40..=0x5F => Insn::PushLiteralVar(insn as usize & 0x1F),
        0x60..=0x67 => Insn::PopReceiverVar(insn as usize & 0x07),
        0x68..=0x6F => Insn::PopTemporary(insn as usize & 0x07),
        0x70 => Insn::PushReceiver,
        0x71 => Insn::PushConst(TRUE_PTR),
        0x72 => Insn::PushConst(FALSE_PTR),
        0x73 => Insn::PushConst(NIL_PTR),
        0x74 => Insn::PushConst(OOP::from(-1)),
        0x75 => Insn::PushConst(OOP::from(0)),
        0x76 => Insn::PushConst(OOP::from(1)),
        0x77 => Insn::PushConst(OOP::from(2)),
        0x78 => Insn::MessageReturnRcvr,
        0x79 => Insn::MessageReturnOOP(TRUE_PTR),
        0x7A => Insn::MessageReturnOOP(FALSE_PTR),
        0x7B => Insn::MessageReturnOOP(NIL_PTR),
        0x7C => Insn::MessageReturn,
        0x7D => Insn::BlockReturn,
        0x7E..=0x7F => Insn::Illegal(insn),
        0x80 => {
            let next = next_byte();
            let sub = next as usize & 0x3F;
            match next & 0xC0 {
                0x00 => Insn::PushReceiverVar(sub),
                0x40 => Insn::PushTemporary(sub),
                0x80 => Insn::PushLiteralConst(sub),
                _ => Insn::PushLiteralVar(sub),
            }
        }
        0x81 => {
            let next = next_byte();
            let sub = next as usize & 0x3F;
            match next & 0xC0 {
                0x00 => Insn::StoreReceiverVar(sub),
                0x40 => Insn::StoreTemporary(sub),
                0x80 => Insn::Illegal(insn),
                _ => Insn::StoreLiteralVar(sub),
            }
        }
        0x82 => {
            let next = next_byte();
            let sub = next as usize & 0x3F;
            match next & 0xC0 {
                0x00 => Insn::PopReceiverVar(sub),
                0x40 => Insn::PopTemporary(sub),
                0x80 => Insn::Illegal(insn),
                _ => Insn::PopLiteralVar(sub),
            }
        }
        0x83 => {
            let next = next_byte() as usize;
            Insn::SendLiteral(next & 0x1F, next >> 5)
        }
        0x84 => {
            let first = next_byte() as usize;
            let second = next_byte() as usize;
            match first >> 5 {
                0 => Insn::SendLiteral(second, first & 0x1F),
                1 => Insn::SendLiteralSuper(second, first & 0x1F),
                2 => Insn::PushReceiverVar(second),
                3 => Insn::PushLiteralConst(second),
                4 => Insn::PushLiteralVar(second),
                5 => Insn::StoreReceiverVar(second),
                6 => Insn::PopReceiverVar(second),
                _ => Insn::StoreLiteralVar(second),
            }
        }
        0x85 => {
            let next = next_byte() as usize;
            Insn::SendLiteralSuper(next & 0x1F, next >> 5)
        }
        0x86 => {
            let next = next_byte() as usize;
            Insn::SendLiteral(next & 0x3F, next >> 6)
        }
        0x87 => Insn::Pop,
        0x88 => Insn::Dup,
        0x89 => Insn::PushCtx,
        0x8A => {
            let next = next_byte() as usize;
            if next & 0x80 != 0 {
                Insn::PopIntoNewArray(next & 0x7F)
            } else {
                Insn::PushNewArray(next & 0x7F)
            }
        }
        0x8B => {
            let lo = next_byte() as usize;
            let hi = next_byte() as usize;
            Insn::CallPrimitive(lo | hi << 8)
        }
        0x8C => {
            let index = next_byte() as usize;
            let vector = next_byte() as usize;
            Insn::PushRemoteTemp(index, vector)
        }
        0x8D => {
            let index = next_byte() as usize;
            let vector = next_byte() as usize;
            Insn::StoreRemoteTemp(index, vector)
        }
        0x8E => {
            let index = next_byte() as usize;
            let vector = next_byte() as usize;
            Insn::PopRemoteTemp(index, vector)
        }
        0x8F => {
            let counts = next_byte() as usize;
            let hi = next_byte() as usize;
            let lo = next_byte() as usize;
            Insn::PushClosure {
                num_args: counts & 0xF,
                num_copied: counts >> 4,
                block_size: hi << 8 | lo,
            }
        }
        0x90..=0x97 => Insn::Jump((insn as isize & 0x7) + 1),
        0x98..=0x9F => Insn::JumpFalse((insn as isize & 0x7) + 1),
        0xA0..=0xA7 => {
            let next = next_byte() as isize;
            Insn::Jump((((insn as isize & 0x7) - 4) << 8) + next)
        }
        0xA8..=0xAB => {
            let next = next_byte() as isize;
            Insn::JumpTrue(((insn as isize & 0x3) << 8) + next)
        }
        0xAC..=0xAF => {
            let next = next_byte() as isize;
            Insn::JumpFalse(((insn as isize & 0x3) << 8) + next)
        }
        0xB0..=0xCF => Insn::SendSpecial(insn as usize - 0xB0),
        0xD0..=0xDF => Insn::SendLiteral(insn as usize & 0xF, 0),
        0xE0..=0xEF => Insn::SendLiteral(insn as usize & 0xF, 1),
        0xF0..=0xFF => Insn::SendLiteral(insn as usize & 0xF, 2),
    };
    (decoded, fetch_ip - ip)
}

/// Sista V1. Extension prefixes (0xE0 extA, 0xE1 extB) are folded into the instruction
/// they prefix, so the returned length covers them.
pub fn decode_sista(bytecode: &[u8], ip: usize) -> (Insn, usize) {
    let mut fetch_ip = ip;
    let mut next_byte = || {
        let byte = bytecode.get(fetch_ip).copied().unwrap_or(0);
        fetch_ip += 1;
        byte
    };
    let mut ext_a: usize = 0;
    let mut ext_b: isize = 0;
    let mut insn = next_byte();
    loop {
        match insn {
            0xE0 => ext_a = (ext_a << 8) + next_byte() as usize,
            0xE1 => {
                let byte = next_byte() as isize;
                ext_b = if ext_b == 0 && byte > 127 {
                    byte - 256
                } else {
                    (ext_b << 8) + byte
                };
            }
            _ => break,
        }
        insn = next_byte();
    }

    let decoded = match insn {
        0x00..=0x0F => Insn::PushReceiverVar(insn as usize & 0xF),
        0x10..=0x1F => Insn::PushLiteralVar(insn as usize & 0xF),
        0x20..=0x3F => Insn::PushLiteralConst(insn as usize & 0x1F),
        0x40..=0x47 => Insn::PushTemporary(insn as usize & 0x7),
        0x48..=0x4B => Insn::PushTemporary((insn as usize & 0x3) + 8),
        0x4C => Insn::PushReceiver,
        0x4D => Insn::PushConst(TRUE_PTR),
        0x4E => Insn::PushConst(FALSE_PTR),
        0x4F => Insn::PushConst(NIL_PTR),
        0x50 => Insn::PushConst(OOP::from(0)),
        0x51 => Insn::PushConst(OOP::from(1)),
        0x52 => Insn::PushCtx,
        0x53 => Insn::Dup,
        0x58 => Insn::MessageReturnRcvr,
        0x59 => Insn::MessageReturnOOP(TRUE_PTR),
        0x5A => Insn::MessageReturnOOP(FALSE_PTR),
        0x5B => Insn::MessageReturnOOP(NIL_PTR),
        0x5C => Insn::MessageReturn,
        0x5D => Insn::BlockReturnOOP(NIL_PTR),
        0x5E => Insn::BlockReturn,
        0x5F => Insn::Nop,
        0x60..=0x6F => Insn::SendSpecial(insn as usize & 0xF),
        0x70..=0x7F => Insn::SendSpecial((insn as usize & 0xF) + 16),
        0x80..=0x8F => Insn::SendLiteral(insn as usize & 0xF, 0),
        0x90..=0x9F => Insn::SendLiteral(insn as usize & 0xF, 1),
        0xA0..=0xAF => Insn::SendLiteral(insn as usize & 0xF, 2),
        0xB0..=0xB7 => Insn::Jump((insn as isize & 0x7) + 1),
        0xB8..=0xBF => Insn::JumpTrue((insn as isize & 0x7) + 1),
        0xC0..=0xC7 => Insn::JumpFalse((insn as isize & 0x7) + 1),
        0xC8..=0xCF => Insn::PopReceiverVar(insn as usize & 0x7),
        0xD0..=0xD7 => Insn::PopTemporary(insn as usize & 0x7),
        0xD8 => Insn::Pop,
        0xD9 => Insn::Trap,
        0xE2 => Insn::PushReceiverVar(next_byte() as usize + (ext_a << 8)),
        0xE3 => Insn::PushLiteralVar(next_byte() as usize + (ext_a << 8)),
        0xE4 => Insn::PushLiteralConst(next_byte() as usize + (ext_a << 8)),
        0xE5 => Insn::PushTemporary(next_byte() as usize),
        0xE7 => {
            let next = next_byte() as usize;
            if next & 0x80 != 0 {
                Insn::PopIntoNewArray(next & 0x7F)
            } else {
                Insn::PushNewArray(next & 0x7F)
            }
        }
        0xE8 => {
            let value = next_byte() as isize + (ext_b << 8);
            match OOP::try_from_integer(value as i64) {
                Some(oop) => Insn::PushConst(oop),
                None => Insn::Illegal(insn),
            }
        }
        0xE9 => Insn::PushConst(OOP::Char((next_byte() as isize + (ext_b << 8)) as u32)),
        0xEA => {
            let byte = next_byte() as usize;
            Insn::SendLiteral((byte >> 3) + (ext_a << 5), (byte & 7) + ((ext_b as usize) << 3))
        }
        0xEB => {
            let byte = next_byte() as usize;
            let selector = (byte >> 3) + (ext_a << 5);
            if ext_b >= 64 {
                Insn::SendDirectedSuper(selector, (byte & 7) + (((ext_b as usize) & 0x3F) << 3))
            } else {
                Insn::SendLiteralSuper(selector, (byte & 7) + ((ext_b as usize) << 3))
            }
        }
        0xED => Insn::Jump(next_byte() as isize + (ext_b << 8)),
        0xEE => Insn::JumpTrue(next_byte() as isize + (ext_b << 8)),
        0xEF => Insn::JumpFalse(next_byte() as isize + (ext_b << 8)),
        0xF0 => Insn::PopReceiverVar(next_byte() as usize + (ext_a << 8)),
        0xF1 => Insn::PopLiteralVar(next_byte() as usize + (ext_a << 8)),
        0xF2 => Insn::PopTemporary(next_byte() as usize),
        0xF3 => Insn::StoreReceiverVar(next_byte() as usize + (ext_a << 8)),
        0xF4 => Insn::StoreLiteralVar(next_byte() as usize + (ext_a << 8)),
        0xF5 => Insn::StoreTemporary(next_byte() as usize),
        0xF8 => {
            let lo = next_byte() as usize;
            let hi = next_byte() as usize;
            // the top bits of the high byte flag inlined primitives
            Insn::CallPrimitive(lo | (hi & 0x1F) << 8)
        }
        0xF9 => {
            let literal = next_byte() as usize + (ext_a << 8);
            let flags = next_byte() as usize;
            Insn::PushFullClosure {
                literal,
                num_copied: flags & 0x3F,
                ignore_outer: flags & 0x40 != 0,
                receiver_on_stack: flags & 0x80 != 0,
            }
        }
        0xFA => {
            let counts = next_byte() as usize;
            let size = next_byte() as usize;
            Insn::PushClosure {
                num_args: (counts & 7) + (ext_a % 16) * 8,
                num_copied: ((counts >> 3) & 7) + (ext_a / 16) * 8,
                block_size: size + ((ext_b as usize) << 8),
            }
        }
        0xFB => {
            let index = next_byte() as usize;
            let vector = next_byte() as usize & 0x7F;
            Insn::PushRemoteTemp(index, vector)
        }
        0xFC => {
            let index = next_byte() as usize;
            let vector = next_byte() as usize & 0x7F;
            Insn::StoreRemoteTemp(index, vector)
        }
        0xFD => {
            let index = next_byte() as usize;
            let vector = next_byte() as usize & 0x7F;
            Insn::PopRemoteTemp(index, vector)
        }
        _ => Insn::Illegal(insn),
    };
    (decoded, fetch_ip - ip)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v3_long_jumps_are_signed() {
        assert_eq!(decode_v3(&[0xA3, 0xFE], 0), (Insn::Jump(-2), 2));
        assert_eq!(decode_v3(&[0xA4, 0x10], 0), (Insn::Jump(16), 2));
        assert_eq!(decode_v3(&[0xAD, 0x01], 0), (Insn::JumpFalse(0x101), 2));
    }

    #[test]
    fn v3_closure_bytecodes() {
        assert_eq!(
            decode_v3(&[0x8F, 0x21, 0x00, 0x05], 0),
            (
                Insn::PushClosure {
                    num_args: 1,
                    num_copied: 2,
                    block_size: 5
                },
                4
            )
        );
        assert_eq!(decode_v3(&[0x8C, 3, 1], 0), (Insn::PushRemoteTemp(3, 1), 3));
        assert_eq!(decode_v3(&[0x8A, 0x83], 0), (Insn::PopIntoNewArray(3), 2));
        assert_eq!(decode_v3(&[0x8B, 0x3C, 0x00], 0), (Insn::CallPrimitive(60), 3));
    }

    #[test]
    fn v3_double_extended_do_anything() {
        assert_eq!(decode_v3(&[0x84, 0x22, 7], 0), (Insn::SendLiteralSuper(7, 2), 3));
        assert_eq!(decode_v3(&[0x84, 0xA0, 9], 0), (Insn::StoreReceiverVar(9), 3));
    }

    #[test]
    fn sista_extensions_fold_into_operands() {
        // extA 1, push literal 2 -> literal 258
        assert_eq!(decode_sista(&[0xE0, 0x01, 0xE4, 0x02], 0), (Insn::PushLiteralConst(258), 4));
        // negative extB makes a backward jump
        assert_eq!(decode_sista(&[0xE1, 0xFF, 0xED, 0xF0], 0), (Insn::Jump(-16), 4));
        // push integer 300
        assert_eq!(
            decode_sista(&[0xE1, 0x01, 0xE8, 0x2C], 0),
            (Insn::PushConst(OOP::Int(300)), 4)
        );
        // send #foo: (literal 33) with 1 arg
        assert_eq!(decode_sista(&[0xE0, 0x01, 0xEA, 0x09], 0), (Insn::SendLiteral(33, 1), 4));
    }

    #[test]
    fn sista_directed_super_send() {
        assert_eq!(
            decode_sista(&[0xE1, 0x40, 0xEB, 0x11], 0),
            (Insn::SendDirectedSuper(2, 1), 4)
        );
    }

    #[test]
    fn truncated_instruction_is_illegal() {
        assert_eq!(decode_insn(&[0x8F, 0x00], 0, false), (Insn::Illegal(0x8F), 1));
        assert_eq!(decode_insn(&[0x76, 0x7C], 1, false), (Insn::MessageReturn, 1));
    }
}
