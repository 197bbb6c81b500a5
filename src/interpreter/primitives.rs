//! Primitive dispatch, plus the arithmetic and float primitives.
//!
//! A primitive reads its receiver and arguments off the stack (`argument_count` of them
//! above the receiver) and on success replaces them with its result. On failure it returns
//! `None` with the stack untouched, optionally leaving a reason in `prim_fail_code`, and the
//! method body runs instead.

use super::Interpreter;
use crate::objectmemory::specials::*;
use crate::objectmemory::{MemoryKind, OOP, SMALLINT_MAX};
use crate::utils::floor_divmod;

mod control;
mod storage;
mod system;

pub const PRIM_ERR_GENERIC: u32 = 1;
pub const PRIM_ERR_BAD_RECEIVER: u32 = 2;
pub const PRIM_ERR_BAD_ARGUMENT: u32 = 3;
pub const PRIM_ERR_BAD_INDEX: u32 = 4;
pub const PRIM_ERR_BAD_NUM_ARGS: u32 = 5;
pub const PRIM_ERR_INAPPROPRIATE: u32 = 6;
pub const PRIM_ERR_UNSUPPORTED: u32 = 7;
pub const PRIM_ERR_NO_MODIFICATION: u32 = 8;
pub const PRIM_ERR_NO_MEMORY: u32 = 9;

/// Primitive run by each arithmetic special selector when both operands are SmallIntegers.
const SPECIAL_ARITH_PRIMS: [usize; 16] = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 18, 17, 12, 14, 15];

impl Interpreter {
    pub(crate) fn dispatch_prim(&mut self, index: usize) -> Option<()> {
        match index {
            1..=18 => self.prim_small_integer(index),
            21..=37 => self.prim_large_integer(index - 20),
            38..=59 => self.dispatch_prim_float(index),
            85 => self.prim_signal(),
            86 => self.prim_wait(),
            87 => self.prim_resume(),
            88 => self.prim_suspend(),
            167 => self.prim_yield(),
            185 => self.prim_exit_critical_section(),
            186 => self.prim_enter_critical_section(),
            187 => self.prim_test_and_set_ownership(),
            117 => self.prim_external_call(),
            60..=79 | 105 | 115 | 128 | 132 | 138..=148 | 160..=178 | 210..=212 | 249 => {
                self.dispatch_prim_storage(index)
            }
            80..=84 | 100 | 118 | 188 | 189 | 195..=209 | 221 | 222 | 248 => {
                self.dispatch_prim_control(index)
            }
            89 | 97 | 110..=137 | 230 | 240..=242 | 254 => self.dispatch_prim_system(index),
            _ => self.fail(PRIM_ERR_UNSUPPORTED),
        }
    }

    /// Fail with a reason code.
    pub(crate) fn fail<T>(&mut self, code: u32) -> Option<T> {
        self.prim_fail_code = code;
        None
    }

    /// Bytecode shortcut for the special selectors: arithmetic on SmallIntegers and Floats,
    /// `==`, `class` and the legacy block selectors. `None` means do a real send.
    pub(crate) fn special_selector_quick(&mut self, index: usize) -> Option<()> {
        match index {
            0..=15 => {
                let receiver = self.stack_value(1);
                let arg = self.stack_value(0);
                self.argument_count = 1;
                if receiver.is_integer() && arg.is_integer() {
                    self.prim_small_integer(SPECIAL_ARITH_PRIMS[index])
                } else if index < 10 && self.memory.float_value(receiver).is_some() {
                    self.dispatch_prim_float(41 + index)
                } else {
                    None
                }
            }
            22 => {
                let arg = self.pop();
                let receiver = self.pop();
                self.push(Self::bool_oop(receiver == arg));
                Some(())
            }
            23 => {
                let class = self.memory.get_class_of(self.stack_top());
                self.pop_then_push(1, class);
                Some(())
            }
            24 if self.is_context(self.stack_value(1)) => {
                self.argument_count = 1;
                self.prim_block_copy()
            }
            25 | 26 => {
                let argc = index - 25;
                let receiver = self.stack_value(argc);
                let block_context = self.memory.special(CLASS_BLOCK_CONTEXT);
                if self.memory.get_class_of(receiver) != block_context {
                    return None;
                }
                self.argument_count = argc;
                self.prim_block_value()
            }
            _ => None,
        }
    }

    // Integers

    /// A SmallInteger when it fits, otherwise a LargePositive/NegativeInteger.
    pub(crate) fn integer_oop(&mut self, value: i64) -> OOP {
        if let Some(oop) = OOP::try_from_integer(value) {
            return oop;
        }
        let class = if value < 0 {
            self.memory.special(CLASS_LARGE_NEGATIVE_INTEGER)
        } else {
            self.memory.special(CLASS_LARGE_POSITIVE_INTEGER)
        };
        self.large_integer(class, value.wrapping_abs() as u64)
    }

    pub(crate) fn positive_oop(&mut self, value: u64) -> OOP {
        if value <= SMALLINT_MAX as u64 {
            return OOP::Int(value as i32);
        }
        let class = self.memory.special(CLASS_LARGE_POSITIVE_INTEGER);
        self.large_integer(class, value)
    }

    fn large_integer(&mut self, class: OOP, magnitude: u64) -> OOP {
        let mut bytes = magnitude.to_le_bytes().to_vec();
        while bytes.len() > 1 && bytes[bytes.len() - 1] == 0 {
            bytes.pop();
        }
        self.memory.new_bytes(class, bytes)
    }

    /// Value of a SmallInteger or of a LargeInteger that fits in 64 bits.
    pub(crate) fn integer_value_of(&self, oop: OOP) -> Option<i64> {
        if let OOP::Int(value) = oop {
            return Some(value as i64);
        }
        let class = self.memory.get_class_of(oop);
        let negative = if class == self.memory.special(CLASS_LARGE_POSITIVE_INTEGER) {
            false
        } else if class == self.memory.special(CLASS_LARGE_NEGATIVE_INTEGER) {
            true
        } else {
            return None;
        };
        let bytes = self.memory.bytes(oop);
        if bytes.len() > 8 {
            return None;
        }
        let mut buf = [0u8; 8];
        buf[..bytes.len()].copy_from_slice(bytes);
        let magnitude = u64::from_le_bytes(buf);
        if negative {
            if magnitude > 1 << 63 {
                None
            } else {
                Some((magnitude as i64).wrapping_neg())
            }
        } else if magnitude > i64::max_value() as u64 {
            None
        } else {
            Some(magnitude as i64)
        }
    }

    pub(crate) fn positive_value_of(&self, oop: OOP) -> Option<u64> {
        if let OOP::Int(value) = oop {
            return if value >= 0 { Some(value as u64) } else { None };
        }
        if self.memory.get_class_of(oop) != self.memory.special(CLASS_LARGE_POSITIVE_INTEGER) {
            return None;
        }
        let bytes = self.memory.bytes(oop);
        if bytes.len() > 8 {
            return None;
        }
        let mut buf = [0u8; 8];
        buf[..bytes.len()].copy_from_slice(bytes);
        Some(u64::from_le_bytes(buf))
    }

    pub(crate) fn char_oop(&self, value: u32) -> Option<OOP> {
        match self.memory.kind() {
            MemoryKind::Spur => Some(OOP::Char(value)),
            MemoryKind::V3 => {
                let table = self.memory.special(CHARACTER_TABLE);
                self.memory.fetch_pointer(table, value as usize)
            }
        }
    }

    pub(crate) fn char_value(&self, oop: OOP) -> Option<u32> {
        match oop {
            OOP::Char(value) => Some(value),
            OOP::Object(_) if self.check_class(oop, CLASS_CHARACTER).is_some() => {
                let value = self.memory.get_ptr(oop, 0).try_as_integer()?;
                Some(value as u32)
            }
            _ => None,
        }
    }

    fn prim_small_integer(&mut self, index: usize) -> Option<()> {
        let arg = self.stack_value(0).try_as_integer()?;
        let receiver = self.stack_value(1).try_as_integer()?;
        if index == 18 {
            return self.prim_make_point();
        }
        self.integer_op(index, receiver, arg)
    }

    fn prim_large_integer(&mut self, index: usize) -> Option<()> {
        let arg = self.integer_value_of(self.stack_value(0))?;
        let receiver = self.integer_value_of(self.stack_value(1))?;
        self.integer_op(index, receiver, arg)
    }

    /// Shared body of primitives 1-17 and 21-37, computed in 64 bits.
    fn integer_op(&mut self, index: usize, receiver: i64, arg: i64) -> Option<()> {
        let result = match index {
            1 => self.integer_oop(receiver.checked_add(arg)?),
            2 => self.integer_oop(receiver.checked_sub(arg)?),
            3 => Self::bool_oop(receiver < arg),
            4 => Self::bool_oop(receiver > arg),
            5 => Self::bool_oop(receiver <= arg),
            6 => Self::bool_oop(receiver >= arg),
            7 => Self::bool_oop(receiver == arg),
            8 => Self::bool_oop(receiver != arg),
            9 => self.integer_oop(receiver.checked_mul(arg)?),
            10 => {
                if arg == 0 || receiver.checked_rem(arg)? != 0 {
                    return None;
                }
                self.integer_oop(receiver.checked_div(arg)?)
            }
            11 | 12 => {
                if arg == 0 || (arg == -1 && receiver == i64::min_value()) {
                    return None;
                }
                let (div, modulo) = floor_divmod(receiver, arg);
                self.integer_oop(if index == 11 { modulo } else { div })
            }
            13 => {
                if arg == 0 {
                    return None;
                }
                self.integer_oop(receiver.checked_div(arg)?)
            }
            14 => self.integer_oop(receiver & arg),
            15 => self.integer_oop(receiver | arg),
            16 => self.integer_oop(receiver ^ arg),
            17 => {
                let shifted = if arg >= 0 {
                    if arg >= 63 && receiver != 0 {
                        return None;
                    }
                    let shifted = receiver.checked_shl(arg as u32)?;
                    if shifted >> arg != receiver {
                        return None;
                    }
                    shifted
                } else {
                    receiver >> (-arg).min(63)
                };
                self.integer_oop(shifted)
            }
            _ => return None,
        };
        self.pop_then_push(2, result);
        Some(())
    }

    fn prim_make_point(&mut self) -> Option<()> {
        let class = self.memory.special(CLASS_POINT);
        let point = self.instantiate_or_gc(class, 0)?;
        let x = self.stack_value(1);
        let y = self.stack_value(0);
        self.memory.put_ptr(point, POINT_X_INDEX, x);
        self.memory.put_ptr(point, POINT_Y_INDEX, y);
        self.pop_then_push(2, point);
        Some(())
    }

    // Floats

    /// A Float or SmallInteger as a double.
    pub(crate) fn float_arg(&self, oop: OOP) -> Option<f64> {
        match oop {
            OOP::Int(value) => Some(value as f64),
            _ => self.memory.float_value(oop),
        }
    }

    fn push_float(&mut self, count: usize, value: f64) -> Option<()> {
        let float = self.memory.new_float(value);
        self.pop_then_push(count, float);
        Some(())
    }

    fn dispatch_prim_float(&mut self, index: usize) -> Option<()> {
        match index {
            38 => self.prim_float_at(),
            39 => self.prim_float_at_put(),
            40 => {
                let value = self.stack_top().try_as_integer()?;
                self.push_float(1, value as f64)
            }
            41..=50 => {
                let receiver = self.memory.float_value(self.stack_value(1))?;
                let arg = self.float_arg(self.stack_value(0))?;
                let result = match index {
                    41 => receiver + arg,
                    42 => receiver - arg,
                    49 => receiver * arg,
                    50 => {
                        if arg == 0.0 {
                            return self.fail(PRIM_ERR_BAD_ARGUMENT);
                        }
                        receiver / arg
                    }
                    _ => {
                        let answer = match index {
                            43 => receiver < arg,
                            44 => receiver > arg,
                            45 => receiver <= arg,
                            46 => receiver >= arg,
                            47 => receiver == arg,
                            _ => receiver != arg,
                        };
                        self.pop_then_push(2, Self::bool_oop(answer));
                        return Some(());
                    }
                };
                self.push_float(2, result)
            }
            51..=59 => {
                let receiver = self.memory.float_value(self.stack_value(self.argument_count))?;
                self.prim_float_unary(index, receiver)
            }
            _ => None,
        }
    }

    fn prim_float_unary(&mut self, index: usize, x: f64) -> Option<()> {
        let result = match index {
            51 => {
                let truncated = x.trunc();
                if !truncated.is_finite() || truncated.abs() >= 9.223_372_036_854_775_807e18 {
                    return None;
                }
                let value = self.integer_oop(truncated as i64);
                self.pop_then_push(1, value);
                return Some(());
            }
            52 => x.fract(),
            53 => {
                let exponent = float_exponent(x);
                self.pop_then_push(1, OOP::Int(exponent));
                return Some(());
            }
            54 => {
                let power = self.stack_top().try_as_integer()?;
                let value = times_two_power(x, power);
                return self.push_float(2, value);
            }
            55 => x.sqrt(),
            56 => x.sin(),
            57 => x.atan(),
            58 => x.ln(),
            59 => x.exp(),
            _ => return None,
        };
        self.push_float(1, result)
    }

    /// Float basicAt: answers the words high word first.
    fn prim_float_at(&mut self) -> Option<()> {
        let index = self.stack_value(0).try_as_integer()?;
        let receiver = self.stack_value(1);
        if index != 1 && index != 2 {
            return self.fail(PRIM_ERR_BAD_INDEX);
        }
        let word = self.memory.get_word(receiver, index as usize - 1)?;
        let value = self.positive_oop(word as u64);
        self.pop_then_push(2, value);
        Some(())
    }

    fn prim_float_at_put(&mut self) -> Option<()> {
        let value = self.stack_value(0);
        let index = self.stack_value(1).try_as_integer()?;
        let receiver = self.stack_value(2);
        let word = self.positive_value_of(value)?;
        if index != 1 && index != 2 {
            return self.fail(PRIM_ERR_BAD_INDEX);
        }
        if word > u32::max_value() as u64 {
            return self.fail(PRIM_ERR_BAD_ARGUMENT);
        }
        self.memory
            .put_word(receiver, index as usize - 1, word as u32)?;
        self.pop_then_push(3, value);
        Some(())
    }
}

/// Binary exponent of `x`; zero for zero.
fn float_exponent(x: f64) -> i32 {
    if x == 0.0 || !x.is_finite() {
        return 0;
    }
    let biased = ((x.to_bits() >> 52) & 0x7FF) as i32;
    if biased == 0 {
        x.abs().log2().floor() as i32
    } else {
        biased - 1023
    }
}

/// `x * 2^power` without overflowing the intermediate power.
fn times_two_power(x: f64, power: i64) -> f64 {
    let mut value = x;
    let mut remaining = power.max(-4000).min(4000);
    while remaining != 0 {
        let step = remaining.max(-1000).min(1000);
        value *= 2f64.powi(step as i32);
        remaining -= step;
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VmConfig;
    use crate::objectmemory::builder::MemoryBuilder;
    use crate::objectmemory::{FALSE_PTR, TRUE_PTR};

    fn interpreter() -> Interpreter {
        let memory = MemoryBuilder::new(MemoryKind::V3).build();
        Interpreter::boot(memory, VmConfig::default()).unwrap()
    }

    fn run(interp: &mut Interpreter, index: usize, stack: &[OOP]) -> Option<OOP> {
        for &oop in stack {
            interp.push(oop);
        }
        interp.argument_count = stack.len() - 1;
        let sp = interp.sp;
        let result = interp.dispatch_prim(index);
        match result {
            Some(()) => Some(interp.pop()),
            None => {
                assert_eq!(interp.sp, sp, "failed primitive moved the stack");
                interp.popn(stack.len());
                None
            }
        }
    }

    #[test]
    fn small_integer_arithmetic() {
        let mut interp = interpreter();
        assert_eq!(run(&mut interp, 1, &[OOP::Int(3), OOP::Int(4)]), Some(OOP::Int(7)));
        assert_eq!(run(&mut interp, 11, &[OOP::Int(-7), OOP::Int(2)]), Some(OOP::Int(1)));
        assert_eq!(run(&mut interp, 12, &[OOP::Int(-7), OOP::Int(2)]), Some(OOP::Int(-4)));
        assert_eq!(run(&mut interp, 13, &[OOP::Int(-7), OOP::Int(2)]), Some(OOP::Int(-3)));
        assert_eq!(run(&mut interp, 10, &[OOP::Int(7), OOP::Int(2)]), None);
        assert_eq!(run(&mut interp, 10, &[OOP::Int(8), OOP::Int(0)]), None);
        assert_eq!(run(&mut interp, 3, &[OOP::Int(1), OOP::Int(2)]), Some(TRUE_PTR));
        assert_eq!(run(&mut interp, 8, &[OOP::Int(1), OOP::Int(1)]), Some(FALSE_PTR));
        assert_eq!(run(&mut interp, 17, &[OOP::Int(-8), OOP::Int(-2)]), Some(OOP::Int(-2)));
    }

    #[test]
    fn overflow_promotes_to_large_integer() {
        let mut interp = interpreter();
        let sum = run(&mut interp, 1, &[OOP::Int(0x3FFF_FFFF), OOP::Int(1)]).unwrap();
        assert_eq!(
            interp.memory.get_class_of(sum),
            interp.memory.special(CLASS_LARGE_POSITIVE_INTEGER)
        );
        assert_eq!(interp.memory.bytes(sum), &[0, 0, 0, 0x40]);
        assert_eq!(interp.integer_value_of(sum), Some(0x4000_0000));

        let difference = run(&mut interp, 2, &[OOP::Int(-0x4000_0000), OOP::Int(1)]).unwrap();
        assert_eq!(
            interp.memory.get_class_of(difference),
            interp.memory.special(CLASS_LARGE_NEGATIVE_INTEGER)
        );
        assert_eq!(interp.integer_value_of(difference), Some(-0x4000_0001));

        // and back down through the 64-bit primitives
        let back = run(&mut interp, 22, &[sum, OOP::Int(1)]).unwrap();
        assert_eq!(back, OOP::Int(0x3FFF_FFFF));
    }

    #[test]
    fn shifts_that_lose_bits_fail() {
        let mut interp = interpreter();
        let big = interp.integer_oop(1 << 62);
        assert_eq!(run(&mut interp, 37, &[big, OOP::Int(2)]), None);
        let shifted = run(&mut interp, 17, &[OOP::Int(1), OOP::Int(40)]).unwrap();
        assert_eq!(interp.integer_value_of(shifted), Some(1 << 40));
    }

    #[test]
    fn float_primitives() {
        let mut interp = interpreter();
        let half = interp.memory.new_float(0.5);
        let sum = run(&mut interp, 41, &[half, OOP::Int(2)]).unwrap();
        assert_eq!(interp.memory.float_value(sum), Some(2.5));
        assert_eq!(run(&mut interp, 50, &[half, OOP::Int(0)]), None);
        assert_eq!(interp.prim_fail_code, PRIM_ERR_BAD_ARGUMENT);
        let three = interp.memory.new_float(-3.75);
        assert_eq!(run(&mut interp, 51, &[three]), Some(OOP::Int(-3)));
        assert_eq!(run(&mut interp, 53, &[three]), Some(OOP::Int(1)));
        let scaled = run(&mut interp, 54, &[half, OOP::Int(3)]).unwrap();
        assert_eq!(interp.memory.float_value(scaled), Some(4.0));
        let word = run(&mut interp, 38, &[half, OOP::Int(1)]).unwrap();
        assert_eq!(interp.integer_value_of(word), Some(0x3FE0_0000));
    }

    #[test]
    fn exponent_of_subnormals() {
        assert_eq!(float_exponent(1.0), 0);
        assert_eq!(float_exponent(0.0), 0);
        assert_eq!(float_exponent(f64::from_bits(1)), -1074);
        assert_eq!(times_two_power(1.0, 2000), f64::INFINITY);
        assert_eq!(times_two_power(1.0, -1074), f64::from_bits(1));
    }
}
