//! Arbitrary-precision integer support. LargeIntegers are byte objects holding the magnitude
//! little-endian; the class carries the sign.

use std::cmp::Ordering;

use super::{InterpreterProxy, NamedPrimitive, PluginModule};
use crate::interpreter::primitives::{PRIM_ERR_BAD_ARGUMENT, PRIM_ERR_BAD_RECEIVER};
use crate::objectmemory::{FALSE_PTR, OOP, SMALLINT_MAX, SMALLINT_MIN, TRUE_PTR};

pub struct LargeIntegers;

impl PluginModule for LargeIntegers {
    fn name(&self) -> &str {
        "LargeIntegers"
    }

    fn primitive(&self, name: &str) -> Option<NamedPrimitive> {
        let primitive: NamedPrimitive = match name {
            "primDigitAdd" => prim_digit_add,
            "primDigitSubtract" => prim_digit_subtract,
            "primDigitMultiplyNegative" => prim_digit_multiply,
            "primDigitDivNegative" => prim_digit_div,
            "primDigitCompare" => prim_digit_compare,
            "primDigitBitAnd" => prim_digit_bit_and,
            "primDigitBitOr" => prim_digit_bit_or,
            "primDigitBitXor" => prim_digit_bit_xor,
            "primDigitBitShiftMagnitude" => prim_digit_shift,
            "primNormalizePositive" | "primNormalizeNegative" => prim_normalize,
            _ => return None,
        };
        Some(primitive)
    }
}

type Magnitude = Vec<u8>;

fn trimmed(mut digits: Magnitude) -> Magnitude {
    while digits.last() == Some(&0) {
        digits.pop();
    }
    digits
}

fn compare(a: &[u8], b: &[u8]) -> Ordering {
    let (a, b) = (trim_slice(a), trim_slice(b));
    a.len()
        .cmp(&b.len())
        .then_with(|| a.iter().rev().cmp(b.iter().rev()))
}

fn trim_slice(digits: &[u8]) -> &[u8] {
    let len = digits.iter().rposition(|&d| d != 0).map_or(0, |i| i + 1);
    &digits[..len]
}

fn add(a: &[u8], b: &[u8]) -> Magnitude {
    let len = a.len().max(b.len());
    let mut sum = Vec::with_capacity(len + 1);
    let mut carry = 0u16;
    for i in 0..len {
        let digit = *a.get(i).unwrap_or(&0) as u16 + *b.get(i).unwrap_or(&0) as u16 + carry;
        sum.push(digit as u8);
        carry = digit >> 8;
    }
    sum.push(carry as u8);
    trimmed(sum)
}

/// `a - b` for `a >= b`.
fn subtract(a: &[u8], b: &[u8]) -> Magnitude {
    let mut difference = Vec::with_capacity(a.len());
    let mut borrow = 0i16;
    for (i, &digit) in a.iter().enumerate() {
        let mut value = digit as i16 - *b.get(i).unwrap_or(&0) as i16 - borrow;
        borrow = (value < 0) as i16;
        if value < 0 {
            value += 256;
        }
        difference.push(value as u8);
    }
    trimmed(difference)
}

fn multiply(a: &[u8], b: &[u8]) -> Magnitude {
    let mut product = vec![0u32; a.len() + b.len() + 1];
    for (i, &x) in a.iter().enumerate() {
        let mut carry = 0u32;
        for (j, &y) in b.iter().enumerate() {
            let value = product[i + j] + x as u32 * y as u32 + carry;
            product[i + j] = value & 0xFF;
            carry = value >> 8;
        }
        let mut k = i + b.len();
        while carry > 0 {
            let value = product[k] + carry;
            product[k] = value & 0xFF;
            carry = value >> 8;
            k += 1;
        }
    }
    trimmed(product.into_iter().map(|d| d as u8).collect())
}

fn shift_left(digits: &[u8], bits: usize) -> Magnitude {
    let (bytes, bits) = (bits / 8, bits % 8);
    let mut shifted = vec![0u8; bytes];
    let mut carry = 0u8;
    for &digit in digits {
        let wide = ((digit as u16) << bits) | carry as u16;
        shifted.push(wide as u8);
        carry = (wide >> 8) as u8;
    }
    shifted.push(carry);
    trimmed(shifted)
}

fn shift_right(digits: &[u8], bits: usize) -> Magnitude {
    let (bytes, bits) = (bits / 8, bits % 8);
    if bytes >= digits.len() {
        return Vec::new();
    }
    let source = &digits[bytes..];
    let shifted = (0..source.len())
        .map(|i| {
            let high = *source.get(i + 1).unwrap_or(&0) as u16;
            (((high << 8) | source[i] as u16) >> bits) as u8
        })
        .collect();
    trimmed(shifted)
}

/// Schoolbook division one bit at a time. `divisor` must be non-zero.
fn divide(dividend: &[u8], divisor: &[u8]) -> (Magnitude, Magnitude) {
    let mut quotient = vec![0u8; dividend.len()];
    let mut remainder: Magnitude = Vec::new();
    for bit in (0..dividend.len() * 8).rev() {
        remainder = shift_left(&remainder, 1);
        if dividend[bit / 8] & (1 << (bit % 8)) != 0 {
            if remainder.is_empty() {
                remainder.push(1);
            } else {
                remainder[0] |= 1;
            }
        }
        if compare(&remainder, divisor) != Ordering::Less {
            remainder = subtract(&remainder, divisor);
            quotient[bit / 8] |= 1 << (bit % 8);
        }
    }
    (trimmed(quotient), remainder)
}

/// Magnitude and sign of a SmallInteger or LargeInteger.
fn magnitude_of(proxy: &InterpreterProxy, oop: OOP) -> Option<(Magnitude, bool)> {
    if let OOP::Int(value) = oop {
        let magnitude = (value as i64).abs() as u64;
        return Some((trimmed(magnitude.to_le_bytes().to_vec()), value < 0));
    }
    let class = proxy.fetch_class_of(oop);
    let negative = if class == proxy.class_large_negative_integer() {
        true
    } else if class == proxy.class_large_positive_integer() {
        false
    } else {
        return None;
    };
    Some((proxy.bytes(oop).to_vec(), negative))
}

fn operand(proxy: &mut InterpreterProxy, offset: usize, code: u32) -> Option<(Magnitude, bool)> {
    let oop = proxy.stack_value(offset);
    match magnitude_of(proxy, oop) {
        Some(operand) => Some(operand),
        None => proxy.primitive_fail_for(code),
    }
}

/// The integer with this magnitude and sign: a SmallInteger when it fits.
fn integer_from(proxy: &mut InterpreterProxy, digits: Magnitude, negative: bool) -> Option<OOP> {
    let digits = trimmed(digits);
    if digits.len() <= 4 {
        let mut word = [0u8; 8];
        word[..digits.len()].copy_from_slice(&digits);
        let value = u64::from_le_bytes(word) as i64;
        let value = if negative { -value } else { value };
        if value >= SMALLINT_MIN && value <= SMALLINT_MAX {
            return Some(OOP::Int(value as i32));
        }
    }
    let class = if negative {
        proxy.class_large_negative_integer()
    } else {
        proxy.class_large_positive_integer()
    };
    let large = proxy.instantiate_class(class, digits.len())?;
    proxy.bytes_mut(large)?.copy_from_slice(&digits);
    Some(large)
}

fn answer(proxy: &mut InterpreterProxy, digits: Magnitude, negative: bool) -> Option<()> {
    let result = integer_from(proxy, digits, negative)?;
    let argc = proxy.method_argument_count();
    proxy.pop_then_push(argc + 1, result);
    Some(())
}

fn negative_flag(proxy: &mut InterpreterProxy, offset: usize) -> Option<bool> {
    let flag = proxy.stack_value(offset);
    if flag == TRUE_PTR {
        Some(true)
    } else if flag == FALSE_PTR {
        Some(false)
    } else {
        proxy.primitive_fail_for(PRIM_ERR_BAD_ARGUMENT)
    }
}

/// Sum of magnitudes, signed like the receiver.
fn prim_digit_add(proxy: &mut InterpreterProxy) -> Option<()> {
    let (receiver, negative) = operand(proxy, 1, PRIM_ERR_BAD_RECEIVER)?;
    let (arg, _) = operand(proxy, 0, PRIM_ERR_BAD_ARGUMENT)?;
    answer(proxy, add(&receiver, &arg), negative)
}

/// Difference of magnitudes; the sign flips when the argument is the larger.
fn prim_digit_subtract(proxy: &mut InterpreterProxy) -> Option<()> {
    let (receiver, negative) = operand(proxy, 1, PRIM_ERR_BAD_RECEIVER)?;
    let (arg, _) = operand(proxy, 0, PRIM_ERR_BAD_ARGUMENT)?;
    if compare(&receiver, &arg) == Ordering::Less {
        answer(proxy, subtract(&arg, &receiver), !negative)
    } else {
        answer(proxy, subtract(&receiver, &arg), negative)
    }
}

fn prim_digit_multiply(proxy: &mut InterpreterProxy) -> Option<()> {
    let (receiver, _) = operand(proxy, 2, PRIM_ERR_BAD_RECEIVER)?;
    let (arg, _) = operand(proxy, 1, PRIM_ERR_BAD_ARGUMENT)?;
    let negative = negative_flag(proxy, 0)?;
    answer(proxy, multiply(&receiver, &arg), negative)
}

/// Answers `{quotient. remainder}`; the quotient takes the given sign, the remainder the
/// receiver's.
fn prim_digit_div(proxy: &mut InterpreterProxy) -> Option<()> {
    let (receiver, receiver_negative) = operand(proxy, 2, PRIM_ERR_BAD_RECEIVER)?;
    let (arg, _) = operand(proxy, 1, PRIM_ERR_BAD_ARGUMENT)?;
    let negative = negative_flag(proxy, 0)?;
    if trim_slice(&arg).is_empty() {
        return proxy.primitive_fail_for(PRIM_ERR_BAD_ARGUMENT);
    }
    let (quotient, remainder) = divide(&receiver, &arg);
    let quotient = integer_from(proxy, quotient, negative)?;
    proxy.push_remappable_oop(quotient);
    let remainder = integer_from(proxy, remainder, receiver_negative);
    let quotient = proxy.pop_remappable_oop();
    let remainder = remainder?;

    proxy.push_remappable_oop(quotient);
    proxy.push_remappable_oop(remainder);
    let class = proxy.class_array();
    let array = proxy.instantiate_class(class, 2);
    let remainder = proxy.pop_remappable_oop();
    let quotient = proxy.pop_remappable_oop();
    let array = array?;
    proxy.store_pointer(array, 0, quotient)?;
    proxy.store_pointer(array, 1, remainder)?;
    proxy.pop_then_push(3, array);
    Some(())
}

/// -1, 0 or 1 comparing magnitudes only.
fn prim_digit_compare(proxy: &mut InterpreterProxy) -> Option<()> {
    let (receiver, _) = operand(proxy, 1, PRIM_ERR_BAD_RECEIVER)?;
    let (arg, _) = operand(proxy, 0, PRIM_ERR_BAD_ARGUMENT)?;
    let order = match compare(&receiver, &arg) {
        Ordering::Less => -1,
        Ordering::Equal => 0,
        Ordering::Greater => 1,
    };
    proxy.pop_then_push(2, OOP::Int(order));
    Some(())
}

/// Bitwise logic, defined for non-negative operands only.
fn prim_digit_bit_op(proxy: &mut InterpreterProxy, op: fn(u8, u8) -> u8) -> Option<()> {
    let (receiver, receiver_negative) = operand(proxy, 1, PRIM_ERR_BAD_RECEIVER)?;
    let (arg, arg_negative) = operand(proxy, 0, PRIM_ERR_BAD_ARGUMENT)?;
    if receiver_negative || arg_negative {
        return proxy.primitive_fail_for(PRIM_ERR_BAD_ARGUMENT);
    }
    let len = receiver.len().max(arg.len());
    let result = (0..len)
        .map(|i| op(*receiver.get(i).unwrap_or(&0), *arg.get(i).unwrap_or(&0)))
        .collect();
    answer(proxy, result, false)
}

fn prim_digit_bit_and(proxy: &mut InterpreterProxy) -> Option<()> {
    prim_digit_bit_op(proxy, |a, b| a & b)
}

fn prim_digit_bit_or(proxy: &mut InterpreterProxy) -> Option<()> {
    prim_digit_bit_op(proxy, |a, b| a | b)
}

fn prim_digit_bit_xor(proxy: &mut InterpreterProxy) -> Option<()> {
    prim_digit_bit_op(proxy, |a, b| a ^ b)
}

/// Shift the magnitude left by a positive count or right by a negative one, keeping the sign.
fn prim_digit_shift(proxy: &mut InterpreterProxy) -> Option<()> {
    let (receiver, negative) = operand(proxy, 1, PRIM_ERR_BAD_RECEIVER)?;
    let shift = proxy.stack_integer_value(0)?;
    let result = if shift >= 0 {
        shift_left(&receiver, shift as usize)
    } else {
        shift_right(&receiver, shift.unsigned_abs() as usize)
    };
    answer(proxy, result, negative)
}

fn prim_normalize(proxy: &mut InterpreterProxy) -> Option<()> {
    let receiver = proxy.stack_value(0);
    let (digits, negative) = operand(proxy, 0, PRIM_ERR_BAD_RECEIVER)?;
    if receiver.is_integer() {
        return Some(());
    }
    let length = proxy.bytes(receiver).len();
    let trimmed_digits = trimmed(digits);
    if trimmed_digits.len() == length && length > 4 {
        // already minimal and too wide for a SmallInteger
        return Some(());
    }
    answer(proxy, trimmed_digits, negative)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VmConfig;
    use crate::interpreter::Interpreter;
    use crate::objectmemory::builder::MemoryBuilder;
    use crate::objectmemory::specials::*;
    use crate::objectmemory::{MemoryKind, NIL_PTR};

    #[test]
    fn magnitude_arithmetic() {
        assert_eq!(add(&[0xFF, 0xFF], &[0x01]), vec![0, 0, 1]);
        assert_eq!(subtract(&[0, 0, 1], &[1]), vec![0xFF, 0xFF]);
        assert_eq!(multiply(&[0xFF], &[0xFF]), vec![0x01, 0xFE]);
        assert_eq!(shift_left(&[0x81], 9), vec![0, 0x02, 0x01]);
        assert_eq!(shift_right(&[0, 0x02, 0x01], 9), vec![0x81]);
        assert_eq!(compare(&[1, 0, 0], &[1]), Ordering::Equal);
        // 1_000_000 = 0x0F4240, divided by 7
        let (q, r) = divide(&[0x40, 0x42, 0x0F], &[7]);
        assert_eq!(q, (142_857u32).to_le_bytes()[..3].to_vec());
        assert_eq!(r, vec![1]);
    }

    fn interpreter() -> Interpreter {
        let memory = MemoryBuilder::new(MemoryKind::V3).build();
        Interpreter::boot(memory, VmConfig::default()).unwrap()
    }

    fn large(interp: &mut Interpreter, digits: &[u8], negative: bool) -> OOP {
        let index = if negative {
            CLASS_LARGE_NEGATIVE_INTEGER
        } else {
            CLASS_LARGE_POSITIVE_INTEGER
        };
        let class = interp.memory.special(index);
        interp.memory.new_bytes(class, digits.to_vec())
    }

    fn call(interp: &mut Interpreter, name: &str, stack: &[OOP]) -> Option<OOP> {
        for &oop in stack {
            interp.push(oop);
        }
        interp.argument_count = stack.len() - 1;
        let primitive = LargeIntegers.primitive(name)?;
        let mut proxy = InterpreterProxy::new(interp);
        let result = primitive(&mut proxy);
        let failed = proxy.failed();
        match result {
            Some(()) if !failed => Some(interp.pop()),
            _ => {
                interp.popn(stack.len());
                None
            }
        }
    }

    #[test]
    fn add_carries_into_a_new_digit() {
        let mut interp = interpreter();
        let a = large(&mut interp, &[0xFF, 0xFF, 0xFF, 0xFF], false);
        let sum = call(&mut interp, "primDigitAdd", &[a, OOP::Int(1)]).unwrap();
        assert_eq!(interp.memory.bytes(sum), &[0, 0, 0, 0, 1]);
    }

    #[test]
    fn subtract_normalizes_to_small_integer() {
        let mut interp = interpreter();
        let a = large(&mut interp, &[0, 0, 0, 0x40], false);
        let b = large(&mut interp, &[1, 0, 0, 0x40], false);
        assert_eq!(call(&mut interp, "primDigitSubtract", &[a, b]), Some(OOP::Int(-1)));
    }

    #[test]
    fn division_answers_quotient_and_remainder() {
        let mut interp = interpreter();
        // 2^40 + 5
        let a = large(&mut interp, &[5, 0, 0, 0, 0, 1], true);
        let result = call(
            &mut interp,
            "primDigitDivNegative",
            &[a, OOP::Int(1 << 20), TRUE_PTR],
        )
        .unwrap();
        assert_eq!(interp.memory.get_ptr(result, 0), OOP::Int(-(1 << 20)));
        assert_eq!(interp.memory.get_ptr(result, 1), OOP::Int(-5));
        assert!(call(&mut interp, "primDigitDivNegative", &[a, OOP::Int(0), FALSE_PTR]).is_none());
    }

    #[test]
    fn bit_logic_rejects_negative_operands() {
        let mut interp = interpreter();
        assert_eq!(
            call(&mut interp, "primDigitBitAnd", &[OOP::Int(12), OOP::Int(10)]),
            Some(OOP::Int(8))
        );
        assert!(call(&mut interp, "primDigitBitOr", &[OOP::Int(-1), OOP::Int(10)]).is_none());
    }

    #[test]
    fn normalize_strips_leading_zero_digits() {
        let mut interp = interpreter();
        let padded = large(&mut interp, &[7, 0, 0, 0, 0, 0], false);
        assert_eq!(call(&mut interp, "primNormalizePositive", &[padded]), Some(OOP::Int(7)));
        assert!(call(&mut interp, "primDigitAdd", &[NIL_PTR, OOP::Int(1)]).is_none());
    }
}
