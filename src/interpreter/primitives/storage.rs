//! Indexed access, instantiation, identity, enumeration and become:.

use super::*;
use crate::objectmemory::format::FMT_METHOD;
use crate::objectmemory::{BecomeError, MemoryKind, NIL_PTR};

/// Layout of the indexable part of an object.
#[derive(Copy, Clone, Debug, PartialEq)]
enum Indexable {
    Pointers { fixed: usize, size: usize },
    /// 64-bit elements, low word first.
    DoubleWords(usize),
    Words(usize),
    Shorts(usize),
    Bytes(usize),
    /// Bytecodes, indexed after the literal frame.
    Method { frame: usize, size: usize },
}

impl Indexable {
    fn size(self) -> usize {
        match self {
            Indexable::Pointers { size, .. } | Indexable::Method { size, .. } => size,
            Indexable::DoubleWords(size)
            | Indexable::Words(size)
            | Indexable::Shorts(size)
            | Indexable::Bytes(size) => size,
        }
    }
}

impl Interpreter {
    pub(super) fn dispatch_prim_storage(&mut self, index: usize) -> Option<()> {
        match index {
            60 => self.prim_at(),
            61 => self.prim_at_put(),
            62 => self.prim_size(),
            63 => self.prim_string_at(),
            64 => self.prim_string_at_put(),
            68 => self.prim_object_at(),
            69 => self.prim_object_at_put(),
            70 => self.prim_basic_new(),
            71 => self.prim_basic_new_size(),
            72 => self.prim_become(false, Some(true)),
            73 | 173 => self.prim_inst_var_at(),
            74 | 174 => self.prim_inst_var_at_put(),
            75 => self.prim_identity_hash(),
            76 => self.prim_store_stackp(),
            77 => self.prim_some_instance(),
            78 => self.prim_next_instance(),
            79 => self.prim_new_method(),
            105 => self.prim_replace_from_to(),
            115 => self.prim_change_class(),
            128 => self.prim_become(true, Some(true)),
            132 => self.prim_points_to(),
            138 => self.prim_some_object(),
            139 => self.prim_next_object(),
            143 => self.prim_short_at(),
            144 => self.prim_short_at_put(),
            145 => self.prim_constant_fill(),
            148 => self.prim_shallow_copy(),
            160 => self.prim_adopt_instance(),
            165 => self.prim_integer_at(),
            166 => self.prim_integer_at_put(),
            168 => self.prim_copy_object(),
            169 => {
                let arg = self.stack_value(0);
                let receiver = self.stack_value(1);
                self.pop_then_push(2, Self::bool_oop(receiver != arg));
                Some(())
            }
            170 => self.prim_as_character(),
            171 => self.prim_immediate_as_integer(),
            175 => self.prim_behavior_hash(),
            176 => {
                let max = self.memory.max_identity_hash();
                self.pop_then_push(1, OOP::Int(max as i32));
                Some(())
            }
            178 => self.prim_all_objects(),
            210 => self.prim_context_at(),
            211 => self.prim_context_at_put(),
            212 => self.prim_context_size(),
            249 => self.prim_become(false, None),
            _ => self.fail(PRIM_ERR_UNSUPPORTED),
        }
    }

    fn indexable(&self, oop: OOP) -> Option<Indexable> {
        let obj = self.memory.get_obj(oop)?;
        let format = obj.format();
        Some(match format {
            0..=5 => {
                let class = self.memory.get_class_of(oop);
                let fixed = self.memory.class_format(class)?.inst_size;
                let slots = self.memory.slot_count(oop);
                Indexable::Pointers {
                    fixed,
                    size: slots.saturating_sub(fixed),
                }
            }
            9 => Indexable::DoubleWords(self.memory.word_length(oop) / 2),
            10..=11 => Indexable::Words(self.memory.word_length(oop)),
            12..=15 => Indexable::Shorts(self.memory.byte_length(oop) / 2),
            16..=23 => Indexable::Bytes(self.memory.byte_length(oop)),
            _ => {
                let frame = self.memory.slot_count(oop) * 4;
                Indexable::Method {
                    frame,
                    size: frame + self.memory.byte_length(oop),
                }
            }
        })
    }

    /// One-based index argument checked against the indexable size.
    fn checked_index(&mut self, oop: OOP, layout: Indexable) -> Option<usize> {
        match oop.try_as_integer() {
            Some(index) if index >= 1 && index as usize <= layout.size() => Some(index as usize - 1),
            Some(_) => self.fail(PRIM_ERR_BAD_INDEX),
            None => self.fail(PRIM_ERR_BAD_ARGUMENT),
        }
    }

    fn indexed_read(&mut self, receiver: OOP, layout: Indexable, i: usize) -> Option<OOP> {
        Some(match layout {
            Indexable::Pointers { fixed, .. } => self.memory.get_ptr(receiver, fixed + i),
            Indexable::DoubleWords(_) => {
                let low = self.memory.get_word(receiver, i * 2)?;
                let high = self.memory.get_word(receiver, i * 2 + 1)?;
                self.positive_oop(u64::from(high) << 32 | u64::from(low))
            }
            Indexable::Words(_) => {
                let word = self.memory.get_word(receiver, i)?;
                self.positive_oop(word as u64)
            }
            Indexable::Shorts(_) => {
                let bytes = self.memory.bytes(receiver);
                OOP::Int(u16::from_le_bytes([bytes[i * 2], bytes[i * 2 + 1]]) as i32)
            }
            Indexable::Bytes(_) => OOP::Int(self.memory.get_byte(receiver, i)? as i32),
            Indexable::Method { frame, .. } => {
                if i < frame {
                    return self.fail(PRIM_ERR_BAD_INDEX);
                }
                OOP::Int(self.memory.get_byte(receiver, i - frame)? as i32)
            }
        })
    }

    fn indexed_write(&mut self, receiver: OOP, layout: Indexable, i: usize, value: OOP) -> Option<()> {
        match layout {
            Indexable::Pointers { fixed, .. } => self.memory.store_pointer(receiver, fixed + i, value),
            Indexable::DoubleWords(_) => {
                let value = match self.positive_value_of(value) {
                    Some(value) => value,
                    None => return self.fail(PRIM_ERR_BAD_ARGUMENT),
                };
                self.memory.put_word(receiver, i * 2, value as u32)?;
                self.memory.put_word(receiver, i * 2 + 1, (value >> 32) as u32)
            }
            Indexable::Words(_) => {
                let word = self.positive_value_of(value).filter(|&w| w <= u32::max_value() as u64);
                match word {
                    Some(word) => self.memory.put_word(receiver, i, word as u32),
                    None => self.fail(PRIM_ERR_BAD_ARGUMENT),
                }
            }
            Indexable::Shorts(_) => {
                let short = match value.try_as_integer() {
                    Some(v) if v >= 0 && v <= 0xFFFF => v as u16,
                    _ => return self.fail(PRIM_ERR_BAD_ARGUMENT),
                };
                let bytes = self.memory.bytes_mut(receiver)?;
                bytes[i * 2..i * 2 + 2].copy_from_slice(&short.to_le_bytes());
                Some(())
            }
            Indexable::Bytes(_) | Indexable::Method { .. } => {
                let offset = match layout {
                    Indexable::Method { frame, .. } if i < frame => {
                        return self.fail(PRIM_ERR_BAD_INDEX)
                    }
                    Indexable::Method { frame, .. } => i - frame,
                    _ => i,
                };
                let byte = match value.try_as_integer() {
                    Some(v) if v >= 0 && v <= 0xFF => v as u8,
                    _ => return self.fail(PRIM_ERR_BAD_ARGUMENT),
                };
                self.memory.put_byte(receiver, offset, byte)
            }
        }
    }

    fn prim_at(&mut self) -> Option<()> {
        let receiver = self.stack_value(1);
        if self.is_context(receiver) {
            return self.fail(PRIM_ERR_BAD_RECEIVER);
        }
        let layout = self.indexable(receiver)?;
        let i = self.checked_index(self.stack_value(0), layout)?;
        let value = self.indexed_read(receiver, layout, i)?;
        self.pop_then_push(2, value);
        Some(())
    }

    fn prim_at_put(&mut self) -> Option<()> {
        let receiver = self.stack_value(2);
        if self.is_context(receiver) {
            return self.fail(PRIM_ERR_BAD_RECEIVER);
        }
        let value = self.stack_value(0);
        let layout = self.indexable(receiver)?;
        let i = self.checked_index(self.stack_value(1), layout)?;
        self.indexed_write(receiver, layout, i, value)?;
        self.pop_then_push(3, value);
        Some(())
    }

    fn prim_size(&mut self) -> Option<()> {
        let receiver = self.stack_top();
        if self.is_context(receiver) {
            return self.fail(PRIM_ERR_BAD_RECEIVER);
        }
        let size = self.indexable(receiver).map_or(0, Indexable::size);
        self.pop_then_push(1, OOP::Int(size as i32));
        Some(())
    }

    fn prim_string_at(&mut self) -> Option<()> {
        let receiver = self.stack_value(1);
        let layout = self.indexable(receiver)?;
        let i = self.checked_index(self.stack_value(0), layout)?;
        let code = match layout {
            Indexable::Bytes(_) => self.memory.get_byte(receiver, i)? as u32,
            Indexable::Words(_) => self.memory.get_word(receiver, i)?,
            _ => return self.fail(PRIM_ERR_BAD_RECEIVER),
        };
        let character = self.char_oop(code)?;
        self.pop_then_push(2, character);
        Some(())
    }

    fn prim_string_at_put(&mut self) -> Option<()> {
        let receiver = self.stack_value(2);
        let character = self.stack_value(0);
        let code = match self.char_value(character) {
            Some(code) => code,
            None => return self.fail(PRIM_ERR_BAD_ARGUMENT),
        };
        let layout = self.indexable(receiver)?;
        let i = self.checked_index(self.stack_value(1), layout)?;
        match layout {
            Indexable::Bytes(_) if code <= 0xFF => self.memory.put_byte(receiver, i, code as u8)?,
            Indexable::Words(_) => self.memory.put_word(receiver, i, code)?,
            _ => return self.fail(PRIM_ERR_BAD_ARGUMENT),
        }
        self.pop_then_push(3, character);
        Some(())
    }

    /// CompiledMethod objectAt: (header and literals, one-based).
    fn prim_object_at(&mut self) -> Option<()> {
        let receiver = self.stack_value(1);
        let index = self.stack_value(0).try_as_integer()?;
        if !self.memory.is_method(receiver) {
            return self.fail(PRIM_ERR_BAD_RECEIVER);
        }
        if index < 1 || index as usize > self.memory.slot_count(receiver) {
            return self.fail(PRIM_ERR_BAD_INDEX);
        }
        let value = self.memory.get_ptr(receiver, index as usize - 1);
        self.pop_then_push(2, value);
        Some(())
    }

    fn prim_object_at_put(&mut self) -> Option<()> {
        let receiver = self.stack_value(2);
        let index = self.stack_value(1).try_as_integer()?;
        let value = self.stack_value(0);
        if !self.memory.is_method(receiver) {
            return self.fail(PRIM_ERR_BAD_RECEIVER);
        }
        if index < 1 || index as usize > self.memory.slot_count(receiver) {
            return self.fail(PRIM_ERR_BAD_INDEX);
        }
        self.memory.put_ptr(receiver, index as usize - 1, value);
        self.compiler.flush_method(receiver);
        self.pop_then_push(3, value);
        Some(())
    }

    fn prim_basic_new(&mut self) -> Option<()> {
        let class = self.stack_top();
        let format = self.memory.class_format(class)?;
        if format.inst_spec >= FMT_METHOD {
            return self.fail(PRIM_ERR_BAD_RECEIVER);
        }
        let instance = self.instantiate_or_gc(class, 0)?;
        self.pop_then_push(1, instance);
        Some(())
    }

    fn prim_basic_new_size(&mut self) -> Option<()> {
        let class = self.stack_value(1);
        let size = match self.stack_value(0).try_as_integer() {
            Some(size) if size >= 0 => size as usize,
            _ => return self.fail(PRIM_ERR_BAD_ARGUMENT),
        };
        let format = self.memory.class_format(class)?;
        if !format.is_indexable() || format.inst_spec >= FMT_METHOD {
            return self.fail(PRIM_ERR_BAD_RECEIVER);
        }
        let instance = self.instantiate_or_gc(class, size)?;
        self.pop_then_push(2, instance);
        Some(())
    }

    /// Elementwise become: between the receiver and argument arrays. `copy_hash` of `None`
    /// takes the flag from a third argument.
    fn prim_become(&mut self, two_way: bool, copy_hash: Option<bool>) -> Option<()> {
        let argc = self.argument_count;
        if argc == 0 {
            return self.fail(PRIM_ERR_BAD_NUM_ARGS);
        }
        let copy_hash = match copy_hash {
            Some(flag) => flag,
            None => {
                let flag = self.stack_value(0);
                if flag != Self::bool_oop(true) && flag != Self::bool_oop(false) {
                    return self.fail(PRIM_ERR_BAD_ARGUMENT);
                }
                flag == Self::bool_oop(true)
            }
        };
        let from_array = self.stack_value(argc);
        let to_array = self.stack_value(argc - 1);
        let array_class = self.memory.special(CLASS_ARRAY);
        if self.memory.get_class_of(from_array) != array_class
            || self.memory.get_class_of(to_array) != array_class
        {
            return self.fail(PRIM_ERR_BAD_ARGUMENT);
        }
        let from = self.memory.pointers(from_array).to_vec();
        let to = self.memory.pointers(to_array).to_vec();
        match self.become_objects(&from, &to, two_way, copy_hash) {
            Ok(()) => {
                self.popn(argc);
                Some(())
            }
            Err(BecomeError::SizeMismatch) => self.fail(PRIM_ERR_BAD_ARGUMENT),
            Err(BecomeError::NotObject) => self.fail(PRIM_ERR_INAPPROPRIATE),
            Err(BecomeError::Duplicate) => self.fail(PRIM_ERR_GENERIC),
        }
    }

    /// instVarAt: and slotAt:, over named and indexed slots alike.
    fn prim_inst_var_at(&mut self) -> Option<()> {
        let receiver = self.stack_value(1);
        let index = self.stack_value(0);
        let layout = self.slot_layout(receiver)?;
        let i = self.checked_index(index, layout)?;
        let value = self.indexed_read(receiver, layout, i)?;
        self.pop_then_push(2, value);
        Some(())
    }

    fn prim_inst_var_at_put(&mut self) -> Option<()> {
        let receiver = self.stack_value(2);
        let value = self.stack_value(0);
        let layout = self.slot_layout(receiver)?;
        let i = self.checked_index(self.stack_value(1), layout)?;
        self.indexed_write(receiver, layout, i, value)?;
        self.pop_then_push(3, value);
        Some(())
    }

    fn slot_layout(&mut self, receiver: OOP) -> Option<Indexable> {
        match self.indexable(receiver) {
            Some(Indexable::Pointers { .. }) => Some(Indexable::Pointers {
                fixed: 0,
                size: self.memory.slot_count(receiver),
            }),
            Some(Indexable::Method { .. }) => self.fail(PRIM_ERR_BAD_RECEIVER),
            Some(layout) => Some(layout),
            None => self.fail(PRIM_ERR_BAD_RECEIVER),
        }
    }

    fn prim_identity_hash(&mut self) -> Option<()> {
        let receiver = self.stack_top();
        if !receiver.is_object() {
            return self.fail(PRIM_ERR_BAD_RECEIVER);
        }
        let hash = self.memory.identity_hash(receiver);
        self.pop_then_push(1, OOP::Int(hash as i32));
        Some(())
    }

    fn prim_store_stackp(&mut self) -> Option<()> {
        let context = self.stack_value(1);
        let stackp = self.stack_value(0).try_as_integer()?;
        if context == self.active_context || !self.is_context(context) {
            return self.fail(PRIM_ERR_BAD_RECEIVER);
        }
        let limit = self.memory.slot_count(context) - CONTEXT_TEMP_FRAME_START;
        if stackp < 0 || stackp as usize > limit {
            return self.fail(PRIM_ERR_BAD_ARGUMENT);
        }
        let old = self
            .memory
            .get_ptr(context, CONTEXT_STACKP_INDEX)
            .try_as_integer()
            .unwrap_or(0)
            .max(0) as usize;
        for i in old..stackp as usize {
            self.memory
                .put_ptr(context, CONTEXT_TEMP_FRAME_START + i, NIL_PTR);
        }
        self.memory
            .put_ptr(context, CONTEXT_STACKP_INDEX, OOP::Int(stackp as i32));
        self.popn(1);
        Some(())
    }

    fn prim_some_instance(&mut self) -> Option<()> {
        let class = self.stack_top();
        let instance = self.memory.initial_instance_of(class).unwrap_or(NIL_PTR);
        self.pop_then_push(1, instance);
        Some(())
    }

    fn prim_next_instance(&mut self) -> Option<()> {
        let receiver = self.stack_top();
        let instance = self.memory.next_instance_of(receiver).unwrap_or(NIL_PTR);
        self.pop_then_push(1, instance);
        Some(())
    }

    /// CompiledMethod class newMethod: bytecodeCount header: headerWord
    fn prim_new_method(&mut self) -> Option<()> {
        let class = self.stack_value(2);
        let size = self.stack_value(1).try_as_integer()?;
        let header = self.stack_value(0).try_as_integer()?;
        if !self.is_behavior(class) {
            return self.fail(PRIM_ERR_BAD_RECEIVER);
        }
        if size < 0 {
            return self.fail(PRIM_ERR_BAD_ARGUMENT);
        }
        let literals = self.memory.kind().method_header(header, &[]).num_literals;
        let estimate = 16 + (literals + 1) * 4 + size as usize;
        if !self.memory.has_room_for(estimate) {
            self.collect_garbage(true);
            if !self.memory.has_room_for(estimate) {
                return self.fail(PRIM_ERR_NO_MEMORY);
            }
        }
        let mut pointers = vec![NIL_PTR; literals + 1];
        pointers[0] = OOP::Int(header as i32);
        let method = self
            .memory
            .new_method(class, pointers, vec![0; size as usize]);
        self.pop_then_push(3, method);
        Some(())
    }

    /// replaceFrom: start to: stop with: replacement startingAt: repStart
    fn prim_replace_from_to(&mut self) -> Option<()> {
        let receiver = self.stack_value(4);
        let start = self.stack_value(3).try_as_integer()?;
        let stop = self.stack_value(2).try_as_integer()?;
        let replacement = self.stack_value(1);
        let rep_start = self.stack_value(0).try_as_integer()?;
        let dst = self.indexable(receiver)?;
        let src = self.indexable(replacement)?;
        if stop < start - 1 || start < 1 || rep_start < 1 {
            return self.fail(PRIM_ERR_BAD_INDEX);
        }
        let count = (stop - start + 1) as usize;
        let (start, rep_start) = (start as usize - 1, rep_start as usize - 1);
        if start + count > dst.size() || rep_start + count > src.size() {
            return self.fail(PRIM_ERR_BAD_INDEX);
        }
        match (dst, src) {
            (Indexable::Pointers { fixed: d, .. }, Indexable::Pointers { fixed: s, .. }) => {
                let values = self.memory.pointers(replacement)[s + rep_start..s + rep_start + count].to_vec();
                let slots = self.memory.pointers_mut(receiver)?;
                slots[d + start..d + start + count].copy_from_slice(&values);
            }
            (Indexable::DoubleWords(_), Indexable::DoubleWords(_)) => {
                let values = self.memory.words(replacement)[rep_start * 2..(rep_start + count) * 2].to_vec();
                let words = self.memory.words_mut(receiver)?;
                words[start * 2..(start + count) * 2].copy_from_slice(&values);
            }
            (Indexable::Words(_), Indexable::Words(_)) => {
                let values = self.memory.words(replacement)[rep_start..rep_start + count].to_vec();
                let words = self.memory.words_mut(receiver)?;
                words[start..start + count].copy_from_slice(&values);
            }
            (Indexable::Bytes(_), Indexable::Bytes(_)) => {
                let values = self.memory.bytes(replacement)[rep_start..rep_start + count].to_vec();
                let bytes = self.memory.bytes_mut(receiver)?;
                bytes[start..start + count].copy_from_slice(&values);
            }
            (Indexable::Shorts(_), Indexable::Shorts(_)) => {
                let values = self.memory.bytes(replacement)[rep_start * 2..(rep_start + count) * 2].to_vec();
                let bytes = self.memory.bytes_mut(receiver)?;
                bytes[start * 2..(start + count) * 2].copy_from_slice(&values);
            }
            (Indexable::Method { frame, .. }, Indexable::Bytes(_)) if start >= frame => {
                let values = self.memory.bytes(replacement)[rep_start..rep_start + count].to_vec();
                let bytes = self.memory.bytes_mut(receiver)?;
                bytes[start - frame..start - frame + count].copy_from_slice(&values);
                self.compiler.flush_method(receiver);
            }
            _ => return self.fail(PRIM_ERR_INAPPROPRIATE),
        }
        self.popn(4);
        Some(())
    }

    /// Receiver takes the class of the argument.
    fn prim_change_class(&mut self) -> Option<()> {
        let receiver = self.stack_value(1);
        let class = self.memory.get_class_of(self.stack_value(0));
        if !receiver.is_object() {
            return self.fail(PRIM_ERR_BAD_RECEIVER);
        }
        if self.memory.change_class(receiver, class).is_none() {
            return self.fail(PRIM_ERR_BAD_ARGUMENT);
        }
        self.flush_method_cache();
        self.popn(1);
        Some(())
    }

    /// The receiver class adopts the argument as an instance.
    fn prim_adopt_instance(&mut self) -> Option<()> {
        let class = self.stack_value(1);
        let instance = self.stack_value(0);
        if !instance.is_object() {
            return self.fail(PRIM_ERR_BAD_ARGUMENT);
        }
        if self.memory.change_class(instance, class).is_none() {
            return self.fail(PRIM_ERR_BAD_RECEIVER);
        }
        self.flush_method_cache();
        self.popn(1);
        Some(())
    }

    fn prim_points_to(&mut self) -> Option<()> {
        let receiver = self.stack_value(1);
        let target = self.stack_value(0);
        let found = self.memory.pointers(receiver).contains(&target)
            || self.memory.get_class_of(receiver) == target;
        self.pop_then_push(2, Self::bool_oop(found));
        Some(())
    }

    fn prim_some_object(&mut self) -> Option<()> {
        let first = self.memory.first_object()?;
        self.pop_then_push(1, first);
        Some(())
    }

    fn prim_next_object(&mut self) -> Option<()> {
        let receiver = self.stack_top();
        let next = self.memory.next_object(receiver).unwrap_or(OOP::Int(0));
        self.pop_then_push(1, next);
        Some(())
    }

    /// Signed 16-bit access into the raw bytes of a non-pointer object.
    fn short_offset(&mut self, receiver: OOP, index: OOP) -> Option<usize> {
        let index = index.try_as_integer()?;
        let length = if self.memory.is_words(receiver) {
            self.memory.word_length(receiver) * 4
        } else if self.memory.is_bytes(receiver) {
            self.memory.byte_length(receiver)
        } else {
            return self.fail(PRIM_ERR_BAD_RECEIVER);
        };
        if index < 1 || index as usize * 2 > length {
            return self.fail(PRIM_ERR_BAD_INDEX);
        }
        Some((index as usize - 1) * 2)
    }

    fn prim_short_at(&mut self) -> Option<()> {
        let receiver = self.stack_value(1);
        let offset = self.short_offset(receiver, self.stack_value(0))?;
        let pair = if self.memory.is_words(receiver) {
            let word = self.memory.words(receiver)[offset / 4].to_le_bytes();
            [word[offset % 4], word[offset % 4 + 1]]
        } else {
            let bytes = self.memory.bytes(receiver);
            [bytes[offset], bytes[offset + 1]]
        };
        self.pop_then_push(2, OOP::Int(i16::from_le_bytes(pair) as i32));
        Some(())
    }

    fn prim_short_at_put(&mut self) -> Option<()> {
        let receiver = self.stack_value(2);
        let value = self.stack_value(0);
        let short = match value.try_as_integer() {
            Some(v) if v >= -0x8000 && v <= 0x7FFF => v as i16,
            _ => return self.fail(PRIM_ERR_BAD_ARGUMENT),
        };
        let offset = self.short_offset(receiver, self.stack_value(1))?;
        let pair = short.to_le_bytes();
        if self.memory.is_words(receiver) {
            let words = self.memory.words_mut(receiver)?;
            let mut word = words[offset / 4].to_le_bytes();
            word[offset % 4..offset % 4 + 2].copy_from_slice(&pair);
            words[offset / 4] = u32::from_le_bytes(word);
        } else {
            let bytes = self.memory.bytes_mut(receiver)?;
            bytes[offset..offset + 2].copy_from_slice(&pair);
        }
        self.pop_then_push(3, value);
        Some(())
    }

    fn prim_constant_fill(&mut self) -> Option<()> {
        let receiver = self.stack_value(1);
        let value = self.stack_value(0);
        match self.indexable(receiver) {
            Some(Indexable::Bytes(_)) => {
                let byte = match value.try_as_integer() {
                    Some(v) if v >= 0 && v <= 0xFF => v as u8,
                    _ => return self.fail(PRIM_ERR_BAD_ARGUMENT),
                };
                for b in self.memory.bytes_mut(receiver)?.iter_mut() {
                    *b = byte;
                }
            }
            Some(Indexable::Words(_)) => {
                let word = match self.positive_value_of(value) {
                    Some(w) if w <= u32::max_value() as u64 => w as u32,
                    _ => return self.fail(PRIM_ERR_BAD_ARGUMENT),
                };
                for w in self.memory.words_mut(receiver)?.iter_mut() {
                    *w = word;
                }
            }
            _ => return self.fail(PRIM_ERR_BAD_RECEIVER),
        }
        self.popn(1);
        Some(())
    }

    fn prim_shallow_copy(&mut self) -> Option<()> {
        let receiver = self.stack_top();
        if !receiver.is_object() {
            self.pop_then_push(1, receiver);
            return Some(());
        }
        let copy = match self.memory.clone_object(receiver) {
            Some(copy) => copy,
            None => {
                self.collect_garbage(true);
                match self.memory.clone_object(receiver) {
                    Some(copy) => copy,
                    None => return self.fail(PRIM_ERR_NO_MEMORY),
                }
            }
        };
        self.pop_then_push(1, copy);
        Some(())
    }

    fn prim_integer_at(&mut self) -> Option<()> {
        let receiver = self.stack_value(1);
        let index = self.stack_value(0).try_as_integer()?;
        if !self.memory.is_words(receiver) {
            return self.fail(PRIM_ERR_BAD_RECEIVER);
        }
        if index < 1 || index as usize > self.memory.word_length(receiver) {
            return self.fail(PRIM_ERR_BAD_INDEX);
        }
        let word = self.memory.get_word(receiver, index as usize - 1)?;
        let value = self.integer_oop(word as i32 as i64);
        self.pop_then_push(2, value);
        Some(())
    }

    fn prim_integer_at_put(&mut self) -> Option<()> {
        let receiver = self.stack_value(2);
        let index = self.stack_value(1).try_as_integer()?;
        let value = self.stack_value(0);
        let signed = match self.integer_value_of(value) {
            Some(v) if v >= i32::min_value() as i64 && v <= i32::max_value() as i64 => v as i32,
            _ => return self.fail(PRIM_ERR_BAD_ARGUMENT),
        };
        if !self.memory.is_words(receiver) {
            return self.fail(PRIM_ERR_BAD_RECEIVER);
        }
        if index < 1 || index as usize > self.memory.word_length(receiver) {
            return self.fail(PRIM_ERR_BAD_INDEX);
        }
        self.memory
            .put_word(receiver, index as usize - 1, signed as u32)?;
        self.pop_then_push(3, value);
        Some(())
    }

    /// Copy the slots of the argument into the receiver; same class and size only.
    fn prim_copy_object(&mut self) -> Option<()> {
        let receiver = self.stack_value(1);
        let source = self.stack_value(0);
        if !self.memory.is_pointers(receiver)
            || self.memory.get_class_of(receiver) != self.memory.get_class_of(source)
            || self.memory.slot_count(receiver) != self.memory.slot_count(source)
        {
            return self.fail(PRIM_ERR_BAD_ARGUMENT);
        }
        let values = self.memory.pointers(source).to_vec();
        self.memory
            .pointers_mut(receiver)?
            .copy_from_slice(&values);
        self.popn(1);
        Some(())
    }

    /// SmallInteger>>asCharacter and Character class>>value:
    fn prim_as_character(&mut self) -> Option<()> {
        let argc = self.argument_count;
        let code = match self.stack_top().try_as_integer() {
            Some(code) if code >= 0 && code <= 0x3FFF_FFFF => code as u32,
            _ => return self.fail(PRIM_ERR_BAD_ARGUMENT),
        };
        let character = match self.char_oop(code) {
            Some(character) => character,
            None => return self.fail(PRIM_ERR_BAD_ARGUMENT),
        };
        self.pop_then_push(argc + 1, character);
        Some(())
    }

    fn prim_immediate_as_integer(&mut self) -> Option<()> {
        let value = match self.stack_top() {
            OOP::Char(code) => code as i32,
            OOP::Int(value) => value,
            _ => return self.fail(PRIM_ERR_BAD_RECEIVER),
        };
        self.pop_then_push(1, OOP::Int(value));
        Some(())
    }

    fn prim_behavior_hash(&mut self) -> Option<()> {
        let class = self.stack_top();
        let id = class.as_oid()?;
        let hash = match self.memory.kind() {
            MemoryKind::Spur => self.memory.ensure_class_index(id),
            MemoryKind::V3 => self.memory.identity_hash(class),
        };
        self.pop_then_push(1, OOP::Int(hash as i32));
        Some(())
    }

    fn prim_all_objects(&mut self) -> Option<()> {
        let objects: Vec<OOP> = self.memory.object_ids().map(OOP::Object).collect();
        let array = self.memory.new_array(objects);
        self.pop_then_push(1, array);
        Some(())
    }

    /// Stack slots of a context, one-based up to its stack pointer.
    fn context_slot(&mut self, context: OOP, index: OOP) -> Option<usize> {
        if !self.is_context(context) {
            return self.fail(PRIM_ERR_BAD_RECEIVER);
        }
        self.save_ctx();
        let stackp = self
            .memory
            .get_ptr(context, CONTEXT_STACKP_INDEX)
            .try_as_integer()
            .unwrap_or(0);
        match index.try_as_integer() {
            Some(i) if i >= 1 && i <= stackp => Some(CONTEXT_TEMP_FRAME_START + i as usize - 1),
            _ => self.fail(PRIM_ERR_BAD_INDEX),
        }
    }

    fn prim_context_at(&mut self) -> Option<()> {
        let context = self.stack_value(1);
        let slot = self.context_slot(context, self.stack_value(0))?;
        let value = self.memory.get_ptr(context, slot);
        self.pop_then_push(2, value);
        Some(())
    }

    fn prim_context_at_put(&mut self) -> Option<()> {
        let context = self.stack_value(2);
        let value = self.stack_value(0);
        let slot = self.context_slot(context, self.stack_value(1))?;
        self.memory.put_ptr(context, slot, value);
        self.pop_then_push(3, value);
        Some(())
    }

    fn prim_context_size(&mut self) -> Option<()> {
        let context = self.stack_top();
        if !self.is_context(context) {
            return self.fail(PRIM_ERR_BAD_RECEIVER);
        }
        self.save_ctx();
        let stackp = self.memory.get_ptr(context, CONTEXT_STACKP_INDEX);
        let size = if stackp.is_integer() { stackp } else { OOP::Int(0) };
        self.pop_then_push(1, size);
        Some(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VmConfig;
    use crate::objectmemory::builder::MemoryBuilder;
    use crate::objectmemory::format::{FMT_SHORTS, FMT_WORDS64};

    fn interpreter(kind: MemoryKind) -> Interpreter {
        let memory = MemoryBuilder::new(kind).build();
        Interpreter::boot(memory, VmConfig::default()).unwrap()
    }

    fn run(interp: &mut Interpreter, index: usize, stack: &[OOP]) -> Option<OOP> {
        for &oop in stack {
            interp.push(oop);
        }
        interp.argument_count = stack.len() - 1;
        match interp.dispatch_prim(index) {
            Some(()) => Some(interp.pop()),
            None => {
                interp.popn(stack.len());
                None
            }
        }
    }

    #[test]
    fn at_put_on_arrays_and_strings() {
        let mut interp = interpreter(MemoryKind::V3);
        let array = interp.memory.new_array(vec![NIL_PTR; 3]);
        assert_eq!(run(&mut interp, 61, &[array, OOP::Int(2), OOP::Int(9)]), Some(OOP::Int(9)));
        assert_eq!(run(&mut interp, 60, &[array, OOP::Int(2)]), Some(OOP::Int(9)));
        assert_eq!(run(&mut interp, 60, &[array, OOP::Int(4)]), None);
        assert_eq!(interp.prim_fail_code, PRIM_ERR_BAD_INDEX);
        assert_eq!(run(&mut interp, 62, &[array]), Some(OOP::Int(3)));

        let string = interp.memory.new_string("abc");
        let b = run(&mut interp, 63, &[string, OOP::Int(2)]).unwrap();
        assert_eq!(interp.char_value(b), Some(u32::from(b'b')));
        let z = interp.char_oop(u32::from(b'z')).unwrap();
        run(&mut interp, 64, &[string, OOP::Int(1), z]).unwrap();
        assert_eq!(interp.memory.string_of(string), "zbc");
    }

    #[test]
    fn spur_characters_are_immediate() {
        let mut interp = interpreter(MemoryKind::Spur);
        let character = run(&mut interp, 170, &[OOP::Int(0x263A)]).unwrap();
        assert_eq!(character, OOP::Char(0x263A));
        assert_eq!(run(&mut interp, 171, &[character]), Some(OOP::Int(0x263A)));
    }

    #[test]
    fn shorts_and_signed_words() {
        let mut interp = interpreter(MemoryKind::V3);
        let class = interp.memory.special(CLASS_BITMAP);
        let words = interp.memory.new_words(class, vec![0xFFFF_FFFE, 0]);
        assert_eq!(run(&mut interp, 165, &[words, OOP::Int(1)]), Some(OOP::Int(-2)));
        assert_eq!(run(&mut interp, 143, &[words, OOP::Int(1)]), Some(OOP::Int(-2)));
        run(&mut interp, 144, &[words, OOP::Int(3), OOP::Int(-1)]).unwrap();
        assert_eq!(interp.memory.words(words)[1], 0x0000_FFFF);

        let bytes = interp.memory.new_bytes(class, vec![0; 4]);
        interp.memory.get_obj_mut(bytes).unwrap().format = FMT_SHORTS;
        run(&mut interp, 61, &[bytes, OOP::Int(2), OOP::Int(0x1234)]).unwrap();
        assert_eq!(interp.memory.bytes(bytes), &[0, 0, 0x34, 0x12]);
        assert_eq!(run(&mut interp, 62, &[bytes]), Some(OOP::Int(2)));
    }

    #[test]
    fn replace_handles_overlap() {
        let mut interp = interpreter(MemoryKind::V3);
        let values: Vec<OOP> = (1..=5).map(OOP::Int).collect();
        let array = interp.memory.new_array(values);
        run(
            &mut interp,
            105,
            &[array, OOP::Int(2), OOP::Int(5), array, OOP::Int(1)],
        )
        .unwrap();
        let expected: Vec<OOP> = [1, 1, 2, 3, 4].iter().map(|&v| OOP::Int(v)).collect();
        assert_eq!(interp.memory.pointers(array), &expected[..]);
    }

    #[test]
    fn method_bytes_are_indexed_after_the_literal_frame() {
        let mut interp = interpreter(MemoryKind::V3);
        let header = interp.memory.kind().encode_method_header(&crate::objectmemory::MethodHeader {
            num_literals: 1,
            ..Default::default()
        });
        let class = interp.memory.special(CLASS_COMPILED_METHOD);
        let method = run(&mut interp, 79, &[class, OOP::Int(3), OOP::Int(header as i32)]).unwrap();
        assert_eq!(interp.memory.slot_count(method), 2);
        assert_eq!(run(&mut interp, 62, &[method]), Some(OOP::Int(11)));
        assert_eq!(run(&mut interp, 60, &[method, OOP::Int(8)]), None);
        run(&mut interp, 61, &[method, OOP::Int(9), OOP::Int(0x7C)]).unwrap();
        assert_eq!(interp.memory.bytes(method), &[0x7C, 0, 0]);
    }

    #[test]
    fn new_method_respects_the_memory_limit() {
        let mut interp = interpreter(MemoryKind::V3);
        let header = interp.memory.kind().encode_method_header(&crate::objectmemory::MethodHeader {
            num_literals: 2,
            ..Default::default()
        });
        let class = interp.memory.special(CLASS_COMPILED_METHOD);
        interp.memory.memory_limit = interp.memory.bytes_in_use() + 64 * 1024;
        let count = interp.memory.object_count();
        let huge = OOP::Int(50_000_000);
        assert_eq!(run(&mut interp, 79, &[class, huge, OOP::Int(header as i32)]), None);
        assert_eq!(interp.prim_fail_code, PRIM_ERR_NO_MEMORY);
        assert!(interp.memory.object_count() <= count);

        let array = interp.memory.new_array(vec![]);
        assert_eq!(run(&mut interp, 79, &[array, OOP::Int(4), OOP::Int(header as i32)]), None);
        assert_eq!(interp.prim_fail_code, PRIM_ERR_BAD_RECEIVER);

        let method = run(&mut interp, 79, &[class, OOP::Int(4), OOP::Int(header as i32)]).unwrap();
        assert_eq!(interp.memory.slot_count(method), 3);
    }

    #[test]
    fn sixty_four_bit_elements_span_two_words() {
        let mut interp = interpreter(MemoryKind::Spur);
        let class = interp.memory.special(CLASS_BITMAP);
        let longs = interp.memory.new_words(class, vec![5, 0, 0, 1]);
        interp.memory.get_obj_mut(longs).unwrap().format = FMT_WORDS64;
        assert_eq!(run(&mut interp, 62, &[longs]), Some(OOP::Int(2)));
        assert_eq!(run(&mut interp, 60, &[longs, OOP::Int(1)]), Some(OOP::Int(5)));
        let big = run(&mut interp, 60, &[longs, OOP::Int(2)]).unwrap();
        assert_eq!(interp.positive_value_of(big), Some(1 << 32));
        assert_eq!(run(&mut interp, 60, &[longs, OOP::Int(3)]), None);

        run(&mut interp, 61, &[longs, OOP::Int(1), big]).unwrap();
        assert_eq!(interp.memory.words(longs), &[0, 1, 0, 1]);
        assert_eq!(run(&mut interp, 61, &[longs, OOP::Int(2), OOP::Int(-1)]), None);
        assert_eq!(interp.prim_fail_code, PRIM_ERR_BAD_ARGUMENT);
    }

    #[test]
    fn change_class_checks_layout() {
        let mut interp = interpreter(MemoryKind::V3);
        let array = interp.memory.new_array(vec![NIL_PTR; 2]);
        let string = interp.memory.new_string("xy");
        let symbol_class = interp.memory.get_class_of(interp.memory.special(SELECTOR_MUST_BE_BOOLEAN));
        let symbol = interp.memory.special(SELECTOR_MUST_BE_BOOLEAN);
        assert_eq!(run(&mut interp, 115, &[array, string]), None);
        assert_eq!(run(&mut interp, 115, &[string, symbol]), Some(string));
        assert_eq!(interp.memory.get_class_of(string), symbol_class);
    }

    #[test]
    fn become_through_the_primitive() {
        let mut interp = interpreter(MemoryKind::V3);
        let a = interp.memory.new_string("a");
        let b = interp.memory.new_string("b");
        let holder = interp.memory.new_array(vec![a, b]);
        let from = interp.memory.new_array(vec![a]);
        let to = interp.memory.new_array(vec![b]);
        assert_eq!(run(&mut interp, 128, &[from, to]), Some(from));
        assert_eq!(interp.memory.pointers(holder), &[b, a]);
        let short = interp.memory.new_array(vec![]);
        assert_eq!(run(&mut interp, 72, &[from, short]), None);
        assert_eq!(interp.prim_fail_code, PRIM_ERR_BAD_ARGUMENT);
    }

    #[test]
    fn enumeration_ends_with_zero() {
        let mut interp = interpreter(MemoryKind::V3);
        let mut oop = run(&mut interp, 138, &[NIL_PTR]).unwrap();
        let mut count = 1;
        while let Some(next) = run(&mut interp, 139, &[oop]) {
            if next == OOP::Int(0) {
                break;
            }
            oop = next;
            count += 1;
        }
        assert_eq!(count, interp.memory.object_count());
    }
}
