//! Mark-sweep collection over the object arena.
//!
//! Ids never move, so a collection only has to decide which objects die. A full collection
//! marks from the roots through the whole heap and tenures every young survivor; a partial one
//! traces young objects only, starting from the roots and from dirty (remembered) old objects.
//! Weak slots are not traced and get nilled when their referent dies.

use failure::Fail;
use log::{debug, warn};
use std::collections::{BTreeSet, HashMap};
use std::mem;
use std::time::{Duration, Instant};

use super::format::*;
use super::{specials, ObjectId, ObjectMemory, NIL_PTR, OOP};

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum GcRequest {
    None,
    Partial,
    Full,
}

impl Default for GcRequest {
    fn default() -> Self {
        GcRequest::None
    }
}

#[derive(Clone, Debug, Default)]
pub struct GcStats {
    pub full_gcs: u64,
    pub partial_gcs: u64,
    pub full_gc_time: Duration,
    pub partial_gc_time: Duration,
    pub tenured: u64,
    pub freed: u64,
}

/// Outcome of one collection.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GcReport {
    pub freed: usize,
    pub tenured: usize,
    pub survivors: usize,
    /// Some weak slot was nilled; the finalization semaphore is due.
    pub weak_cleared: bool,
}

#[derive(Debug, Fail, PartialEq)]
pub enum BecomeError {
    #[fail(display = "become: arrays differ in size")]
    SizeMismatch,
    #[fail(display = "become: of an immediate")]
    NotObject,
    #[fail(display = "object appears twice in become: arrays")]
    Duplicate,
}

impl ObjectMemory {
    fn is_marked(&self, id: ObjectId) -> bool {
        self.object(id).map_or(false, |obj| obj.mark)
    }

    /// Number of leading slots that hold references the collector must follow.
    fn traced_slots(&self, id: ObjectId) -> (usize, bool) {
        let obj = match self.object(id) {
            Some(obj) => obj,
            None => return (0, false),
        };
        let len = obj.pointers().len();
        if obj.format == FMT_WEAK {
            let fixed = self
                .class_format(OOP::Object(obj.class))
                .map_or(0, |fmt| fmt.inst_size);
            return (fixed.min(len), true);
        }
        let class = OOP::Object(obj.class);
        if class == self.special(specials::CLASS_METHOD_CONTEXT)
            || class == self.special(specials::CLASS_BLOCK_CONTEXT)
        {
            if let Some(OOP::Int(sp)) = obj.pointers().get(specials::CONTEXT_STACKP_INDEX) {
                let live = specials::CONTEXT_TEMP_FRAME_START + (*sp).max(0) as usize;
                return (live.min(len), false);
            }
        }
        (len, false)
    }

    /// Mark everything reachable from `roots`. With `young_only`, old objects are neither
    /// marked nor traced through.
    fn mark_from(&mut self, roots: Vec<ObjectId>, young_only: bool, weak: &mut Vec<ObjectId>) {
        let mut stack = roots;
        while let Some(id) = stack.pop() {
            match self.object(id) {
                Some(obj) if !obj.mark && (!young_only || obj.is_young()) => {}
                _ => continue,
            }
            let (limit, is_weak) = self.traced_slots(id);
            if is_weak {
                weak.push(id);
            }
            let obj = match self.object_mut(id) {
                Some(obj) => obj,
                None => continue,
            };
            obj.mark = true;
            stack.push(obj.class);
            let slots = obj.pointers_mut();
            // Stale stack slots above the context's stack pointer are dropped.
            if !is_weak && limit < slots.len() {
                for slot in &mut slots[limit..] {
                    *slot = NIL_PTR;
                }
            }
            stack.extend(slots[..limit].iter().filter_map(|slot| slot.as_oid()));
        }
    }

    /// Nil the weak slots whose referents were not marked.
    fn clear_weak_slots(&mut self, weak: &[ObjectId], young_only: bool) -> bool {
        let mut cleared = false;
        for &id in weak {
            let fixed = match self.object(id) {
                Some(obj) => self
                    .class_format(OOP::Object(obj.class))
                    .map_or(0, |fmt| fmt.inst_size),
                None => continue,
            };
            let dead: Vec<usize> = self
                .pointers(OOP::Object(id))
                .iter()
                .enumerate()
                .skip(fixed)
                .filter(|(_, slot)| match slot.as_oid() {
                    Some(referent) => match self.object(referent) {
                        Some(obj) => !obj.mark && (!young_only || obj.is_young()),
                        None => true,
                    },
                    None => false,
                })
                .map(|(i, _)| i)
                .collect();
            if dead.is_empty() {
                continue;
            }
            cleared = true;
            if let Some(obj) = self.object_mut(id) {
                let slots = obj.pointers_mut();
                for i in dead {
                    slots[i] = NIL_PTR;
                }
            }
        }
        cleared
    }

    fn root_ids(&self, roots: &[OOP]) -> Vec<ObjectId> {
        let mut ids: Vec<ObjectId> = roots.iter().filter_map(|oop| oop.as_oid()).collect();
        ids.push(self.special_objects().as_oid().unwrap_or(ObjectId::new(0)));
        ids.extend(
            [NIL_PTR, super::FALSE_PTR, super::TRUE_PTR]
                .iter()
                .filter_map(|oop| oop.as_oid()),
        );
        // Immediates get their classes from the specials; keep the Spur class table honest.
        if self.kind == MemoryKind::Spur {
            ids.extend(
                self.class_table
                    .iter()
                    .filter(|(&index, _)| index < RESERVED_CLASS_INDICES)
                    .map(|(_, &id)| id),
            );
        }
        ids
    }

    /// Mark, sweep, and tenure every survivor.
    pub fn full_gc(&mut self, roots: &[OOP]) -> GcReport {
        let start = Instant::now();
        let mut weak = Vec::new();
        let root_ids = self.root_ids(roots);
        self.mark_from(root_ids, false, &mut weak);
        let weak_cleared = self.clear_weak_slots(&weak, false);

        let mut report = GcReport {
            weak_cleared,
            ..GcReport::default()
        };
        let old_space = mem::replace(&mut self.old_space, Vec::new());
        let young_space = mem::replace(&mut self.young_space, Vec::new());
        let mut survivors = Vec::with_capacity(old_space.len() + young_space.len());
        for id in old_space {
            if self.is_marked(id) {
                survivors.push(id);
            } else if self.release(id).is_some() {
                report.freed += 1;
            }
        }
        for id in young_space {
            if self.is_marked(id) {
                survivors.push(id);
                report.tenured += 1;
            } else if self.release(id).is_some() {
                report.freed += 1;
            }
        }

        let mut address = 8i64;
        for &id in &survivors {
            if let Some(obj) = self.object_mut(id) {
                obj.mark = false;
                obj.dirty = false;
                obj.oop = address;
                address += obj.size_in_bytes() as i64;
            }
        }
        report.survivors = survivors.len();
        self.old_space = survivors;
        self.renumber();
        self.young_bytes = 0;
        self.reset_young_oops();
        self.purge_class_table();
        self.gc_request = GcRequest::None;

        let elapsed = start.elapsed();
        self.stats.full_gcs += 1;
        self.stats.full_gc_time += elapsed;
        self.stats.tenured += report.tenured as u64;
        self.stats.freed += report.freed as u64;
        debug!(
            "full GC: {} freed, {} tenured, {} live, {} bytes in use, {:?}",
            report.freed,
            report.tenured,
            report.survivors,
            self.bytes_in_use,
            elapsed
        );
        report
    }

    /// Collect new space only. Survivors stay young; too many of them request a full GC.
    pub fn partial_gc(&mut self, roots: &[OOP]) -> GcReport {
        let start = Instant::now();
        let mut root_ids = self.root_ids(roots);
        let mut weak = Vec::new();
        let remembered: Vec<ObjectId> = self
            .old_space
            .iter()
            .copied()
            .filter(|&id| self.object(id).map_or(false, |obj| obj.dirty))
            .collect();
        for &id in &remembered {
            let (limit, is_weak) = self.traced_slots(id);
            if let Some(obj) = self.object(id) {
                root_ids.push(obj.class);
                root_ids.extend(obj.pointers()[..limit].iter().filter_map(|slot| slot.as_oid()));
            }
            if is_weak {
                weak.push(id);
            }
        }
        self.mark_from(root_ids, true, &mut weak);
        let weak_cleared = self.clear_weak_slots(&weak, true);

        let mut report = GcReport {
            weak_cleared,
            ..GcReport::default()
        };
        let young_space = mem::replace(&mut self.young_space, Vec::new());
        let mut survivors = Vec::with_capacity(young_space.len());
        self.young_bytes = 0;
        self.reset_young_oops();
        for id in young_space {
            if self.is_marked(id) {
                let oop = self.next_young_oop();
                if let Some(obj) = self.object_mut(id) {
                    obj.mark = false;
                    obj.oop = oop;
                    let size = obj.size_in_bytes();
                    self.young_bytes += size;
                }
                survivors.push(id);
            } else if self.release(id).is_some() {
                report.freed += 1;
            }
        }
        report.survivors = survivors.len();
        self.young_space = survivors;
        self.renumber_young();

        for id in remembered {
            let still_dirty = match self.object(id) {
                Some(obj) => {
                    self.is_young(OOP::Object(obj.class))
                        || obj.pointers().iter().any(|&slot| self.is_young(slot))
                }
                None => false,
            };
            if let Some(obj) = self.object_mut(id) {
                obj.dirty = still_dirty;
            }
        }

        self.gc_request = GcRequest::None;
        if report.survivors > self.tenure_threshold {
            self.request_gc(GcRequest::Full);
        }
        let elapsed = start.elapsed();
        self.stats.partial_gcs += 1;
        self.stats.partial_gc_time += elapsed;
        self.stats.freed += report.freed as u64;
        debug!(
            "partial GC: {} freed, {} young survivors, {:?}",
            report.freed, report.survivors, elapsed
        );
        report
    }

    /// Move every young object to old space without collecting anything.
    pub(crate) fn tenure_all(&mut self) {
        let young_space = mem::replace(&mut self.young_space, Vec::new());
        let mut address = self
            .old_space
            .last()
            .and_then(|&id| self.object(id))
            .map_or(8, |obj| obj.oop + obj.size_in_bytes() as i64);
        for id in young_space {
            if let Some(obj) = self.object_mut(id) {
                obj.oop = address;
                obj.dirty = false;
                address += obj.size_in_bytes() as i64;
            }
            self.old_space.push(id);
        }
        for id in self.old_space.clone() {
            if let Some(obj) = self.object_mut(id) {
                obj.dirty = false;
            }
        }
        self.renumber();
        self.young_bytes = 0;
        self.reset_young_oops();
    }

    fn purge_class_table(&mut self) {
        let dead: Vec<u32> = self
            .class_table
            .iter()
            .filter(|(_, &id)| !self.is_live(id))
            .map(|(&index, _)| index)
            .collect();
        for index in dead {
            self.class_table.remove(&index);
        }
    }

    /// Swap (or redirect) every reference to each `from[i]` with `to[i]`. Registers that hold
    /// oops outside the heap are passed in `extra_roots` and rewritten too.
    pub fn bulk_become(
        &mut self,
        from: &[OOP],
        to: &[OOP],
        two_way: bool,
        copy_hash: bool,
        extra_roots: &mut [OOP],
    ) -> Result<(), BecomeError> {
        if from.len() != to.len() {
            return Err(BecomeError::SizeMismatch);
        }
        let mut forward: HashMap<ObjectId, OOP> = HashMap::new();
        let mut pairs = Vec::with_capacity(from.len());
        for (&f, &t) in from.iter().zip(to) {
            let f_id = f.as_oid().ok_or(BecomeError::NotObject)?;
            let t_id = t.as_oid().ok_or(BecomeError::NotObject)?;
            if !self.is_live(f_id) || !self.is_live(t_id) {
                return Err(BecomeError::NotObject);
            }
            if f_id == t_id {
                continue;
            }
            if forward.contains_key(&f_id) || (two_way && forward.contains_key(&t_id)) {
                return Err(BecomeError::Duplicate);
            }
            forward.insert(f_id, t);
            if two_way {
                forward.insert(t_id, f);
            }
            pairs.push((f_id, t_id));
        }
        if pairs.is_empty() {
            return Ok(());
        }

        let mut class_indices = BTreeSet::new();
        for &(f, t) in &pairs {
            let f_index = self.class_index_of(OOP::Object(f));
            let t_index = self.class_index_of(OOP::Object(t));
            if two_way && f_index.is_some() && t_index.is_some() {
                warn!("unexpected two-way class become of {:?} and {:?}", f, t);
            }
            class_indices.extend(f_index);
            class_indices.extend(t_index);
            if copy_hash {
                let f_hash = self.hash_of(OOP::Object(f));
                let t_hash = self.hash_of(OOP::Object(t));
                if let Some(obj) = self.object_mut(t) {
                    obj.hash = f_hash;
                }
                if two_way {
                    if let Some(obj) = self.object_mut(f) {
                        obj.hash = t_hash;
                    }
                }
            }
        }
        for index in &class_indices {
            self.class_table.remove(index);
        }
        for &(f, t) in &pairs {
            for &id in &[f, t] {
                let hash = self.object(id).map_or(0, |obj| obj.hash);
                if class_indices.contains(&hash) {
                    self.class_table.insert(hash, id);
                }
            }
        }

        let redirect = |oop: &mut OOP| {
            if let Some(id) = oop.as_oid() {
                if let Some(&target) = forward.get(&id) {
                    *oop = target;
                }
            }
        };
        let ids: Vec<ObjectId> = self.object_ids().collect();
        let young_set: BTreeSet<ObjectId> = self.young_space.iter().copied().collect();
        for &id in &ids {
            let obj = match self.object_mut(id) {
                Some(obj) => obj,
                None => continue,
            };
            let mut class = OOP::Object(obj.class);
            redirect(&mut class);
            if let Some(class_id) = class.as_oid() {
                obj.class = class_id;
            }
            let old = !obj.is_young();
            let mut gained_young = young_set.contains(&obj.class);
            for slot in obj.pointers_mut() {
                redirect(slot);
                if let OOP::Object(target) = *slot {
                    gained_young |= young_set.contains(&target);
                }
            }
            if old && gained_young {
                obj.dirty = true;
            }
        }
        let mut specials_oop = self.special_objects();
        redirect(&mut specials_oop);
        self.set_special_objects(specials_oop);
        for root in extra_roots.iter_mut() {
            redirect(root);
        }
        debug!("become: {} pairs, two way: {}", pairs.len(), two_way);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objectmemory::builder::MemoryBuilder;

    fn weak_class(memory: &mut ObjectMemory) -> OOP {
        let format = memory.kind().encode_class_format(ClassFormat::new(0, FMT_WEAK));
        let object = memory.special(specials::CLASS_ARRAY);
        memory.new_pointers(
            memory.get_class_of(object),
            FMT_FIXED,
            vec![object, NIL_PTR, OOP::Int(format as i32), NIL_PTR, NIL_PTR, NIL_PTR, NIL_PTR],
        )
    }

    #[test]
    fn unreachable_young_objects_are_freed() {
        let mut memory = MemoryBuilder::new(MemoryKind::V3).build();
        let before = memory.object_count();
        let kept = memory.new_array(vec![OOP::Int(1)]);
        memory.new_array(vec![OOP::Int(2)]);
        let report = memory.partial_gc(&[kept]);
        assert_eq!(report.freed, 1);
        assert_eq!(memory.object_count(), before + 1);
        assert_eq!(memory.get_ptr(kept, 0), OOP::Int(1));
        assert!(memory.is_young(kept));
    }

    #[test]
    fn remembered_old_objects_keep_young_referents_alive() {
        let mut memory = MemoryBuilder::new(MemoryKind::Spur).build();
        let holder = memory.new_array(vec![NIL_PTR]);
        memory.full_gc(&[holder]);
        assert!(!memory.is_young(holder));

        let young = memory.new_string("kept");
        memory.put_ptr(holder, 0, young);
        memory.partial_gc(&[holder]);
        assert_eq!(memory.string_of(memory.get_ptr(holder, 0)), "kept");

        memory.full_gc(&[holder]);
        assert!(!memory.is_young(memory.get_ptr(holder, 0)));
    }

    #[test]
    fn weak_slots_are_cleared_when_referent_dies() {
        let mut memory = MemoryBuilder::new(MemoryKind::V3).build();
        let class = weak_class(&mut memory);
        let weak = memory.instantiate_class(class, 2).unwrap();
        let strong = memory.new_string("strong");
        let doomed = memory.new_string("doomed");
        memory.put_ptr(weak, 0, strong);
        memory.put_ptr(weak, 1, doomed);

        let report = memory.full_gc(&[weak, strong, class]);
        assert!(report.weak_cleared);
        assert_eq!(memory.get_ptr(weak, 0), strong);
        assert_eq!(memory.get_ptr(weak, 1), NIL_PTR);
    }

    #[test]
    fn become_swaps_references() {
        let mut memory = MemoryBuilder::new(MemoryKind::V3).build();
        let a = memory.new_string("a");
        let b = memory.new_string("b");
        let holder = memory.new_array(vec![a, b, a]);
        let mut registers = [a];
        memory
            .bulk_become(&[a], &[b], true, false, &mut registers)
            .unwrap();
        assert_eq!(memory.pointers(holder), &[b, a, b]);
        assert_eq!(registers, [b]);
    }

    #[test]
    fn one_way_become_with_hash_copy() {
        let mut memory = MemoryBuilder::new(MemoryKind::V3).build();
        let a = memory.new_string("a");
        let b = memory.new_string("b");
        let hash = memory.hash_of(a);
        let holder = memory.new_array(vec![a]);
        memory.bulk_become(&[a], &[b], false, true, &mut []).unwrap();
        assert_eq!(memory.get_ptr(holder, 0), b);
        assert_eq!(memory.hash_of(b), hash);
    }

    #[test]
    fn become_rejects_duplicates_and_ignores_self() {
        let mut memory = MemoryBuilder::new(MemoryKind::V3).build();
        let a = memory.new_string("a");
        let b = memory.new_string("b");
        assert_eq!(
            memory.bulk_become(&[a, a], &[b, b], true, false, &mut []),
            Err(BecomeError::Duplicate)
        );
        assert_eq!(
            memory.bulk_become(&[OOP::Int(1)], &[b], true, false, &mut []),
            Err(BecomeError::NotObject)
        );
        let holder = memory.new_array(vec![a]);
        memory.bulk_become(&[a], &[a], true, false, &mut []).unwrap();
        assert_eq!(memory.get_ptr(holder, 0), a);
    }
}
