//! Bootstraps a small but complete object memory without an image file: the kernel classes,
//! the special objects array, a scheduler with one runnable process, and whatever methods the
//! caller assembles. Tests and tools use it to build heaps of either format.

use std::collections::HashMap;

use super::format::*;
use super::specials::*;
use super::{Body, ImageInfo, ObjectId, ObjectMemory, FALSE_PTR, NIL_PTR, OOP, TRUE_PTR};

/// Everything needed to assemble a compiled method or block.
#[derive(Clone, Debug, Default)]
pub struct MethodSpec {
    pub num_args: usize,
    pub num_temps: usize,
    pub literals: Vec<OOP>,
    pub bytecodes: Vec<u8>,
    pub primitive: usize,
    pub sista: bool,
    pub large_frame: bool,
}

impl MethodSpec {
    pub fn new(bytecodes: &[u8]) -> Self {
        MethodSpec {
            bytecodes: bytecodes.to_vec(),
            ..MethodSpec::default()
        }
    }

    pub fn args(mut self, num_args: usize) -> Self {
        self.num_args = num_args;
        self.num_temps = self.num_temps.max(num_args);
        self
    }

    pub fn temps(mut self, num_temps: usize) -> Self {
        self.num_temps = num_temps;
        self
    }

    pub fn literals(mut self, literals: Vec<OOP>) -> Self {
        self.literals = literals;
        self
    }

    pub fn primitive(mut self, primitive: usize) -> Self {
        self.primitive = primitive;
        self
    }

    pub fn sista(mut self) -> Self {
        self.sista = true;
        self
    }

    pub fn large_frame(mut self) -> Self {
        self.large_frame = true;
        self
    }
}

/// (name, superclass, named slots, format)
const KERNEL_CLASSES: &[(&str, &str, usize, u8)] = &[
    ("ProtoObject", "", 0, FMT_EMPTY),
    ("Object", "ProtoObject", 0, FMT_EMPTY),
    ("Behavior", "Object", 3, FMT_FIXED),
    ("Class", "Behavior", 7, FMT_FIXED),
    ("UndefinedObject", "Object", 0, FMT_EMPTY),
    ("Boolean", "Object", 0, FMT_EMPTY),
    ("True", "Boolean", 0, FMT_EMPTY),
    ("False", "Boolean", 0, FMT_EMPTY),
    ("Magnitude", "Object", 0, FMT_EMPTY),
    ("Character", "Magnitude", 1, FMT_FIXED),
    ("Number", "Magnitude", 0, FMT_EMPTY),
    ("Integer", "Number", 0, FMT_EMPTY),
    ("SmallInteger", "Integer", 0, FMT_EMPTY),
    ("LargePositiveInteger", "Integer", 0, FMT_BYTES),
    ("LargeNegativeInteger", "LargePositiveInteger", 0, FMT_BYTES),
    ("Float", "Number", 0, FMT_WORDS),
    ("Collection", "Object", 0, FMT_EMPTY),
    ("ArrayedCollection", "Collection", 0, FMT_EMPTY),
    ("Array", "ArrayedCollection", 0, FMT_INDEXABLE),
    ("WeakArray", "Array", 0, FMT_WEAK),
    ("ByteArray", "ArrayedCollection", 0, FMT_BYTES),
    ("Bitmap", "ArrayedCollection", 0, FMT_WORDS),
    ("WordArray", "ArrayedCollection", 0, FMT_WORDS),
    ("String", "ArrayedCollection", 0, FMT_BYTES),
    ("Symbol", "String", 0, FMT_BYTES),
    ("Point", "Object", 2, FMT_FIXED),
    ("Association", "Magnitude", 2, FMT_FIXED),
    ("Message", "Object", 3, FMT_FIXED),
    ("MethodDictionary", "Collection", 2, FMT_FIXED_INDEXABLE),
    ("CompiledMethod", "ByteArray", 0, FMT_METHOD),
    ("CompiledBlock", "CompiledMethod", 0, FMT_METHOD),
    ("MethodContext", "Object", 6, FMT_FIXED_INDEXABLE),
    ("BlockContext", "Object", 6, FMT_FIXED_INDEXABLE),
    ("BlockClosure", "Object", 3, FMT_FIXED_INDEXABLE),
    ("FullBlockClosure", "BlockClosure", 4, FMT_FIXED_INDEXABLE),
    ("ProcessorScheduler", "Object", 2, FMT_FIXED),
    ("LinkedList", "Collection", 2, FMT_FIXED),
    ("Semaphore", "LinkedList", 3, FMT_FIXED),
    ("Mutex", "LinkedList", 3, FMT_FIXED),
    ("Process", "Object", 4, FMT_FIXED),
];

const SPECIAL_CLASSES: &[(usize, &str)] = &[
    (CLASS_BITMAP, "Bitmap"),
    (CLASS_SMALL_INTEGER, "SmallInteger"),
    (CLASS_STRING, "String"),
    (CLASS_ARRAY, "Array"),
    (CLASS_FLOAT, "Float"),
    (CLASS_METHOD_CONTEXT, "MethodContext"),
    (CLASS_BLOCK_CONTEXT, "BlockContext"),
    (CLASS_POINT, "Point"),
    (CLASS_LARGE_POSITIVE_INTEGER, "LargePositiveInteger"),
    (CLASS_MESSAGE, "Message"),
    (CLASS_COMPILED_METHOD, "CompiledMethod"),
    (CLASS_SEMAPHORE, "Semaphore"),
    (CLASS_CHARACTER, "Character"),
    (CLASS_BYTE_ARRAY, "ByteArray"),
    (CLASS_PROCESS, "Process"),
    (CLASS_BLOCK_CLOSURE, "BlockClosure"),
    (CLASS_FULL_BLOCK_CLOSURE, "FullBlockClosure"),
    (CLASS_MUTEX, "Mutex"),
    (CLASS_LARGE_NEGATIVE_INTEGER, "LargeNegativeInteger"),
];

const SPECIAL_SELECTOR_NAMES: &[(usize, &str)] = &[
    (SELECTOR_DOES_NOT_UNDERSTAND, "doesNotUnderstand:"),
    (SELECTOR_CANNOT_RETURN, "cannotReturn:"),
    (SELECTOR_MUST_BE_BOOLEAN, "mustBeBoolean"),
    (SELECTOR_CANNOT_INTERPRET, "cannotInterpret:"),
    (SELECTOR_ABOUT_TO_RETURN, "aboutToReturn:through:"),
    (SELECTOR_RUN_WITH_IN, "run:with:in:"),
    (SELECTOR_ATTEMPT_TO_ASSIGN, "attemptToAssign:withIndex:"),
    (SELECTOR_UNKNOWN_BYTECODE, "unknownBytecode"),
    (SELECTOR_COUNTER_TRIPPED, "conditionalBranchCounterTrippedOn:"),
    (SELECTOR_SISTA_TRAP, "sistaTrap"),
];

/// The 32 selectors with dedicated send bytecodes, with their argument counts.
pub const SPECIAL_SELECTORS_TABLE: [(&str, usize); 32] = [
    ("+", 1),
    ("-", 1),
    ("<", 1),
    (">", 1),
    ("<=", 1),
    (">=", 1),
    ("=", 1),
    ("~=", 1),
    ("*", 1),
    ("/", 1),
    ("\\\\", 1),
    ("@", 1),
    ("bitShift:", 1),
    ("//", 1),
    ("bitAnd:", 1),
    ("bitOr:", 1),
    ("at:", 1),
    ("at:put:", 2),
    ("size", 0),
    ("next", 0),
    ("nextPut:", 1),
    ("atEnd", 0),
    ("==", 1),
    ("class", 0),
    ("blockCopy:", 1),
    ("value", 0),
    ("value:", 1),
    ("do:", 1),
    ("new", 0),
    ("new:", 1),
    ("x", 0),
    ("y", 0),
];

const V3_COMPACT_CLASSES: &[(usize, &str)] = &[
    (3, "Array"),
    (4, "LargeNegativeInteger"),
    (5, "LargePositiveInteger"),
    (6, "Float"),
    (7, "MethodDictionary"),
    (8, "Association"),
    (9, "Point"),
    (11, "String"),
    (13, "BlockContext"),
    (14, "MethodContext"),
];

const METHOD_DICTIONARY_CAPACITY: usize = 32;
const PRIORITY_LEVELS: usize = 80;
const USER_PRIORITY: i32 = 40;

pub struct MemoryBuilder {
    memory: ObjectMemory,
    symbols: HashMap<String, OOP>,
    classes: HashMap<String, OOP>,
    startup: Option<(OOP, OOP)>,
}

impl MemoryBuilder {
    pub fn new(kind: MemoryKind) -> Self {
        let mut memory = ObjectMemory::new(kind, ImageInfo::new(kind));
        let placeholder = ObjectId::new(0);
        for _ in 0..3 {
            memory.allocate_unindexed(placeholder, FMT_EMPTY, Body::Pointers(vec![]));
        }

        let mut classes = HashMap::new();
        for &(name, _, _, _) in KERNEL_CLASSES {
            let id = memory.allocate_unindexed(placeholder, FMT_FIXED, Body::Pointers(vec![NIL_PTR; 7]));
            classes.insert(name.to_string(), OOP::Object(id));
        }
        let class_class = classes["Class"];
        for &(name, superclass, inst_size, spec) in KERNEL_CLASSES {
            let class = classes[name];
            let spec = if kind == MemoryKind::Spur && name == "Character" {
                // immediate
                7
            } else {
                spec
            };
            let inst_size = if kind == MemoryKind::Spur && name == "Character" { 0 } else { inst_size };
            let format = kind.encode_class_format(ClassFormat::new(inst_size, spec));
            let superclass = classes.get(superclass).copied().unwrap_or(NIL_PTR);
            memory.put_ptr(class, CLASS_SUPERCLASS_INDEX, superclass);
            memory.put_ptr(class, CLASS_FORMAT_INDEX, OOP::Int(format as i32));
            memory.set_class_unindexed(class, class_class);
        }
        memory.set_class_unindexed(NIL_PTR, classes["UndefinedObject"]);
        memory.set_class_unindexed(FALSE_PTR, classes["False"]);
        memory.set_class_unindexed(TRUE_PTR, classes["True"]);

        if kind == MemoryKind::Spur {
            let ids = |name: &str| classes[name].as_oid().unwrap_or(placeholder);
            memory.register_class_index(SPUR_SMALL_INTEGER_CLASS_INDEX, ids("SmallInteger"));
            memory.register_class_index(SPUR_CHARACTER_CLASS_INDEX, ids("Character"));
            for &(name, _, _, _) in KERNEL_CLASSES {
                memory.ensure_class_index(ids(name));
            }
        }

        let mut builder = MemoryBuilder {
            memory,
            symbols: HashMap::new(),
            classes,
            startup: None,
        };
        builder.install_specials();
        for &(name, _, _, _) in KERNEL_CLASSES {
            let class = builder.classes[name];
            let dict = builder.new_method_dictionary(METHOD_DICTIONARY_CAPACITY);
            let symbol = builder.symbol(name);
            builder.memory.put_ptr(class, CLASS_MESSAGE_DICT_INDEX, dict);
            builder.memory.put_ptr(class, CLASS_NAME_INDEX, symbol);
        }
        builder
    }

    fn install_specials(&mut self) {
        let specials = self.memory.new_array(vec![NIL_PTR; SPECIAL_OBJECTS_SIZE]);
        self.memory.set_special_objects(specials);
        let array_class = self.classes["Array"];
        self.memory.set_class_unindexed(specials, array_class);
        self.memory.set_special(NIL_OBJECT, NIL_PTR);
        self.memory.set_special(FALSE_OBJECT, FALSE_PTR);
        self.memory.set_special(TRUE_OBJECT, TRUE_PTR);
        for &(index, name) in SPECIAL_CLASSES {
            let class = self.classes[name];
            self.memory.set_special(index, class);
        }

        let globals = self.memory.new_array(vec![]);
        self.memory.set_special(SMALLTALK_DICTIONARY, globals);

        let mut selectors = Vec::with_capacity(64);
        for &(name, args) in SPECIAL_SELECTORS_TABLE.iter() {
            selectors.push(self.symbol(name));
            selectors.push(OOP::Int(args as i32));
        }
        let selectors = self.memory.new_array(selectors);
        self.memory.set_special(SPECIAL_SELECTORS, selectors);
        for &(index, name) in SPECIAL_SELECTOR_NAMES {
            let symbol = self.symbol(name);
            self.memory.set_special(index, symbol);
        }

        for &index in &[THE_LOW_SPACE_SEMAPHORE, THE_INTERRUPT_SEMAPHORE, THE_TIMER_SEMAPHORE] {
            let semaphore = self.new_instance("Semaphore", vec![NIL_PTR, NIL_PTR, OOP::Int(0)]);
            self.memory.set_special(index, semaphore);
        }
        let external = self.memory.new_array(vec![NIL_PTR; 16]);
        self.memory.set_special(EXTERNAL_OBJECTS_ARRAY, external);

        if self.memory.kind() == MemoryKind::V3 {
            let character = self.classes["Character"];
            let table: Vec<OOP> = (0..256)
                .map(|value| self.memory.new_pointers(character, FMT_FIXED, vec![OOP::Int(value)]))
                .collect();
            let table = self.memory.new_array(table);
            self.memory.set_special(CHARACTER_TABLE, table);

            let mut compact = vec![NIL_PTR; 31];
            for &(index, name) in V3_COMPACT_CLASSES {
                compact[index - 1] = self.classes[name];
            }
            let compact = self.memory.new_array(compact);
            self.memory.set_special(COMPACT_CLASSES, compact);
        }

        let lists: Vec<OOP> = (0..PRIORITY_LEVELS)
            .map(|_| self.new_instance("LinkedList", vec![NIL_PTR, NIL_PTR]))
            .collect();
        let lists = self.memory.new_array(lists);
        let process = self.new_instance(
            "Process",
            vec![NIL_PTR, NIL_PTR, OOP::Int(USER_PRIORITY), NIL_PTR],
        );
        let scheduler = self.new_instance("ProcessorScheduler", vec![lists, process]);
        let name = self.symbol("Processor");
        let association = self.new_instance("Association", vec![name, scheduler]);
        self.memory.set_special(SCHEDULER_ASSOCIATION, association);
    }

    fn new_instance(&mut self, class: &str, slots: Vec<OOP>) -> OOP {
        let class = self.classes[class];
        self.memory.new_pointers(class, FMT_FIXED, slots)
    }

    fn new_method_dictionary(&mut self, capacity: usize) -> OOP {
        let array = self.memory.new_array(vec![NIL_PTR; capacity]);
        let mut slots = vec![NIL_PTR; MESSAGE_DICT_SELECTOR_START + capacity];
        slots[MESSAGE_DICT_TALLY_INDEX] = OOP::Int(0);
        slots[MESSAGE_DICT_METHOD_ARRAY_INDEX] = array;
        let class = self.classes["MethodDictionary"];
        self.memory.new_pointers(class, FMT_FIXED_INDEXABLE, slots)
    }

    pub fn kind(&self) -> MemoryKind {
        self.memory.kind()
    }

    pub fn memory(&mut self) -> &mut ObjectMemory {
        &mut self.memory
    }

    /// Interned symbol.
    pub fn symbol(&mut self, name: &str) -> OOP {
        if let Some(&symbol) = self.symbols.get(name) {
            return symbol;
        }
        let class = self.classes["Symbol"];
        let symbol = self.memory.new_bytes(class, name.as_bytes().to_vec());
        self.symbols.insert(name.to_string(), symbol);
        symbol
    }

    /// A kernel or user-defined class by name; nil when there is no such class.
    pub fn class_named(&self, name: &str) -> OOP {
        self.classes.get(name).copied().unwrap_or(NIL_PTR)
    }

    pub fn define_class(&mut self, name: &str, superclass: OOP, format: ClassFormat) -> OOP {
        let dict = self.new_method_dictionary(METHOD_DICTIONARY_CAPACITY);
        let symbol = self.symbol(name);
        let encoded = self.memory.kind().encode_class_format(format);
        let class_class = self.classes["Class"];
        let class = self.memory.new_pointers(
            class_class,
            FMT_FIXED,
            vec![
                superclass,
                dict,
                OOP::Int(encoded as i32),
                NIL_PTR,
                NIL_PTR,
                NIL_PTR,
                symbol,
            ],
        );
        if let Some(id) = class.as_oid() {
            if self.memory.kind() == MemoryKind::Spur {
                self.memory.ensure_class_index(id);
            }
        }
        self.classes.insert(name.to_string(), class);
        class
    }

    /// Assemble a method object. The selector and a binding for `class` are appended to the
    /// literals; Spur methods with a primitive get the callPrimitive prefix.
    pub fn assemble(&mut self, spec: &MethodSpec, selector: OOP, class: OOP, method_class: &str) -> OOP {
        let kind = self.memory.kind();
        let mut bytecodes = Vec::with_capacity(spec.bytecodes.len() + 3);
        if kind == MemoryKind::Spur && spec.primitive > 0 {
            let op = if spec.sista { SISTA_CALL_PRIMITIVE } else { V3_CALL_PRIMITIVE };
            bytecodes.extend_from_slice(&[op, spec.primitive as u8, (spec.primitive >> 8) as u8]);
        }
        bytecodes.extend_from_slice(&spec.bytecodes);

        let class_name = self.memory.get_ptr(class, CLASS_NAME_INDEX);
        let binding = self.new_instance("Association", vec![class_name, class]);
        let mut literals = spec.literals.clone();
        literals.push(selector);
        literals.push(binding);
        let header = MethodHeader {
            num_literals: literals.len(),
            num_temps: spec.num_temps.max(spec.num_args),
            num_args: spec.num_args,
            primitive: spec.primitive,
            large_frame: spec.large_frame,
            sista: spec.sista,
        };
        let mut pointers = Vec::with_capacity(literals.len() + 1);
        pointers.push(OOP::Int(kind.encode_method_header(&header) as i32));
        pointers.extend(literals);
        let method_class = self.classes[method_class];
        self.memory.new_method(method_class, pointers, bytecodes)
    }

    /// A CompiledBlock for full block closures.
    pub fn compiled_block(&mut self, spec: &MethodSpec) -> OOP {
        let object = self.classes["Object"];
        self.assemble(spec, NIL_PTR, object, "CompiledBlock")
    }

    pub fn define_method(&mut self, class: OOP, selector: &str, spec: MethodSpec) -> OOP {
        let selector = self.symbol(selector);
        let method = self.assemble(&spec, selector, class, "CompiledMethod");
        self.install_method(class, selector, method);
        method
    }

    /// Add a method under the same probe sequence lookup uses, growing the dictionary when
    /// it fills past three quarters.
    pub fn install_method(&mut self, class: OOP, selector: OOP, method: OOP) {
        let mut dict = self.memory.get_ptr(class, CLASS_MESSAGE_DICT_INDEX);
        let capacity = self.memory.slot_count(dict) - MESSAGE_DICT_SELECTOR_START;
        let tally = self
            .memory
            .get_ptr(dict, MESSAGE_DICT_TALLY_INDEX)
            .try_as_integer()
            .unwrap_or(0) as usize;
        if (tally + 1) * 4 > capacity * 3 {
            let bigger = self.new_method_dictionary(capacity * 2);
            let array = self.memory.get_ptr(dict, MESSAGE_DICT_METHOD_ARRAY_INDEX);
            for i in 0..capacity {
                let key = self.memory.get_ptr(dict, MESSAGE_DICT_SELECTOR_START + i);
                if !key.is_nil() {
                    let value = self.memory.get_ptr(array, i);
                    self.probe_insert(bigger, key, value);
                }
            }
            self.memory.put_ptr(class, CLASS_MESSAGE_DICT_INDEX, bigger);
            dict = bigger;
        }
        self.probe_insert(dict, selector, method);
    }

    fn probe_insert(&mut self, dict: OOP, selector: OOP, method: OOP) {
        let capacity = self.memory.slot_count(dict) - MESSAGE_DICT_SELECTOR_START;
        let mask = capacity - 1;
        let array = self.memory.get_ptr(dict, MESSAGE_DICT_METHOD_ARRAY_INDEX);
        let mut index = self.memory.identity_hash(selector) as usize & mask;
        loop {
            let key = self.memory.get_ptr(dict, MESSAGE_DICT_SELECTOR_START + index);
            if key.is_nil() || key == selector {
                if key.is_nil() {
                    let tally = self
                        .memory
                        .get_ptr(dict, MESSAGE_DICT_TALLY_INDEX)
                        .try_as_integer()
                        .unwrap_or(0);
                    self.memory
                        .put_ptr(dict, MESSAGE_DICT_TALLY_INDEX, OOP::Int(tally as i32 + 1));
                }
                self.memory.put_ptr(dict, MESSAGE_DICT_SELECTOR_START + index, selector);
                self.memory.put_ptr(array, index, method);
                return;
            }
            index = (index + 1) & mask;
        }
    }

    /// Make the active process start in `method` with `receiver`.
    pub fn set_startup(&mut self, receiver: OOP, method: OOP) {
        self.startup = Some((receiver, method));
    }

    /// A suspended context ready to run `method` from its first bytecode.
    pub fn new_context(&mut self, receiver: OOP, method: OOP) -> OOP {
        let header = self.memory.method_header(method).unwrap_or_default();
        let mut slots = vec![NIL_PTR; CONTEXT_TEMP_FRAME_START + header.frame_size()];
        slots[CONTEXT_PC_INDEX] = OOP::Int(header.initial_pc_offset() as i32 + 1);
        slots[CONTEXT_STACKP_INDEX] = OOP::Int(header.num_temps as i32);
        slots[CONTEXT_METHOD_INDEX] = method;
        slots[CONTEXT_RECEIVER_INDEX] = receiver;
        let class = self.classes["MethodContext"];
        self.memory.new_pointers(class, FMT_FIXED_INDEXABLE, slots)
    }

    pub fn active_process(&self) -> OOP {
        let association = self.memory.special(SCHEDULER_ASSOCIATION);
        let scheduler = self.memory.get_ptr(association, ASSOCIATION_VALUE_INDEX);
        self.memory.get_ptr(scheduler, SCHEDULER_ACTIVE_PROCESS_INDEX)
    }

    /// Finish the heap: everything is tenured and the active process has a context.
    pub fn build(mut self) -> ObjectMemory {
        let (receiver, method) = match self.startup {
            Some(startup) => startup,
            None => {
                let undefined = self.classes["UndefinedObject"];
                // jump back to itself, forever
                let idle = self.define_method(undefined, "idle", MethodSpec::new(&[0xA3, 0xFE]));
                (NIL_PTR, idle)
            }
        };
        let context = self.new_context(receiver, method);
        let process = self.active_process();
        self.memory
            .put_ptr(process, PROCESS_SUSPENDED_CONTEXT_INDEX, context);
        self.memory.tenure_all();
        self.memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_is_wired_up() {
        for &kind in &[MemoryKind::V3, MemoryKind::Spur] {
            let memory = MemoryBuilder::new(kind).build();
            assert_eq!(memory.special(NIL_OBJECT), NIL_PTR);
            assert_eq!(memory.special(TRUE_OBJECT), TRUE_PTR);
            let undefined = memory.get_class_of(NIL_PTR);
            assert_eq!(memory.string_of(memory.get_ptr(undefined, CLASS_NAME_INDEX)), "UndefinedObject");
            let selectors = memory.special(SPECIAL_SELECTORS);
            assert_eq!(memory.slot_count(selectors), 64);
            assert_eq!(memory.young_count(), 0);
        }
    }

    #[test]
    fn spur_immediate_classes_have_fixed_indices() {
        let builder = MemoryBuilder::new(MemoryKind::Spur);
        let small_integer = builder.class_named("SmallInteger");
        let memory = builder.build();
        assert_eq!(
            memory.class_index_of(small_integer),
            Some(SPUR_SMALL_INTEGER_CLASS_INDEX)
        );
    }

    #[test]
    fn method_dictionary_grows() {
        let mut builder = MemoryBuilder::new(MemoryKind::V3);
        let object = builder.class_named("Object");
        for i in 0..40 {
            builder.define_method(object, &format!("m{}", i), MethodSpec::new(&[0x78]));
        }
        let memory = builder.memory();
        let dict = memory.get_ptr(object, CLASS_MESSAGE_DICT_INDEX);
        assert_eq!(memory.get_ptr(dict, MESSAGE_DICT_TALLY_INDEX), OOP::Int(40));
        assert_eq!(memory.slot_count(dict), MESSAGE_DICT_SELECTOR_START + 64);
    }

    #[test]
    fn spur_methods_carry_call_primitive() {
        let mut builder = MemoryBuilder::new(MemoryKind::Spur);
        let object = builder.class_named("Object");
        let method = builder.define_method(object, "size", MethodSpec::new(&[0x78]).primitive(62));
        let memory = builder.memory();
        assert_eq!(memory.bytes(method), &[V3_CALL_PRIMITIVE, 62, 0, 0x78]);
        assert_eq!(memory.method_header(method).unwrap().primitive, 62);
    }
}
