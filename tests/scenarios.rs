use stvm::objectmemory::builder::{MemoryBuilder, MethodSpec};
use stvm::objectmemory::format::{ClassFormat, FMT_EMPTY, FMT_FIXED};
use stvm::objectmemory::image::save_image;
use stvm::objectmemory::specials::*;
use stvm::objectmemory::{MemoryKind, NIL_PTR, OOP};
use stvm::{Interpreter, VmConfig, VmError};

const KINDS: [MemoryKind; 2] = [MemoryKind::V3, MemoryKind::Spur];

fn boot(builder: MemoryBuilder) -> Interpreter {
    Interpreter::boot(builder.build(), VmConfig::default()).unwrap()
}

fn symbol(interp: &Interpreter, name: &str) -> OOP {
    // builder symbols are unique, so any instance with the right bytes will do
    let memory = interp.memory();
    let symbol_class = memory.get_class_of(memory.special(SELECTOR_DOES_NOT_UNDERSTAND));
    let mut oop = memory.initial_instance_of(symbol_class);
    while let Some(candidate) = oop {
        if memory.string_of(candidate) == name {
            return candidate;
        }
        oop = memory.next_instance_of(candidate);
    }
    panic!("no symbol {}", name)
}

fn define_gc(builder: &mut MemoryBuilder) {
    let object = builder.class_named("Object");
    builder.define_method(object, "fullGC", MethodSpec::new(&[0x70, 0x7C]).primitive(130));
}

#[test]
fn one_plus_two_leaves_no_young_garbage() {
    for &kind in &KINDS {
        let mut builder = MemoryBuilder::new(kind);
        let undefined = builder.class_named("UndefinedObject");
        // push 1, push 2, send #+, ^top
        builder.define_method(undefined, "three", MethodSpec::new(&[0x76, 0x77, 0xB0, 0x7C]));
        define_gc(&mut builder);
        let mut interp = boot(builder);

        let three = symbol(&interp, "three");
        assert_eq!(interp.evaluate(NIL_PTR, three, &[]).unwrap(), OOP::Int(3));

        let gc = symbol(&interp, "fullGC");
        assert!(interp.evaluate(NIL_PTR, gc, &[]).unwrap().is_integer());
        assert_eq!(interp.memory().young_count(), 0);
    }
}

#[test]
fn perform_of_unknown_selector_sends_does_not_understand() {
    for &kind in &KINDS {
        let mut builder = MemoryBuilder::new(kind);
        let object = builder.class_named("Object");
        let undefined = builder.class_named("UndefinedObject");
        builder.define_method(object, "perform:", MethodSpec::new(&[0x70, 0x7C]).args(1).primitive(83));
        // ^aMessage
        builder.define_method(undefined, "doesNotUnderstand:", MethodSpec::new(&[0x10, 0x7C]).args(1));
        builder.symbol("frobnicate");
        let mut interp = boot(builder);

        let perform = symbol(&interp, "perform:");
        let frobnicate = symbol(&interp, "frobnicate");
        let message = interp.evaluate(NIL_PTR, perform, &[frobnicate]).unwrap();

        let memory = interp.memory();
        assert_eq!(memory.get_class_of(message), memory.special(CLASS_MESSAGE));
        assert_eq!(memory.get_ptr(message, MESSAGE_SELECTOR_INDEX), frobnicate);
        let args = memory.get_ptr(message, MESSAGE_ARGUMENTS_INDEX);
        assert_eq!(memory.get_class_of(args), memory.special(CLASS_ARRAY));
        assert_eq!(memory.slot_count(args), 0);
        assert_eq!(memory.get_ptr(message, MESSAGE_LOOKUP_CLASS_INDEX), memory.get_class_of(NIL_PTR));
    }
}

#[test]
fn non_local_return_from_dead_home_sends_cannot_return() {
    let mut builder = MemoryBuilder::new(MemoryKind::V3);
    let object = builder.class_named("Object");
    let undefined = builder.class_named("UndefinedObject");
    let closure = builder.class_named("BlockClosure");
    builder.define_method(closure, "value", MethodSpec::new(&[0x70, 0x7C]).primitive(201));
    // ^{self. value}
    builder.define_method(
        object,
        "cannotReturn:",
        MethodSpec::new(&[0x70, 0x10, 0x8A, 0x82, 0x7C]).args(1),
    );
    // [^2], answered by a block return so the home context dies normally
    builder.define_method(
        undefined,
        "makeBlock",
        MethodSpec::new(&[0x8F, 0x00, 0x00, 0x02, 0x77, 0x7C, 0x7D]),
    );
    let make_block = builder.symbol("makeBlock");
    // ^self makeBlock value
    builder.define_method(
        undefined,
        "escape",
        MethodSpec::new(&[0x70, 0xD0, 0xC9, 0x7C]).literals(vec![make_block]),
    );
    let mut interp = boot(builder);

    let escape = symbol(&interp, "escape");
    let answer = interp.evaluate(NIL_PTR, escape, &[]).unwrap();
    let memory = interp.memory();
    assert_eq!(memory.slot_count(answer), 2);
    let block_context = memory.get_ptr(answer, 0);
    assert_eq!(memory.get_class_of(block_context), memory.special(CLASS_METHOD_CONTEXT));
    let closure = memory.get_ptr(block_context, CONTEXT_CLOSURE_INDEX);
    assert_eq!(memory.get_class_of(closure), memory.special(CLASS_BLOCK_CLOSURE));
    assert_eq!(memory.get_ptr(answer, 1), OOP::Int(2));
}

#[test]
fn non_local_return_through_unwind_marked_context_sends_about_to_return() {
    let mut builder = MemoryBuilder::new(MemoryKind::V3);
    let object = builder.class_named("Object");
    let undefined = builder.class_named("UndefinedObject");
    let closure = builder.class_named("BlockClosure");
    builder.define_method(closure, "value", MethodSpec::new(&[0x70, 0x7C]).primitive(201));
    // ^aBlock value, marked for unwinding
    builder.define_method(
        object,
        "protect:",
        MethodSpec::new(&[0x10, 0xC9, 0x7C]).args(1).primitive(198),
    );
    // ^{result. aContext}
    builder.define_method(
        object,
        "aboutToReturn:through:",
        MethodSpec::new(&[0x10, 0x11, 0x8A, 0x82, 0x7C]).args(2),
    );
    let protect = builder.symbol("protect:");
    // ^self protect: [^2]; the block answers whatever aboutToReturn:through: gave back
    builder.define_method(
        undefined,
        "escape",
        MethodSpec::new(&[0x70, 0x8F, 0x00, 0x00, 0x03, 0x77, 0x7C, 0x7D, 0xE0, 0x7C])
            .literals(vec![protect]),
    );
    let mut interp = boot(builder);

    let escape = symbol(&interp, "escape");
    let answer = interp.evaluate(NIL_PTR, escape, &[]).unwrap();
    let memory = interp.memory();
    assert_eq!(memory.slot_count(answer), 2);
    assert_eq!(memory.get_ptr(answer, 0), OOP::Int(2));
    let marked = memory.get_ptr(answer, 1);
    assert_eq!(memory.get_class_of(marked), memory.special(CLASS_METHOD_CONTEXT));
    let method = memory.get_ptr(marked, CONTEXT_METHOD_INDEX);
    assert_eq!(memory.method_header(method).unwrap().primitive, 198);
}

#[test]
fn sista_methods_send_branch_and_return() {
    let mut builder = MemoryBuilder::new(MemoryKind::Spur);
    let object = builder.class_named("Object");
    let undefined = builder.class_named("UndefinedObject");
    // ^x + x
    builder.define_method(object, "twice:", MethodSpec::new(&[0x40, 0x40, 0x60, 0x5C]).args(1).sista());
    let twice = builder.symbol("twice:");
    // x = 0 ifTrue: [^1]. ^self twice: x
    builder.define_method(
        undefined,
        "choose:",
        MethodSpec::new(&[0x40, 0x50, 0x66, 0xC1, 0x51, 0x5C, 0x4C, 0x40, 0x90, 0x5C])
            .args(1)
            .literals(vec![twice])
            .sista(),
    );
    let mut interp = boot(builder);

    let choose = symbol(&interp, "choose:");
    assert_eq!(interp.evaluate(NIL_PTR, choose, &[OOP::Int(0)]).unwrap(), OOP::Int(1));
    assert_eq!(interp.evaluate(NIL_PTR, choose, &[OOP::Int(5)]).unwrap(), OOP::Int(10));
    assert_eq!(interp.evaluate(NIL_PTR, choose, &[OOP::Int(-7)]).unwrap(), OOP::Int(-14));
}

#[test]
fn become_swaps_references_and_self_become_changes_nothing() {
    for &kind in &KINDS {
        let mut builder = MemoryBuilder::new(kind);
        let object = builder.class_named("Object");
        builder.define_method(
            object,
            "elementsExchangeIdentityWith:",
            MethodSpec::new(&[0x70, 0x7C]).args(1).primitive(128),
        );
        let mut interp = boot(builder);
        let exchange = symbol(&interp, "elementsExchangeIdentityWith:");

        let memory = interp.memory_mut();
        let left = memory.new_string("left");
        let right = memory.new_string("right");
        let holder = memory.new_array(vec![left]);
        let from = memory.new_array(vec![left]);
        let to = memory.new_array(vec![right]);
        interp.evaluate(from, exchange, &[to]).unwrap();
        let memory = interp.memory();
        assert_eq!(memory.string_of(memory.get_ptr(holder, 0)), "right");

        let memory = interp.memory_mut();
        let held = memory.get_ptr(holder, 0);
        let hash = memory.identity_hash(held);
        let same = memory.new_array(vec![held]);
        let also_same = memory.new_array(vec![held]);
        interp.evaluate(same, exchange, &[also_same]).unwrap();
        let memory = interp.memory_mut();
        assert_eq!(memory.get_ptr(holder, 0), held);
        assert_eq!(memory.identity_hash(held), hash);
        assert_eq!(memory.string_of(held), "right");
    }
}

/// `build: n` answers the list {n. {n - 1. ... {1. nil}}}.
fn list_builder(config: VmConfig) -> (Interpreter, OOP) {
    let mut builder = MemoryBuilder::new(MemoryKind::V3);
    let undefined = builder.class_named("UndefinedObject");
    let build = builder.symbol("build:");
    builder.define_method(
        undefined,
        "build:",
        MethodSpec::new(&[
            0x10, 0x75, 0xB6, 0x99, // n = 0 ifFalse: skip
            0x73, 0x7C, // ^nil
            0x10, 0x70, 0x10, 0x76, 0xB1, 0xE0, // n, (self build: n - 1)
            0x8A, 0x82, 0x7C, // ^{...}
        ])
        .args(1)
        .literals(vec![build]),
    );
    let interp = Interpreter::boot(builder.build(), config).unwrap();
    (interp, build)
}

fn list_values(interp: &Interpreter, mut list: OOP) -> Vec<OOP> {
    let mut values = Vec::new();
    while !list.is_nil() {
        values.push(interp.memory().get_ptr(list, 0));
        list = interp.memory().get_ptr(list, 1);
    }
    values
}

#[test]
fn collections_are_not_observable() {
    let (mut quiet, build) = list_builder(VmConfig::default());
    let expected = quiet.evaluate(NIL_PTR, build, &[OOP::Int(300)]).unwrap();
    let expected = list_values(&quiet, expected);
    assert_eq!(expected.len(), 300);
    assert_eq!(expected[0], OOP::Int(300));
    assert_eq!(quiet.memory().stats().partial_gcs, 0);

    let (mut busy, build) = list_builder(VmConfig {
        young_space_limit: 512,
        tenure_threshold: 16,
        jit_threshold: 10,
        ..VmConfig::default()
    });
    let result = busy.evaluate(NIL_PTR, build, &[OOP::Int(300)]).unwrap();
    assert_eq!(list_values(&busy, result), expected);
    assert!(busy.memory().stats().partial_gcs > 0);
    assert!(busy.memory().stats().full_gcs > 0);
}

#[test]
fn lookup_is_deterministic_and_honors_nil_dictionaries() {
    for &kind in &KINDS {
        let mut builder = MemoryBuilder::new(kind);
        let object = builder.class_named("Object");
        let base = builder.define_class("Base", object, ClassFormat::new(0, FMT_EMPTY));
        let derived = builder.define_class("Derived", base, ClassFormat::new(0, FMT_EMPTY));
        let hollow = builder.define_class("Hollow", base, ClassFormat::new(0, FMT_EMPTY));
        builder.define_method(base, "answer", MethodSpec::new(&[0x76, 0x7C]));
        builder.define_method(derived, "answer", MethodSpec::new(&[0x77, 0x7C]));
        builder.define_method(base, "cannotInterpret:", MethodSpec::new(&[0x10, 0x7C]).args(1));
        builder.symbol("missing");
        let mut interp = boot(builder);
        let answer = symbol(&interp, "answer");
        let missing = symbol(&interp, "missing");

        let memory = interp.memory_mut();
        let base_instance = memory.instantiate_class(base, 0).unwrap();
        let derived_instance = memory.instantiate_class(derived, 0).unwrap();
        let hollow_instance = memory.instantiate_class(hollow, 0).unwrap();
        memory.put_ptr(hollow, CLASS_MESSAGE_DICT_INDEX, NIL_PTR);

        for _ in 0..3 {
            assert_eq!(interp.evaluate(base_instance, answer, &[]).unwrap(), OOP::Int(1));
            assert_eq!(interp.evaluate(derived_instance, answer, &[]).unwrap(), OOP::Int(2));
        }

        let message = interp.evaluate(hollow_instance, answer, &[]).unwrap();
        let memory = interp.memory();
        assert_eq!(memory.get_ptr(message, MESSAGE_SELECTOR_INDEX), answer);
        assert_eq!(memory.get_ptr(message, MESSAGE_LOOKUP_CLASS_INDEX), hollow);

        // nothing in the chain understands doesNotUnderstand:
        match interp.evaluate(base_instance, missing, &[]) {
            Err(VmError::RecursiveDoesNotUnderstand(class)) => assert_eq!(class, "Base"),
            other => panic!("expected a recursive doesNotUnderstand:, got {:?}", other),
        }
    }
}

#[test]
fn signals_are_banked_until_waited_for() {
    let mut builder = MemoryBuilder::new(MemoryKind::V3);
    let semaphore_class = builder.class_named("Semaphore");
    builder.define_method(semaphore_class, "signal", MethodSpec::new(&[0x70, 0x7C]).primitive(85));
    builder.define_method(semaphore_class, "wait", MethodSpec::new(&[0x70, 0x7C]).primitive(86));
    let mut interp = boot(builder);
    let signal = symbol(&interp, "signal");
    let wait = symbol(&interp, "wait");

    let semaphore = interp
        .memory_mut()
        .new_pointers(semaphore_class, FMT_FIXED, vec![NIL_PTR, NIL_PTR, OOP::Int(0)]);
    for _ in 0..2 {
        assert_eq!(interp.evaluate(semaphore, signal, &[]).unwrap(), semaphore);
    }
    let excess = |interp: &Interpreter| interp.memory().get_ptr(semaphore, SEMAPHORE_EXCESS_SIGNALS_INDEX);
    assert_eq!(excess(&interp), OOP::Int(2));
    assert_eq!(interp.evaluate(semaphore, wait, &[]).unwrap(), semaphore);
    assert_eq!(excess(&interp), OOP::Int(1));
}

#[test]
fn snapshots_boot_again() {
    for &kind in &KINDS {
        let path = std::env::temp_dir().join(format!(
            "stvm-scenario-{:?}-{}.image",
            kind,
            std::process::id()
        ));
        let memory = MemoryBuilder::new(kind).build();
        let count = memory.object_count();
        save_image(&path, &memory).unwrap();

        let mut interp = Interpreter::load(&path, VmConfig::default()).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(interp.memory().kind(), kind);
        assert_eq!(interp.memory().object_count(), count);
        assert_eq!(interp.config().image_name, path);

        let plus = interp.memory().get_ptr(interp.memory().special(SPECIAL_SELECTORS), 0);
        assert_eq!(interp.evaluate(OOP::Int(3), plus, &[OOP::Int(4)]).unwrap(), OOP::Int(7));
    }
}

#[test]
fn small_integer_overflow_promotes() {
    let mut interp = boot(MemoryBuilder::new(MemoryKind::Spur));
    let selectors = interp.memory().special(SPECIAL_SELECTORS);
    let plus = interp.memory().get_ptr(selectors, 0);
    let times = interp.memory().get_ptr(selectors, 16);

    let sum = interp
        .evaluate(OOP::Int(0x3FFF_FFFF), plus, &[OOP::Int(1)])
        .unwrap();
    let memory = interp.memory();
    assert_eq!(memory.get_class_of(sum), memory.special(CLASS_LARGE_POSITIVE_INTEGER));
    assert_eq!(memory.bytes(sum), &[0, 0, 0, 0x40]);

    let product = interp
        .evaluate(OOP::Int(-0x4000_0000), times, &[OOP::Int(2)])
        .unwrap();
    let memory = interp.memory();
    assert_eq!(memory.get_class_of(product), memory.special(CLASS_LARGE_NEGATIVE_INTEGER));
    assert_eq!(memory.bytes(product), &[0, 0, 0, 0x80]);
}
