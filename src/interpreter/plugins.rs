//! Named primitives: modules looked up by name from a method's first literal, and the narrow
//! interface they see of the interpreter.

use std::collections::HashMap;

use log::debug;

use super::primitives::{PRIM_ERR_BAD_ARGUMENT, PRIM_ERR_GENERIC, PRIM_ERR_UNSUPPORTED};
use super::Interpreter;
use crate::objectmemory::specials::*;
use crate::objectmemory::{ObjectMemory, NIL_PTR, OOP};

mod large_integers;

pub use self::large_integers::LargeIntegers;

/// A primitive provided by a module. Failure is `None`, optionally after
/// [`InterpreterProxy::primitive_fail_for`].
pub type NamedPrimitive = fn(&mut InterpreterProxy) -> Option<()>;

pub trait PluginModule {
    fn name(&self) -> &str;
    fn primitive(&self, name: &str) -> Option<NamedPrimitive>;
}

pub struct ModuleRegistry {
    modules: HashMap<String, Box<dyn PluginModule>>,
}

impl ModuleRegistry {
    /// A registry with no modules at all.
    pub fn empty() -> Self {
        ModuleRegistry {
            modules: HashMap::new(),
        }
    }

    pub fn register(&mut self, module: Box<dyn PluginModule>) {
        self.modules.insert(module.name().to_string(), module);
    }

    pub fn lookup(&self, module: &str, name: &str) -> Option<NamedPrimitive> {
        self.modules.get(module)?.primitive(name)
    }
}

impl Default for ModuleRegistry {
    /// The built-in modules.
    fn default() -> Self {
        let mut registry = ModuleRegistry::empty();
        registry.register(Box::new(LargeIntegers));
        registry
    }
}

/// What a module primitive may do to the running interpreter: read and replace its
/// arguments, allocate, and signal semaphores.
pub struct InterpreterProxy<'a> {
    vm: &'a mut Interpreter,
    failed: bool,
}

impl<'a> InterpreterProxy<'a> {
    fn new(vm: &'a mut Interpreter) -> Self {
        InterpreterProxy { vm, failed: false }
    }

    pub fn memory(&self) -> &ObjectMemory {
        &self.vm.memory
    }

    pub fn memory_mut(&mut self) -> &mut ObjectMemory {
        &mut self.vm.memory
    }

    pub fn method_argument_count(&self) -> usize {
        self.vm.argument_count
    }

    pub fn stack_value(&self, offset: usize) -> OOP {
        self.vm.stack_value(offset)
    }

    pub fn stack_integer_value(&mut self, offset: usize) -> Option<i64> {
        match self.vm.stack_value(offset).try_as_integer() {
            Some(value) => Some(value),
            None => self.primitive_fail_for(PRIM_ERR_BAD_ARGUMENT),
        }
    }

    pub fn pop(&mut self, count: usize) {
        self.vm.popn(count);
    }

    pub fn push(&mut self, oop: OOP) {
        self.vm.push(oop);
    }

    pub fn pop_then_push(&mut self, count: usize, oop: OOP) {
        self.vm.pop_then_push(count, oop);
    }

    pub fn push_integer(&mut self, value: i64) {
        let oop = self.vm.integer_oop(value);
        self.vm.push(oop);
    }

    pub fn push_bool(&mut self, value: bool) {
        self.vm.push(Interpreter::bool_oop(value));
    }

    pub fn is_bytes(&self, oop: OOP) -> bool {
        self.vm.memory.is_bytes(oop)
    }

    pub fn bytes(&self, oop: OOP) -> &[u8] {
        self.vm.memory.bytes(oop)
    }

    pub fn bytes_mut(&mut self, oop: OOP) -> Option<&mut Vec<u8>> {
        self.vm.memory.bytes_mut(oop)
    }

    pub fn fetch_class_of(&self, oop: OOP) -> OOP {
        self.vm.memory.get_class_of(oop)
    }

    pub fn class_large_positive_integer(&self) -> OOP {
        self.vm.memory.special(CLASS_LARGE_POSITIVE_INTEGER)
    }

    pub fn class_large_negative_integer(&self) -> OOP {
        self.vm.memory.special(CLASS_LARGE_NEGATIVE_INTEGER)
    }

    pub fn class_array(&self) -> OOP {
        self.vm.memory.special(CLASS_ARRAY)
    }

    /// Allocate, collecting once if the heap is full. Objects the primitive made earlier
    /// must be on the remappable stack or the operand stack to survive.
    pub fn instantiate_class(&mut self, class: OOP, size: usize) -> Option<OOP> {
        match self.vm.instantiate_or_gc(class, size) {
            Some(oop) => Some(oop),
            None => {
                self.failed = true;
                None
            }
        }
    }

    pub fn store_pointer(&mut self, object: OOP, index: usize, value: OOP) -> Option<()> {
        self.vm.memory.store_pointer(object, index, value)
    }

    pub fn push_remappable_oop(&mut self, oop: OOP) {
        self.vm.remappable.push(oop);
    }

    pub fn pop_remappable_oop(&mut self) -> OOP {
        self.vm.remappable.pop().unwrap_or(NIL_PTR)
    }

    pub fn primitive_fail<T>(&mut self) -> Option<T> {
        self.primitive_fail_for(PRIM_ERR_GENERIC)
    }

    pub fn primitive_fail_for<T>(&mut self, code: u32) -> Option<T> {
        self.failed = true;
        self.vm.fail(code)
    }

    pub fn failed(&self) -> bool {
        self.failed
    }

    pub fn signal_semaphore_with_index(&mut self, index: usize) {
        self.vm.signal_semaphore_with_index(index);
    }
}

impl Interpreter {
    /// Make a module's primitives available to methods naming it.
    pub fn register_module(&mut self, module: Box<dyn PluginModule>) {
        debug!("registered module {}", module.name());
        self.modules.register(module);
        self.named_primitives.clear();
    }

    /// The module and function a named-primitive method declares in its first literal.
    fn named_primitive_target(&self, method: OOP) -> Option<(String, String)> {
        let spec = self.memory.fetch_pointer(method, 1)?;
        if self.memory.slot_count(spec) < 2 {
            return None;
        }
        let module = self.memory.string_of(self.memory.get_ptr(spec, 0));
        let function = self.memory.string_of(self.memory.get_ptr(spec, 1));
        Some((module.into_owned(), function.into_owned()))
    }

    fn resolve_named_primitive(&mut self, method: OOP) -> Option<NamedPrimitive> {
        let id = method.as_oid()?;
        if let Some(&cached) = self.named_primitives.get(&id) {
            return cached;
        }
        let resolved = self
            .named_primitive_target(method)
            .and_then(|(module, function)| {
                let found = self.modules.lookup(&module, &function);
                debug!(
                    "named primitive {}>>{} {}",
                    module,
                    function,
                    if found.is_some() { "resolved" } else { "not found" }
                );
                found
            });
        self.named_primitives.insert(id, resolved);
        resolved
    }

    pub(super) fn prim_external_call(&mut self) -> Option<()> {
        let primitive = match self.resolve_named_primitive(self.new_method) {
            Some(primitive) => primitive,
            None => return self.fail(PRIM_ERR_UNSUPPORTED),
        };
        let mut proxy = InterpreterProxy::new(self);
        let result = primitive(&mut proxy);
        if proxy.failed() {
            return None;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VmConfig;
    use crate::objectmemory::builder::{MemoryBuilder, MethodSpec};
    use crate::objectmemory::MemoryKind;

    struct Echo;

    fn answer_seven(proxy: &mut InterpreterProxy) -> Option<()> {
        let argc = proxy.method_argument_count();
        proxy.pop(argc + 1);
        proxy.push_integer(7);
        Some(())
    }

    impl PluginModule for Echo {
        fn name(&self) -> &str {
            "Echo"
        }

        fn primitive(&self, name: &str) -> Option<NamedPrimitive> {
            match name {
                "seven" => Some(answer_seven),
                _ => None,
            }
        }
    }

    fn named_method(builder: &mut MemoryBuilder, module: &str, function: &str) -> OOP {
        let module = builder.memory().new_string(module);
        let function = builder.memory().new_string(function);
        let spec = builder
            .memory()
            .new_array(vec![module, function, OOP::Int(0), OOP::Int(0)]);
        // primitive body falls through to ^nil
        let object = builder.class_named("Object");
        builder.define_method(
            object,
            "named",
            MethodSpec::new(&[0x7B]).primitive(117).literals(vec![spec]),
        )
    }

    #[test]
    fn module_primitives_resolve_and_cache() {
        let mut builder = MemoryBuilder::new(MemoryKind::Spur);
        let found = named_method(&mut builder, "Echo", "seven");
        let missing = named_method(&mut builder, "Echo", "eight");
        let mut interp = Interpreter::boot(builder.build(), VmConfig::default()).unwrap();
        interp.register_module(Box::new(Echo));

        interp.push(NIL_PTR);
        interp.argument_count = 0;
        interp.new_method = found;
        assert!(interp.prim_external_call().is_some());
        assert_eq!(interp.pop(), OOP::Int(7));

        interp.push(NIL_PTR);
        interp.new_method = missing;
        assert!(interp.prim_external_call().is_none());
        assert_eq!(interp.prim_fail_code, PRIM_ERR_UNSUPPORTED);
        assert_eq!(interp.named_primitives.len(), 2);
    }
}
