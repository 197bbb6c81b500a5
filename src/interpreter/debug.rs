use std::borrow::Cow;

use log::warn;

use super::Interpreter;
use crate::objectmemory::specials::*;
use crate::objectmemory::{FALSE_PTR, NIL_PTR, OOP, TRUE_PTR};

impl Interpreter {
    pub fn class_name(&self, class: OOP) -> Cow<str> {
        let name = self.memory.get_ptr(class, CLASS_NAME_INDEX);
        if self.memory.is_bytes(name) {
            return self.memory.string_of(name);
        }
        // metaclasses have no name of their own
        let this_class = self.memory.get_ptr(class, METACLASS_THIS_CLASS_INDEX);
        if this_class.is_object() && this_class != class && self.is_behavior(this_class) {
            let name = self.memory.get_ptr(this_class, CLASS_NAME_INDEX);
            if self.memory.is_bytes(name) {
                return Cow::Owned(format!("{} class", self.memory.string_of(name)));
            }
        }
        Cow::Borrowed("???")
    }

    pub fn obj_name(&self, obj: OOP) -> String {
        match obj {
            OOP::Int(value) => return value.to_string(),
            OOP::Char(value) => return format!("{:?}", std::char::from_u32(value).unwrap_or('?')),
            NIL_PTR => return "nil".to_string(),
            TRUE_PTR => return "true".to_string(),
            FALSE_PTR => return "false".to_string(),
            OOP::Object(_) => {}
        }
        if !self.memory.get_obj(obj).is_some() {
            return format!("<dead {:?}>", obj);
        }
        let class = self.memory.get_class_of(obj);
        let symbol_class = self
            .memory
            .get_class_of(self.memory.special(SELECTOR_DOES_NOT_UNDERSTAND));
        let name = if class == symbol_class {
            format!("#{}", self.memory.string_of(obj))
        } else if class == self.memory.special(CLASS_STRING) {
            format!("{:?}", self.memory.string_of(obj))
        } else if let Some(value) = self.memory.float_value(obj) {
            value.to_string()
        } else if class == self.memory.special(CLASS_LARGE_POSITIVE_INTEGER)
            || class == self.memory.special(CLASS_LARGE_NEGATIVE_INTEGER)
        {
            let sign = if class == self.memory.special(CLASS_LARGE_NEGATIVE_INTEGER) {
                "-"
            } else {
                ""
            };
            let digits: String = self
                .memory
                .bytes(obj)
                .iter()
                .rev()
                .map(|digit| format!("{:02x}", digit))
                .collect();
            format!("{}16r{}", sign, digits)
        } else if class == self.memory.special(CLASS_POINT) {
            let x = self.memory.get_ptr(obj, POINT_X_INDEX);
            let y = self.memory.get_ptr(obj, POINT_Y_INDEX);
            format!("({} @ {})", self.obj_name(x), self.obj_name(y))
        } else if self.is_behavior(obj) {
            self.class_name(obj).into_owned()
        } else {
            format!("a{}", self.class_name(class))
        };
        format!("{}({:?})", name, obj)
    }

    /// The pending send, receiver first.
    pub fn print_methodcall(&self) -> String {
        let receiver = self.stack_value(self.argument_count);
        let mut result = format!(
            "{} {}",
            self.obj_name(receiver),
            self.memory.string_of(self.message_selector)
        );
        for i in 0..self.argument_count {
            let arg = self.stack_value(self.argument_count - i - 1);
            result += &format!(" {}", self.obj_name(arg));
        }
        result
    }

    /// Log the active sender chain.
    pub(crate) fn backtrace(&self) {
        let mut context = self.active_context;
        let mut depth = 0;
        while !context.is_nil() && depth < 256 {
            let (marker, home) = if self.is_block_context(context) {
                (" [block]", self.memory.get_ptr(context, BLOCK_HOME_INDEX))
            } else if !self.memory.get_ptr(context, CONTEXT_CLOSURE_INDEX).is_nil() {
                (" [closure]", context)
            } else {
                ("", context)
            };
            let method = self.memory.get_ptr(home, CONTEXT_METHOD_INDEX);
            let receiver = self.memory.get_ptr(home, CONTEXT_RECEIVER_INDEX);
            let selector = self
                .memory
                .method_header(method)
                .and_then(|header| self.memory.fetch_pointer(method, header.num_literals.checked_sub(1)?))
                .map(|selector| self.memory.string_of(selector).into_owned())
                .unwrap_or_default();
            let pc = self.memory.get_ptr(context, CONTEXT_PC_INDEX);
            warn!(
                "\t{}>>{} @ {}{}",
                self.class_name(self.memory.get_class_of(receiver)),
                selector,
                self.obj_name(pc),
                marker
            );
            context = self.memory.get_ptr(context, CONTEXT_SENDER_INDEX);
            depth += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::VmConfig;
    use crate::interpreter::Interpreter;
    use crate::objectmemory::builder::MemoryBuilder;
    use crate::objectmemory::{MemoryKind, NIL_PTR, OOP};

    #[test]
    fn names_for_common_objects() {
        let mut builder = MemoryBuilder::new(MemoryKind::V3);
        let symbol = builder.symbol("foo:");
        let object_class = builder.class_named("Object");
        let mut interp = Interpreter::boot(builder.build(), VmConfig::default()).unwrap();
        let string = interp.memory.new_string("hi");

        assert_eq!(interp.obj_name(OOP::Int(-3)), "-3");
        assert_eq!(interp.obj_name(NIL_PTR), "nil");
        assert!(interp.obj_name(symbol).starts_with("#foo:("));
        assert!(interp.obj_name(string).starts_with("\"hi\"("));
        assert_eq!(interp.class_name(object_class), "Object");
        assert!(interp.obj_name(object_class).starts_with("Object("));
    }
}
