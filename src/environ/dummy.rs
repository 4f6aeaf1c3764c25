//! A `HostEnviron` test double: an in-memory symbol table standing in for a
//! real Lisp runtime's, so the translator core can be exercised without
//! linking one.

use std::collections::HashMap;

use crate::environ::spec::{HostEnviron, PrimitiveArity, SubrHandle};
use crate::error::CompileResult;

pub struct DummyHostEnviron {
    current_function_name: String,
    primitives: HashMap<String, SubrHandle>,
    pub registered: Vec<(String, PrimitiveArity, usize)>,
    pub timer_block_depth: i32,
}

impl DummyHostEnviron {
    pub fn new(current_function_name: impl Into<String>) -> Self {
        DummyHostEnviron {
            current_function_name: current_function_name.into(),
            primitives: HashMap::new(),
            registered: Vec::new(),
            timer_block_depth: 0,
        }
    }

    /// Declares `symbol_name` as bound to a fixed-arity primitive, for
    /// tests exercising the call-site specialization's second branch.
    pub fn declare_primitive(
        &mut self,
        symbol_name: impl Into<String>,
        c_function_name: impl Into<String>,
        arity: u8,
    ) {
        self.primitives.insert(
            symbol_name.into(),
            SubrHandle {
                c_function_name: c_function_name.into(),
                arity: PrimitiveArity::Fixed(arity),
            },
        );
    }
}

impl HostEnviron for DummyHostEnviron {
    fn current_function_name(&self) -> &str {
        &self.current_function_name
    }

    fn lookup_fixed_arity_primitive(&self, symbol_name: &str) -> Option<SubrHandle> {
        self.primitives.get(symbol_name).cloned()
    }

    fn register_compiled_subr(
        &mut self,
        name: &str,
        arity: PrimitiveArity,
        native_code: *const (),
    ) -> CompileResult<()> {
        self.registered.push((name.to_string(), arity, native_code as usize));
        Ok(())
    }

    fn block_async_timers(&mut self) {
        self.timer_block_depth += 1;
    }

    fn unblock_async_timers(&mut self) {
        self.timer_block_depth -= 1;
    }
}
