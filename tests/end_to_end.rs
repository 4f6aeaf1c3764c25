//! End-to-end scenarios: real bytecode, a real `gccjit` backend, and a real
//! JIT-compiled native function invoked through a raw function pointer.
//!
//! Host primitives the emitted code calls (`compiled_function_constant`,
//! `add1`, `Fcons`, `arithcompare`, `host_double`, `funcall`) are defined
//! below as `#[no_mangle] extern "C" fn`s in this test binary itself, so
//! libgccjit's JIT resolves them against the running process the same way
//! it would resolve a real host's primitives linked into the same image.
//!
//! All scenarios run from a single `#[test]` function: [`driver::compile_function`]
//! guards against concurrent compilation with a process-wide reentrancy
//! flag, and cargo runs separate `#[test]` functions in parallel threads by
//! default, so keeping every call sequential here avoids spurious
//! "already compiling" failures that would have nothing to do with the
//! behavior under test.

use std::os::raw::c_long;

use lispbc_native::driver::{compile_function, CompileOptions, HostLayout};
use lispbc_native::environ::DummyHostEnviron;
use lispbc_native::{ArgTemplate, CompiledFunctionObject, Constant};

/// `(n << INTTYPEBITS) + INT0_TAG`, reproduced here rather than imported
/// since the tag-bit constants are an internal implementation detail, not
/// part of the crate's public surface.
fn pack(n: i64) -> i64 {
    n << 2
}

fn layout() -> HostLayout {
    HostLayout {
        jmp_buf_bytes: 200,
        thread_state_leading_padding: 64,
        pure_base: 0,
        pure_size: 0,
        nil_value: 0,
        t_value: pack(1),
    }
}

static CONSTANT_TABLE: [i64; 2] = [444, 888];

#[no_mangle]
extern "C" fn compiled_function_constant(index: c_long) -> i64 {
    CONSTANT_TABLE[index as usize]
}

#[no_mangle]
extern "C" fn add1(v: i64) -> i64 {
    pack((v >> 2) + 1)
}

#[no_mangle]
extern "C" fn Fcons(car: i64, cdr: i64) -> i64 {
    car.wrapping_add(cdr).wrapping_add(1)
}

#[no_mangle]
extern "C" fn arithcompare(a: i64, b: i64, kind: i32) -> i64 {
    let lhs = a >> 2;
    let rhs = b >> 2;
    let ok = match kind {
        0 => lhs == rhs,
        1 => lhs > rhs,
        2 => lhs < rhs,
        3 => lhs <= rhs,
        4 => lhs >= rhs,
        _ => false,
    };
    if ok {
        pack(1)
    } else {
        0
    }
}

#[no_mangle]
extern "C" fn host_double(v: i64) -> i64 {
    pack((v >> 2) * 2)
}

#[no_mangle]
extern "C" fn funcall(nargs: c_long, args: *const i64) -> i64 {
    let slice = unsafe { std::slice::from_raw_parts(args, nargs as usize) };
    // slice[0] is the function slot, slice[1..] the positional arguments.
    pack((slice[1] >> 2) * 10)
}

unsafe fn call0(ptr: *const ()) -> i64 {
    let f: extern "C" fn() -> i64 = std::mem::transmute(ptr);
    f()
}

unsafe fn call1(ptr: *const (), a: i64) -> i64 {
    let f: extern "C" fn(i64) -> i64 = std::mem::transmute(ptr);
    f(a)
}

#[test]
fn end_to_end_scenarios() {
    let _ = env_logger::try_init();

    // Scenario 1: `constant 0 ; return` -- the simplest possible function,
    // exercising the full driver pipeline (prologue, block discovery with a
    // single leader, the constant load's host call, the return terminator)
    // without any arithmetic.
    {
        let obj = CompiledFunctionObject::new(
            "const_return_fn",
            vec![0x60, 0x00, 0x4e],
            vec![Constant::Opaque],
            1,
            ArgTemplate { mandatory: 0, nonrest: 0 },
        )
        .unwrap();
        let mut environ = DummyHostEnviron::new("const_return_fn");
        let native = compile_function(&obj, &layout(), &mut environ, &CompileOptions::default()).unwrap();
        assert_eq!(unsafe { call0(native.native_code) }, CONSTANT_TABLE[0]);
        assert_eq!(environ.registered.len(), 1);
        assert_eq!(environ.timer_block_depth, 0, "timer guard must unblock on every exit path");
    }

    // Scenario 2: `constant 0 ; add1 ; return`, with the constant value
    // comfortably inside fixnum range -- the fast inline increment path
    // should fire without ever calling the declared `add1` slow-path shim.
    {
        let obj = CompiledFunctionObject::new(
            "add1_fast_path_fn",
            vec![0x60, 0x00, 0x34, 0x4e],
            vec![Constant::Opaque],
            1,
            ArgTemplate { mandatory: 0, nonrest: 0 },
        )
        .unwrap();
        let mut environ = DummyHostEnviron::new("add1_fast_path_fn");
        let native = compile_function(&obj, &layout(), &mut environ, &CompileOptions::default()).unwrap();
        let result = unsafe { call0(native.native_code) };
        assert_eq!(result >> 2, (CONSTANT_TABLE[0] >> 2) + 1);
    }

    // Scenario 3: `BRgoto +3 ; constant 0 ; return ; constant 1 ; return`.
    // The branch must land exactly on the second constant/return pair,
    // proving block discovery and the emitter agree on relative-branch
    // arithmetic -- the first constant/return pair is dead code that still
    // has to compile (every discovered block needs a terminator) but must
    // never execute.
    {
        let bytecode = vec![0x49, 131, 0x60, 0x00, 0x4e, 0x60, 0x01, 0x4e];
        let obj = CompiledFunctionObject::new(
            "brgoto_fn",
            bytecode,
            vec![Constant::Opaque, Constant::Opaque],
            1,
            ArgTemplate { mandatory: 0, nonrest: 0 },
        )
        .unwrap();
        let mut environ = DummyHostEnviron::new("brgoto_fn");
        let native = compile_function(&obj, &layout(), &mut environ, &CompileOptions::default()).unwrap();
        assert_eq!(unsafe { call0(native.native_code) }, CONSTANT_TABLE[1]);
    }

    // Scenario 4: a function that calls itself by name (`constant 0` is a
    // symbol matching the function's own name, `constant 1` the argument,
    // `call1`, `return`). This exercises the call-site specialization's
    // direct-self-call branch at compile time only -- the bytecode is
    // unconditionally recursive, so actually invoking the result would
    // stack-overflow the test process.
    {
        let bytecode = vec![0x60, 0x00, 0x60, 0x01, 0x21, 0x4e];
        let obj = CompiledFunctionObject::new(
            "self_recursive_fn",
            bytecode,
            vec![
                Constant::Symbol("self_recursive_fn".to_string()),
                Constant::Opaque,
            ],
            2,
            ArgTemplate { mandatory: 1, nonrest: 1 },
        )
        .unwrap();
        let mut environ = DummyHostEnviron::new("self_recursive_fn");
        let native = compile_function(&obj, &layout(), &mut environ, &CompileOptions::default());
        assert!(native.is_ok(), "self-recursive function must compile: {:?}", native.err());
    }

    // Scenario 5: `constant 0 ; constant 1 ; <cons> ; return`, a flat
    // CASE_CALL_N primitive (index 23 in the table, base 0x64 => 0x7b),
    // checking both the byte encoding and that arguments reach the host's
    // `Fcons` in the right order.
    {
        let bytecode = vec![0x60, 0x00, 0x60, 0x01, 0x7b, 0x4e];
        let obj = CompiledFunctionObject::new(
            "cons_fn",
            bytecode,
            vec![Constant::Opaque, Constant::Opaque],
            2,
            ArgTemplate { mandatory: 0, nonrest: 0 },
        )
        .unwrap();
        let mut environ = DummyHostEnviron::new("cons_fn");
        let native = compile_function(&obj, &layout(), &mut environ, &CompileOptions::default()).unwrap();
        let result = unsafe { call0(native.native_code) };
        assert_eq!(result, CONSTANT_TABLE[0].wrapping_add(CONSTANT_TABLE[1]).wrapping_add(1));
    }

    // Scenario 6: calling a symbol known (via `HostEnviron`) to be bound to
    // a fixed-arity primitive dispatches directly to its C entry point
    // instead of falling back to `funcall`.
    {
        let bytecode = vec![0x60, 0x00, 0x60, 0x01, 0x21, 0x4e];
        let obj = CompiledFunctionObject::new(
            "calls_double_fn",
            bytecode,
            vec![Constant::Symbol("double".to_string()), Constant::Opaque],
            2,
            ArgTemplate { mandatory: 1, nonrest: 1 },
        )
        .unwrap();
        let mut environ = DummyHostEnviron::new("unrelated_current_function");
        environ.declare_primitive("double", "host_double", 1);
        let native = compile_function(&obj, &layout(), &mut environ, &CompileOptions::default()).unwrap();
        let result = unsafe { call1(native.native_code, 0) };
        assert_eq!(result >> 2, (CONSTANT_TABLE[1] >> 2) * 2);
    }

    // Scenario 7: calling a function value that is not a known constant
    // symbol falls back to the generic `funcall(nargs, args_base)` path.
    {
        let bytecode = vec![0x60, 0x00, 0x60, 0x01, 0x21, 0x4e];
        let obj = CompiledFunctionObject::new(
            "generic_call_fn",
            bytecode,
            vec![Constant::Opaque, Constant::Opaque],
            2,
            ArgTemplate { mandatory: 0, nonrest: 0 },
        )
        .unwrap();
        let mut environ = DummyHostEnviron::new("generic_call_fn");
        let native = compile_function(&obj, &layout(), &mut environ, &CompileOptions::default()).unwrap();
        let result = unsafe { call0(native.native_code) };
        assert_eq!(result >> 2, (CONSTANT_TABLE[1] >> 2) * 10);
    }

    // Scenario 8: `eqlsign` dispatches through the host `arithcompare` shim
    // with the right comparison-kind tag.
    {
        let bytecode = vec![0x60, 0x00, 0x60, 0x00, 0x36, 0x4e];
        let obj = CompiledFunctionObject::new(
            "eql_fn",
            bytecode,
            vec![Constant::Opaque],
            2,
            ArgTemplate { mandatory: 0, nonrest: 0 },
        )
        .unwrap();
        let mut environ = DummyHostEnviron::new("eql_fn");
        let native = compile_function(&obj, &layout(), &mut environ, &CompileOptions::default()).unwrap();
        assert_eq!(unsafe { call0(native.native_code) }, pack(1));
    }

    // Shape violations are caught before any codegen work begins.
    {
        let obj = CompiledFunctionObject::new(
            "too_many_args_fn",
            vec![0x4e],
            vec![],
            1,
            ArgTemplate { mandatory: 9, nonrest: 9 },
        )
        .unwrap();
        let mut environ = DummyHostEnviron::new("too_many_args_fn");
        let err = compile_function(&obj, &layout(), &mut environ, &CompileOptions::default()).unwrap_err();
        assert!(err.to_string().contains("exceeds the maximum"));
    }
    {
        let obj = CompiledFunctionObject::new(
            "zero_depth_fn",
            vec![0x4e],
            vec![],
            0,
            ArgTemplate { mandatory: 0, nonrest: 0 },
        )
        .unwrap();
        let mut environ = DummyHostEnviron::new("zero_depth_fn");
        let err = compile_function(&obj, &layout(), &mut environ, &CompileOptions::default()).unwrap_err();
        assert!(err.to_string().contains("at least one slot"));
    }

    // An unknown opcode byte is rejected by the shared decoder before any
    // backend work begins.
    {
        let obj = CompiledFunctionObject::new(
            "malformed_fn",
            vec![0xff],
            vec![],
            1,
            ArgTemplate { mandatory: 0, nonrest: 0 },
        )
        .unwrap();
        let mut environ = DummyHostEnviron::new("malformed_fn");
        let err = compile_function(&obj, &layout(), &mut environ, &CompileOptions::default()).unwrap_err();
        assert!(err.to_string().contains("unknown opcode"));
    }
}
