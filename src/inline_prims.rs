//! Always-inlined emitted helpers (component 3, SPEC_FULL.md §4.3), built
//! once per compilation unit and called from the opcode emitter.
//!
//! Grounded directly on `define_CAR_CDR`, `define_CHECK_TYPE`,
//! `define_CHECK_IMPURE`, `define_PSEUDOVECTORP`, and
//! `define_bool_to_lisp_obj` in the original source, plus `emit_XCAR`/
//! `emit_XCDR` for the cons-field access these inline into.

use gccjit::{BinaryOp, ComparisonOp, Function, FunctionType, RValue, ToRValue, Type};

use crate::abi::RuntimeAbi;
use crate::backend::Backend;
use crate::error::CompileResult;

/// Handles to the helper functions built by [`InlinePrimitives::build`].
/// Every field is a `gccjit::Function` with `FunctionType::AlwaysInline`,
/// matching the original's use of GCC's always-inline attribute for this
/// exact set of helpers.
pub struct InlinePrimitives {
    pub car: Function,
    pub cdr: Function,
    pub setcar: Function,
    pub setcdr: Function,
    pub check_type: Function,
    pub check_impure: Function,
    pub pseudovectorp: Function,
    pub bool_to_lisp_obj: Function,
}

impl InlinePrimitives {
    /// Builds all seven helpers. `nil`/`t` are the canonical false/true
    /// values as backend constants; `pure_base`/`pure_size` describe the
    /// host's pure (read-only) memory region for `CHECK_IMPURE`.
    pub fn build(
        backend: &mut Backend,
        abi: &RuntimeAbi,
        nil: RValue,
        t: RValue,
        pure_base: RValue,
        pure_size: RValue,
    ) -> CompileResult<Self> {
        let value_ty = backend.value_ty;
        let bool_ty = backend.ctx.new_type::<bool>();

        let car = Self::build_car_cdr(backend, abi, nil, value_ty, bool_ty, true)?;
        let cdr = Self::build_car_cdr(backend, abi, nil, value_ty, bool_ty, false)?;
        let check_type = Self::build_check_type(backend, value_ty, bool_ty)?;
        let check_impure =
            Self::build_check_impure(backend, value_ty, bool_ty, pure_base, pure_size)?;
        let pseudovectorp = Self::build_pseudovectorp(backend, value_ty, bool_ty)?;
        let bool_to_lisp_obj = Self::build_bool_to_lisp_obj(backend, value_ty, bool_ty, nil, t)?;
        let setcar =
            Self::build_setcar_setcdr(backend, abi, value_ty, bool_ty, check_type, check_impure, true)?;
        let setcdr =
            Self::build_setcar_setcdr(backend, abi, value_ty, bool_ty, check_type, check_impure, false)?;

        Ok(InlinePrimitives {
            car,
            cdr,
            setcar,
            setcdr,
            check_type,
            check_impure,
            pseudovectorp,
            bool_to_lisp_obj,
        })
    }

    /// `CAR(c)`/`CDR(c)`: `consp(c) ? xcar(c) : (nilp(c) ? nil :
    /// wrong_type_argument(Qlistp, c))`.
    fn build_car_cdr(
        backend: &mut Backend,
        abi: &RuntimeAbi,
        nil: RValue,
        value_ty: Type,
        bool_ty: Type,
        is_car: bool,
    ) -> CompileResult<Function> {
        let name = if is_car { "CAR" } else { "CDR" };
        let param = backend.ctx.new_parameter(None, value_ty, "c");
        let func = backend
            .ctx
            .new_function(None, FunctionType::AlwaysInline, value_ty, &[&param], name, false);

        let entry = func.new_block("entry");
        let cons_block = func.new_block("is_cons");
        let nilp_block = func.new_block("check_nil");
        let nil_block = func.new_block("is_nil");
        let error_block = func.new_block("wrong_type");

        let c: RValue = param.to_rvalue();
        let consp = backend.emit_call("consp", bool_ty, &[value_ty], &[c], false);
        entry.end_with_conditional(None, consp, cons_block, nilp_block);

        let cons_ptr = backend.cast_int_to_pointer(func, cons_block, c)?;
        let field_ref = if is_car {
            cons_ptr.dereference_field(None, abi.cons.car)
        } else {
            cons_ptr.dereference_field(None, abi.cons.cdr)
        };
        cons_block.end_with_return(None, field_ref.to_rvalue());

        let nilp = backend.emit_call("nilp", bool_ty, &[value_ty], &[c], false);
        nilp_block.end_with_conditional(None, nilp, nil_block, error_block);

        nil_block.end_with_return(None, nil);

        let listp_symbol = backend.emit_call("intern_listp_symbol", value_ty, &[], &[], false);
        let _ = backend.emit_call(
            "wrong_type_argument",
            value_ty,
            &[value_ty, value_ty],
            &[listp_symbol, c],
            false,
        );
        error_block.end_with_return(None, nil);

        Ok(func)
    }

    /// `setcar`/`setcdr`: `CHECK_TYPE(consp(cell), Qconsp, cell);
    /// CHECK_IMPURE(cell, XCONS(cell)); cell->car/cdr = value; return value;`
    fn build_setcar_setcdr(
        backend: &mut Backend,
        abi: &RuntimeAbi,
        value_ty: Type,
        bool_ty: Type,
        check_type: Function,
        check_impure: Function,
        is_setcar: bool,
    ) -> CompileResult<Function> {
        let name = if is_setcar { "setcar_inline" } else { "setcdr_inline" };
        let cell_param = backend.ctx.new_parameter(None, value_ty, "cell");
        let value_param = backend.ctx.new_parameter(None, value_ty, "newval");
        let func = backend.ctx.new_function(
            None,
            FunctionType::AlwaysInline,
            value_ty,
            &[&cell_param, &value_param],
            name,
            false,
        );

        let entry = func.new_block("entry");
        let cell: RValue = cell_param.to_rvalue();
        let newval: RValue = value_param.to_rvalue();

        let consp = backend.emit_call("consp", bool_ty, &[value_ty], &[cell], false);
        let consp_symbol = backend.emit_call("intern_consp_symbol", value_ty, &[], &[], false);
        entry.add_eval(
            None,
            backend
                .ctx
                .new_call(None, check_type, &[consp, consp_symbol, cell]),
        );

        let cell_ptr = backend.cast_int_to_pointer(func, entry, cell)?;
        entry.add_eval(
            None,
            backend.ctx.new_call(None, check_impure, &[cell, cell_ptr]),
        );

        let field = if is_setcar {
            cell_ptr.dereference_field(None, abi.cons.car)
        } else {
            cell_ptr.dereference_field(None, abi.cons.cdr)
        };
        entry.add_assignment(None, field, newval);
        entry.end_with_return(None, newval);

        Ok(func)
    }

    /// `CHECK_TYPE(ok, predicate_sym, obj)`: `if (!ok)
    /// wrong_type_argument(predicate_sym, obj);` — returns `obj` for
    /// convenient chaining in emitted code.
    fn build_check_type(backend: &mut Backend, value_ty: Type, bool_ty: Type) -> CompileResult<Function> {
        let ok_param = backend.ctx.new_parameter(None, bool_ty, "ok");
        let predicate_param = backend.ctx.new_parameter(None, value_ty, "predicate_sym");
        let obj_param = backend.ctx.new_parameter(None, value_ty, "obj");
        let func = backend.ctx.new_function(
            None,
            FunctionType::AlwaysInline,
            value_ty,
            &[&ok_param, &predicate_param, &obj_param],
            "CHECK_TYPE",
            false,
        );

        let entry = func.new_block("entry");
        let fail_block = func.new_block("fail");
        let ok_block = func.new_block("ok");

        let ok: RValue = ok_param.to_rvalue();
        entry.end_with_conditional(None, ok, ok_block, fail_block);

        let predicate: RValue = predicate_param.to_rvalue();
        let obj: RValue = obj_param.to_rvalue();
        let _ = backend.emit_call(
            "wrong_type_argument",
            value_ty,
            &[value_ty, value_ty],
            &[predicate, obj],
            false,
        );
        fail_block.end_with_return(None, obj);

        ok_block.end_with_return(None, obj);

        Ok(func)
    }

    /// `CHECK_IMPURE(obj, ptr)`: `if ((ptr - pure_base) <= PURESIZE)
    /// pure_write_error(obj);`
    fn build_check_impure(
        backend: &mut Backend,
        value_ty: Type,
        bool_ty: Type,
        pure_base: RValue,
        pure_size: RValue,
    ) -> CompileResult<Function> {
        let obj_param = backend.ctx.new_parameter(None, value_ty, "obj");
        let ptr_param = backend.ctx.new_parameter(None, backend.pointer_ty, "ptr");
        let func = backend.ctx.new_function(
            None,
            FunctionType::AlwaysInline,
            value_ty,
            &[&obj_param, &ptr_param],
            "CHECK_IMPURE",
            false,
        );

        let entry = func.new_block("entry");
        let error_block = func.new_block("pure_error");
        let ok_block = func.new_block("ok");

        let obj: RValue = obj_param.to_rvalue();
        let ptr: RValue = ptr_param.to_rvalue();
        let int_ty = backend.ctx.new_type::<i64>();
        let ptr_as_int = backend.cast_pointer_to_int(func, entry, ptr)?;
        let offset = backend
            .ctx
            .new_binary_op(None, BinaryOp::Minus, int_ty, ptr_as_int, pure_base);
        let in_pure = backend
            .ctx
            .new_comparison(None, ComparisonOp::LessThanEquals, offset, pure_size);
        let _ = bool_ty;
        entry.end_with_conditional(None, in_pure, error_block, ok_block);

        let _ = backend.emit_call("pure_write_error", value_ty, &[value_ty], &[obj], false);
        error_block.end_with_return(None, obj);

        ok_block.end_with_return(None, obj);

        Ok(func)
    }

    /// `PSEUDOVECTORP(obj, code)`: vectorlikep tag test, then a host helper
    /// for the pseudovector subtype (`helper_PSEUDOVECTOR_TYPEP_XUNTAG`,
    /// §6a).
    fn build_pseudovectorp(backend: &mut Backend, value_ty: Type, bool_ty: Type) -> CompileResult<Function> {
        let obj_param = backend.ctx.new_parameter(None, value_ty, "obj");
        let code_param = backend.ctx.new_parameter(None, backend.ctx.new_type::<i32>(), "code");
        let func = backend.ctx.new_function(
            None,
            FunctionType::AlwaysInline,
            bool_ty,
            &[&obj_param, &code_param],
            "PSEUDOVECTORP",
            false,
        );

        let entry = func.new_block("entry");
        let vectorlike_block = func.new_block("is_vectorlike");
        let not_vectorlike_block = func.new_block("not_vectorlike");

        let obj: RValue = obj_param.to_rvalue();
        let code: RValue = code_param.to_rvalue();
        let vectorlikep = backend.emit_call("vectorlikep", bool_ty, &[value_ty], &[obj], false);
        entry.end_with_conditional(None, vectorlikep, vectorlike_block, not_vectorlike_block);

        let int_ty = backend.ctx.new_type::<i32>();
        let false_rvalue = backend.ctx.new_rvalue_from_int(int_ty, 0);
        not_vectorlike_block.end_with_return(None, false_rvalue);

        let result = backend.emit_call(
            "helper_PSEUDOVECTOR_TYPEP_XUNTAG",
            bool_ty,
            &[value_ty, int_ty],
            &[obj, code],
            false,
        );
        vectorlike_block.end_with_return(None, result);

        Ok(func)
    }

    /// `bool_to_lisp(x)`: `x ? Qt : Qnil`.
    fn build_bool_to_lisp_obj(
        backend: &mut Backend,
        value_ty: Type,
        bool_ty: Type,
        nil: RValue,
        t: RValue,
    ) -> CompileResult<Function> {
        let x_param = backend.ctx.new_parameter(None, bool_ty, "x");
        let func = backend.ctx.new_function(
            None,
            FunctionType::AlwaysInline,
            value_ty,
            &[&x_param],
            "bool_to_lisp_obj",
            false,
        );

        let entry = func.new_block("entry");
        let true_block = func.new_block("ret_t");
        let nil_block = func.new_block("ret_nil");

        let x: RValue = x_param.to_rvalue();
        entry.end_with_conditional(None, x, true_block, nil_block);
        true_block.end_with_return(None, t);
        nil_block.end_with_return(None, nil);

        Ok(func)
    }
}
