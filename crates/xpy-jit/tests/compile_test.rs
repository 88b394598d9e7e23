//! End-to-end compilation tests
//!
//! Each test assembles a function, compiles it with a fresh JIT session and
//! runs it through the host trampoline.

use proptest::prelude::*;
use proptest::test_runner::{Config, TestRunner};
use xpy_bytecode::{FunctionDef, Module, StructDef, TypeTag};
use xpy_jit::{HostBuffer, JitCompiler, TerminatorKind};

fn compile(name: &str, returns: TypeTag, params: Vec<TypeTag>, source: &str) -> JitCompiler {
    let mut jit = JitCompiler::new().expect("jit initialization should succeed");
    jit.compile_function(&FunctionDef::asm(name, returns, params, source))
        .expect("function compilation should succeed");
    jit
}

fn compile_module(module: &Module) -> JitCompiler {
    let mut jit = JitCompiler::new().expect("jit initialization should succeed");
    jit.compile_module(module)
        .expect("module compilation should succeed");
    jit
}

fn call(jit: &JitCompiler, name: &str, args: &[i64]) -> i64 {
    // SAFETY: callers pass integers or live host objects matching the
    // declared parameter types.
    unsafe { jit.invoke(name, args) }.expect("invoke should succeed")
}

const ADD: &str = "
.args a b
    LOAD_FAST a
    LOAD_FAST b
    BINARY_ADD
    RETURN_VALUE
";

#[test]
fn test_add() {
    let jit = compile("add", TypeTag::Int, vec![TypeTag::Int, TypeTag::Int], ADD);
    assert_eq!(call(&jit, "add", &[2, 3]), 5);
}

#[test]
fn test_floor_divide() {
    let jit = compile(
        "floor_divide",
        TypeTag::Int,
        vec![TypeTag::Int, TypeTag::Int],
        ".args a b\nLOAD_FAST a\nLOAD_FAST b\nBINARY_FLOOR_DIVIDE\nRETURN_VALUE",
    );
    assert_eq!(call(&jit, "floor_divide", &[10, 3]), 3);
    assert_eq!(call(&jit, "floor_divide", &[7, 7]), 1);
}

#[test]
fn test_stack_manipulation() {
    let jit = compile(
        "square",
        TypeTag::Int,
        vec![],
        "LOAD_CONST 6\nDUP_TOP\nBINARY_MULTIPLY\nRETURN_VALUE",
    );
    assert_eq!(call(&jit, "square", &[]), 36);

    let jit = compile(
        "swap",
        TypeTag::Int,
        vec![],
        "LOAD_CONST 10\nLOAD_CONST 3\nROT_TWO\nBINARY_SUBTRACT\nRETURN_VALUE",
    );
    assert_eq!(call(&jit, "swap", &[]), -7);

    // a b c -> c a b, so (3 - 10) - 1 after the rotation
    let jit = compile(
        "rotate",
        TypeTag::Int,
        vec![],
        "LOAD_CONST 10\nLOAD_CONST 1\nLOAD_CONST 3\nROT_THREE\nBINARY_SUBTRACT\nBINARY_SUBTRACT\nRETURN_VALUE",
    );
    assert_eq!(call(&jit, "rotate", &[]), 3 - (10 - 1));
}

#[test]
fn test_unpack_sequence() {
    let jit = compile(
        "unpack",
        TypeTag::Int,
        vec![],
        "
            LOAD_CONST (1, 2)
            UNPACK_SEQUENCE 2
            STORE_FAST a
            STORE_FAST b
            LOAD_FAST a
            LOAD_FAST b
            BINARY_SUBTRACT
            RETURN_VALUE
        ",
    );
    assert_eq!(call(&jit, "unpack", &[]), -1);
}

#[test]
fn test_byte_buffer_round_trip() {
    let jit = compile(
        "poke",
        TypeTag::Byte,
        vec![TypeTag::Buffer],
        "
        .args buf
            LOAD_GLOBAL byte
            LOAD_CONST 200
            CALL_FUNCTION 1
            LOAD_FAST buf
            LOAD_CONST 0
            STORE_SUBSCR
            LOAD_FAST buf
            LOAD_CONST 0
            BINARY_SUBSCR
            RETURN_VALUE
        ",
    );
    let mut buffer = HostBuffer::from_bytes(vec![0u8; 4]).unwrap();
    assert_eq!(call(&jit, "poke", &[buffer.as_arg()]), 200);
    assert_eq!(buffer.bytes(), &[200, 0, 0, 0]);
}

const AT: &str = ".args buf i\nLOAD_FAST buf\nLOAD_FAST i\nBINARY_SUBSCR\nRETURN_VALUE";

#[test]
fn test_buffer_index_types() {
    let mut module = Module::new();
    let index_types = [
        ("at_byte", TypeTag::Byte),
        ("at_ushort", TypeTag::UShort),
        ("at_uint", TypeTag::UInt),
        ("at_unsigned", TypeTag::Unsigned),
        ("at_ssize", TypeTag::SSize),
    ];
    for (name, index) in &index_types {
        module.add_function(FunctionDef::asm(
            *name,
            TypeTag::Byte,
            vec![TypeTag::Buffer, index.clone()],
            AT,
        ));
    }
    module.add_function(FunctionDef::asm(
        "put",
        TypeTag::Void,
        vec![TypeTag::Buffer, TypeTag::Unsigned],
        "
        .args buf i
            LOAD_GLOBAL byte
            LOAD_CONST 7
            CALL_FUNCTION 1
            LOAD_FAST buf
            LOAD_FAST i
            STORE_SUBSCR
            LOAD_CONST None
            RETURN_VALUE
        ",
    ));
    let jit = compile_module(&module);

    let mut buffer = HostBuffer::from_bytes(b"abcd".to_vec()).unwrap();
    for (name, _) in &index_types {
        assert_eq!(call(&jit, name, &[buffer.as_arg(), 0]), i64::from(b'a'));
        assert_eq!(call(&jit, name, &[buffer.as_arg(), 3]), i64::from(b'd'));
    }
    call(&jit, "put", &[buffer.as_arg(), 2]);
    assert_eq!(buffer.bytes(), b"ab\x07d");
}

#[test]
fn test_buffer_len_and_index() {
    let mut module = Module::new();
    module.add_function(FunctionDef::asm(
        "size",
        TypeTag::Int,
        vec![TypeTag::Buffer],
        ".args buf\nLOAD_GLOBAL len\nLOAD_FAST buf\nCALL_FUNCTION 1\nRETURN_VALUE",
    ));
    module.add_function(FunctionDef::asm(
        "last",
        TypeTag::Byte,
        vec![TypeTag::Buffer],
        "
        .args buf
            LOAD_FAST buf
            LOAD_GLOBAL len
            LOAD_FAST buf
            CALL_FUNCTION 1
            LOAD_CONST 1
            BINARY_SUBTRACT
            BINARY_SUBSCR
            RETURN_VALUE
        ",
    ));
    let jit = compile_module(&module);
    let mut buffer = HostBuffer::from_bytes(b"xyz".to_vec()).unwrap();
    assert_eq!(call(&jit, "size", &[buffer.as_arg()]), 3);
    assert_eq!(call(&jit, "last", &[buffer.as_arg()]), i64::from(b'z'));
}

#[test]
fn test_countdown_loop() {
    let jit = compile(
        "countdown",
        TypeTag::Int,
        vec![TypeTag::Int],
        "
        .args n
            SETUP_LOOP done
        top:
            LOAD_FAST n
            LOAD_CONST 0
            COMPARE_OP >
            POP_JUMP_IF_FALSE exit
            LOAD_FAST n
            LOAD_CONST 1
            INPLACE_SUBTRACT
            STORE_FAST n
            JUMP_ABSOLUTE top
        exit:
            POP_BLOCK
        done:
            LOAD_FAST n
            RETURN_VALUE
        ",
    );
    assert_eq!(call(&jit, "countdown", &[5]), 0);
    assert_eq!(call(&jit, "countdown", &[-3]), -3);
}

#[test]
fn test_break_lands_on_loop_exit() {
    let jit = compile(
        "step",
        TypeTag::Int,
        vec![TypeTag::Int],
        "
        .args n
        .locals total
            LOAD_CONST 0
            STORE_FAST total
            SETUP_LOOP done
        top:
            LOAD_FAST total
            LOAD_FAST n
            COMPARE_OP >=
            POP_JUMP_IF_FALSE body
            BREAK_LOOP
        body:
            LOAD_FAST total
            LOAD_CONST 2
            INPLACE_ADD
            STORE_FAST total
            JUMP_ABSOLUTE top
            POP_BLOCK
        done:
            LOAD_FAST total
            RETURN_VALUE
        ",
    );
    assert_eq!(call(&jit, "step", &[7]), 8);
    assert_eq!(call(&jit, "step", &[0]), 0);
}

#[test]
fn test_compiling_twice_yields_same_structure() {
    let def = FunctionDef::asm(
        "sign",
        TypeTag::Int,
        vec![TypeTag::Int],
        "
        .args x
            LOAD_FAST x
            LOAD_CONST 0
            COMPARE_OP <
            POP_JUMP_IF_TRUE negative
            LOAD_CONST 1
            RETURN_VALUE
        negative:
            LOAD_CONST -1
            RETURN_VALUE
        ",
    );
    let mut first = JitCompiler::new().unwrap();
    let mut second = JitCompiler::new().unwrap();
    let a = first.compile_function(&def).unwrap().blocks.clone();
    let b = second.compile_function(&def).unwrap().blocks.clone();
    assert_eq!(a, b);
    assert_eq!(
        a.iter().map(|block| block.terminator).collect::<Vec<_>>(),
        vec![
            TerminatorKind::Branch,
            TerminatorKind::Return,
            TerminatorKind::Return
        ]
    );
    assert_eq!(call(&first, "sign", &[-4]), -1);
    assert_eq!(call(&second, "sign", &[4]), 1);
}

#[test]
fn test_comparison_signedness() {
    let mut module = Module::new();
    module.add_function(FunctionDef::asm(
        "less_signed",
        TypeTag::Int,
        vec![TypeTag::Int, TypeTag::Int],
        ".args a b\nLOAD_FAST a\nLOAD_FAST b\nCOMPARE_OP <\nRETURN_VALUE",
    ));
    module.add_function(FunctionDef::asm(
        "less_unsigned",
        TypeTag::Int,
        vec![TypeTag::UInt, TypeTag::UInt],
        ".args a b\nLOAD_FAST a\nLOAD_FAST b\nCOMPARE_OP <\nRETURN_VALUE",
    ));
    let jit = compile_module(&module);
    assert_eq!(call(&jit, "less_signed", &[-1, 1]), 1);
    assert_eq!(call(&jit, "less_unsigned", &[u32::MAX as i64, 1]), 0);
}

#[test]
fn test_literal_adopts_narrow_type() {
    let jit = compile(
        "bump",
        TypeTag::Byte,
        vec![TypeTag::Byte],
        ".args b\nLOAD_FAST b\nLOAD_CONST 5\nBINARY_ADD\nRETURN_VALUE",
    );
    assert_eq!(call(&jit, "bump", &[250]), 255);
}

#[test]
fn test_unsigned_arithmetic() {
    let jit = compile(
        "mul",
        TypeTag::Unsigned,
        vec![TypeTag::Unsigned, TypeTag::Unsigned],
        ".args a b\nLOAD_FAST a\nLOAD_FAST b\nBINARY_MULTIPLY\nRETURN_VALUE",
    );
    assert_eq!(call(&jit, "mul", &[1 << 20, 1 << 20]), 1 << 40);
}

#[test]
fn test_direct_calls_in_any_order() {
    let mut module = Module::new();
    module.add_function(FunctionDef::asm(
        "quad",
        TypeTag::Int,
        vec![TypeTag::Int],
        "
        .args x
            LOAD_GLOBAL double
            LOAD_GLOBAL double
            LOAD_FAST x
            CALL_FUNCTION 1
            CALL_FUNCTION 1
            RETURN_VALUE
        ",
    ));
    module.add_function(FunctionDef::asm(
        "double",
        TypeTag::Int,
        vec![TypeTag::Int],
        ".args x\nLOAD_FAST x\nLOAD_FAST x\nBINARY_ADD\nRETURN_VALUE",
    ));
    let jit = compile_module(&module);
    assert_eq!(call(&jit, "quad", &[3]), 12);
    assert_eq!(jit.functions().count(), 2);
}

#[test]
fn test_global_struct_defaults_and_fields() {
    let mut module = Module::new();
    module
        .add_struct(StructDef::new(
            "Point",
            [("x", TypeTag::Int), ("y", TypeTag::Int)],
        ))
        .add_global("origin", TypeTag::ValueStruct("Point".into()))
        .add_function(FunctionDef::asm(
            "shift",
            TypeTag::Int,
            vec![],
            "
                LOAD_GLOBAL default
                LOAD_GLOBAL origin
                CALL_FUNCTION 1
                POP_TOP
                LOAD_CONST 5
                LOAD_GLOBAL origin
                STORE_ATTR x
                LOAD_GLOBAL origin
                LOAD_ATTR x
                LOAD_GLOBAL origin
                LOAD_ATTR y
                BINARY_ADD
                RETURN_VALUE
            ",
        ));
    let jit = compile_module(&module);
    assert_eq!(call(&jit, "shift", &[]), 5);
}

#[test]
fn test_struct_through_pointer() {
    #[repr(C)]
    struct Pair {
        first: i32,
        second: i32,
    }

    let mut module = Module::new();
    module
        .add_struct(StructDef::new(
            "Pair",
            [("first", TypeTag::Int), ("second", TypeTag::Int)],
        ))
        .add_function(FunctionDef::asm(
            "swap_into_first",
            TypeTag::Int,
            vec![TypeTag::Struct("Pair".into())],
            "
            .args p
                LOAD_FAST p
                LOAD_ATTR second
                LOAD_FAST p
                STORE_ATTR first
                LOAD_FAST p
                LOAD_ATTR first
                RETURN_VALUE
            ",
        ));
    let jit = compile_module(&module);
    let mut pair = Pair {
        first: 1,
        second: 42,
    };
    let address = &mut pair as *mut Pair as usize as i64;
    assert_eq!(call(&jit, "swap_into_first", &[address]), 42);
    assert_eq!(pair.first, 42);
    assert_eq!(pair.second, 42);
}

#[test]
fn test_named_constant() {
    let mut module = Module::new();
    module
        .add_constant("LIMIT", TypeTag::UShort, 60_000)
        .add_function(FunctionDef::asm(
            "limit",
            TypeTag::UShort,
            vec![],
            "LOAD_GLOBAL LIMIT\nRETURN_VALUE",
        ));
    let jit = compile_module(&module);
    assert_eq!(call(&jit, "limit", &[]), 60_000);
}

#[test]
fn test_string_literal_is_not_none() {
    let jit = compile(
        "is_none",
        TypeTag::Int,
        vec![],
        "LOAD_CONST \"hi\"\nLOAD_CONST None\nCOMPARE_OP ==\nRETURN_VALUE",
    );
    assert_eq!(call(&jit, "is_none", &[]), 0);
}

#[test]
fn test_print_returns_normally() {
    let jit = compile(
        "greet",
        TypeTag::Void,
        vec![TypeTag::Int],
        "
        .args n
            LOAD_GLOBAL print
            LOAD_CONST \"n =\"
            LOAD_FAST n
            CALL_FUNCTION 2
            POP_TOP
            LOAD_CONST None
            RETURN_VALUE
        ",
    );
    assert_eq!(call(&jit, "greet", &[3]), 0);
}

#[test]
fn prop_arithmetic_matches_direct_evaluation() {
    let mut module = Module::new();
    for (name, opcode) in [
        ("add", "BINARY_ADD"),
        ("sub", "BINARY_SUBTRACT"),
        ("mul", "BINARY_MULTIPLY"),
        ("div", "BINARY_FLOOR_DIVIDE"),
    ] {
        module.add_function(FunctionDef::asm(
            name,
            TypeTag::Int,
            vec![TypeTag::Int, TypeTag::Int],
            format!(".args a b\nLOAD_FAST a\nLOAD_FAST b\n{opcode}\nRETURN_VALUE"),
        ));
    }
    let jit = compile_module(&module);

    let mut runner = TestRunner::new(Config::with_cases(128));
    runner
        .run(&(-30_000i64..30_000, -30_000i64..30_000), |(a, b)| {
            prop_assert_eq!(call(&jit, "add", &[a, b]), a + b);
            prop_assert_eq!(call(&jit, "sub", &[a, b]), a - b);
            prop_assert_eq!(call(&jit, "mul", &[a, b]), a * b);
            if b != 0 {
                // truncating division
                prop_assert_eq!(call(&jit, "div", &[a, b]), a / b);
            }
            Ok(())
        })
        .unwrap();
}
