//! Shared helpers for the integration tests: a builtin registry with the
//! modules the lowering passes rely on, and pipeline shortcuts.
#![allow(dead_code)]

use std::collections::HashSet;

use ozboot::builtins::{BuiltinRegistry, ModuleDescriptor};
use ozboot::parser::{parse_expression, parse_statement};
use ozboot::{transform, Expression, Program, Statement};

pub const BOOT_MODULES_JSON: &str = r#"[
  {
    "name": "Value",
    "builtins": [
      {"fullCppName": "mozart::builtins::ModValue::Dot", "name": ".", "inlineable": true, "inlineOpCode": 64, "params": [{"kind": "In"}, {"kind": "In"}, {"kind": "Out"}]},
      {"fullCppName": "mozart::builtins::ModValue::EqEq", "name": "==", "inlineable": false, "params": [{"kind": "In"}, {"kind": "In"}, {"kind": "Out"}]},
      {"fullCppName": "mozart::builtins::ModValue::NotEqEq", "name": "\\=", "inlineable": false, "params": [{"kind": "In"}, {"kind": "In"}, {"kind": "Out"}]},
      {"fullCppName": "mozart::builtins::ModValue::LessThan", "name": "<", "inlineable": false, "params": [{"kind": "In"}, {"kind": "In"}, {"kind": "Out"}]},
      {"fullCppName": "mozart::builtins::ModValue::LessEq", "name": "=<", "inlineable": false, "params": [{"kind": "In"}, {"kind": "In"}, {"kind": "Out"}]},
      {"fullCppName": "mozart::builtins::ModValue::GreaterThan", "name": ">", "inlineable": false, "params": [{"kind": "In"}, {"kind": "In"}, {"kind": "Out"}]},
      {"fullCppName": "mozart::builtins::ModValue::GreaterEq", "name": ">=", "inlineable": false, "params": [{"kind": "In"}, {"kind": "In"}, {"kind": "Out"}]}
    ]
  },
  {
    "name": "Number",
    "builtins": [
      {"fullCppName": "mozart::builtins::ModNumber::Add", "name": "+", "inlineable": true, "inlineOpCode": 112, "params": [{"kind": "In"}, {"kind": "In"}, {"kind": "Out"}]},
      {"fullCppName": "mozart::builtins::ModNumber::Sub", "name": "-", "inlineable": false, "params": [{"kind": "In"}, {"kind": "In"}, {"kind": "Out"}]},
      {"fullCppName": "mozart::builtins::ModNumber::Mul", "name": "*", "inlineable": false, "params": [{"kind": "In"}, {"kind": "In"}, {"kind": "Out"}]},
      {"fullCppName": "mozart::builtins::ModNumber::Neg", "name": "~", "inlineable": false, "params": [{"kind": "In"}, {"kind": "Out"}]}
    ]
  },
  {
    "name": "Int",
    "builtins": [
      {"fullCppName": "mozart::builtins::ModInt::Div", "name": "div", "inlineable": false, "params": [{"kind": "In"}, {"kind": "In"}, {"kind": "Out"}]},
      {"fullCppName": "mozart::builtins::ModInt::Mod", "name": "mod", "inlineable": false, "params": [{"kind": "In"}, {"kind": "In"}, {"kind": "Out"}]}
    ]
  },
  {
    "name": "Float",
    "builtins": [
      {"fullCppName": "mozart::builtins::ModFloat::Div", "name": "/", "inlineable": false, "params": [{"kind": "In"}, {"kind": "In"}, {"kind": "Out"}]}
    ]
  },
  {
    "name": "Record",
    "builtins": [
      {"fullCppName": "mozart::builtins::ModRecord::Test", "name": "test", "inlineable": false, "params": [{"kind": "In"}, {"kind": "In"}, {"kind": "Out"}]},
      {"fullCppName": "mozart::builtins::ModRecord::TestLabel", "name": "testLabel", "inlineable": false, "params": [{"kind": "In"}, {"kind": "In"}, {"kind": "Out"}]},
      {"fullCppName": "mozart::builtins::ModRecord::HasFeature", "name": "hasFeature", "inlineable": false, "params": [{"kind": "In"}, {"kind": "In"}, {"kind": "Out"}]}
    ]
  },
  {
    "name": "Thread",
    "builtins": [
      {"fullCppName": "mozart::builtins::ModThread::Create", "name": "create", "inlineable": false, "params": [{"kind": "In"}]}
    ]
  },
  {
    "name": "System",
    "builtins": [
      {"fullCppName": "mozart::builtins::ModSystem::Show", "name": "show", "inlineable": false, "params": [{"kind": "In"}]}
    ]
  }
]"#;

pub fn boot_registry() -> BuiltinRegistry {
    let descriptors: Vec<ModuleDescriptor> = serde_json::from_str(BOOT_MODULES_JSON).unwrap();
    let mut registry = BuiltinRegistry::new();
    for descriptor in descriptors {
        registry.register_module(descriptor);
    }
    registry
}

/// Parses a statement and runs the full pipeline over it.
pub fn compile_statement(source: &str) -> Program {
    let mut program = Program::new(false);
    program.builtins = boot_registry();
    let stmt = parse_statement(source, "test.oz", &HashSet::new()).unwrap();
    program.set_code(stmt);
    transform::compile(&mut program).unwrap();
    program
}

/// Like [`compile_statement`] but stops after the flattener, leaving the
/// abstraction bodies in place for inspection.
pub fn lower_statement(source: &str) -> Program {
    use ozboot::transform::{
        ConstantFolding, Desugar, DesugarClass, DesugarFunctor, Flattener, Namer, PassPipeline,
        PatternMatcher, Unnester,
    };
    let mut program = Program::new(false);
    program.builtins = boot_registry();
    let stmt = parse_statement(source, "test.oz", &HashSet::new()).unwrap();
    program.set_code(stmt);
    let mut pipeline = PassPipeline::new();
    pipeline
        .add(Namer::new())
        .add(DesugarFunctor::new())
        .add(DesugarClass::new())
        .add(Desugar::new())
        .add(PatternMatcher::new())
        .add(ConstantFolding::new())
        .add(Unnester::new())
        .add(Flattener::new());
    pipeline.run(&mut program).unwrap();
    program
}

/// Parses a functor expression.
pub fn parse_functor(source: &str, file: &str) -> Expression {
    parse_expression(source, file, &HashSet::new()).unwrap()
}

/// Walks every abstraction body of a finished program.
pub fn for_each_body(program: &Program, mut f: impl FnMut(&Statement)) {
    for abs in program.abstractions() {
        f(&abs.body);
    }
}
