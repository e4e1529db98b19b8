//! Builtin procedures and the boot-module registry.
//!
//! The virtual machine ships a set of native boot modules. Each module is
//! described by a `*-builtin.json` descriptor file listing its builtins:
//! the fully qualified C++ name, the parameter directions, and whether the
//! VM accepts the builtin as an inline opcode. The registry loads these
//! descriptors and answers two questions for the rest of the compiler:
//!
//! - which builtin implements a given `Module.'name'` pair, and
//! - what a boot module exports, as a synthetic export record keyed by its
//!   `x-oz://boot/<name>` URL.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;

use crate::ast::{Expression, Pos, RecordField};

/// Direction of one builtin parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ParamKind {
    /// The parameter is consumed by the builtin
    In,
    /// The parameter is bound by the builtin
    Out,
}

/// Descriptor of one builtin parameter.
#[derive(Debug, Clone, Deserialize)]
pub struct ParamDescriptor {
    /// Parameter direction
    pub kind: ParamKind,
}

/// Descriptor of one builtin, as found in a module descriptor file.
#[derive(Debug, Clone, Deserialize)]
pub struct BuiltinDescriptor {
    /// Fully qualified C++ name of the builtin class
    #[serde(rename = "fullCppName")]
    pub full_cpp_name: String,
    /// Name of the builtin within its module
    pub name: String,
    /// True if the VM accepts this builtin as an inline opcode
    pub inlineable: bool,
    /// The inline opcode value, when inlineable
    #[serde(rename = "inlineOpCode", default)]
    pub inline_op_code: Option<u32>,
    /// Parameter list, in call order
    pub params: Vec<ParamDescriptor>,
}

/// Descriptor of one boot module: a `*-builtin.json` file.
#[derive(Debug, Clone, Deserialize)]
pub struct ModuleDescriptor {
    /// Module name, e.g. `Value`
    pub name: String,
    /// The module's builtins
    pub builtins: Vec<BuiltinDescriptor>,
}

#[derive(Debug)]
struct BuiltinData {
    module: String,
    descriptor: BuiltinDescriptor,
}

/// A builtin procedure with known arity and C++ name.
///
/// Cheap to clone; equality and hashing follow the fully qualified C++
/// name, which is unique per builtin.
#[derive(Debug, Clone)]
pub struct Builtin(Arc<BuiltinData>);

impl Builtin {
    /// The boot module this builtin belongs to.
    pub fn module(&self) -> &str {
        &self.0.module
    }

    /// The name of the builtin within its module.
    pub fn name(&self) -> &str {
        &self.0.descriptor.name
    }

    /// The `Module.'name'` form used in diagnostics.
    pub fn qualified_name(&self) -> String {
        format!("{}.'{}'", self.module(), self.name())
    }

    /// The fully qualified C++ name of the builtin class.
    pub fn full_cpp_name(&self) -> &str {
        &self.0.descriptor.full_cpp_name
    }

    /// The call arity, counting both in and out parameters.
    pub fn arity(&self) -> usize {
        self.0.descriptor.params.len()
    }

    /// The parameter directions, in call order.
    pub fn params(&self) -> impl Iterator<Item = ParamKind> + '_ {
        self.0.descriptor.params.iter().map(|p| p.kind)
    }

    /// The inline opcode, when the VM accepts this builtin inline.
    pub fn inline_op_code(&self) -> Option<u32> {
        if self.0.descriptor.inlineable {
            self.0.descriptor.inline_op_code
        } else {
            None
        }
    }
}

impl PartialEq for Builtin {
    fn eq(&self, other: &Self) -> bool {
        self.full_cpp_name() == other.full_cpp_name()
    }
}

impl Eq for Builtin {}

impl std::hash::Hash for Builtin {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.full_cpp_name().hash(state);
    }
}

/// The URL a boot module is registered under.
pub fn boot_url(module: &str) -> String {
    format!("x-oz://boot/{}", module)
}

/// Registry of all builtins known to one compilation.
#[derive(Debug, Default)]
pub struct BuiltinRegistry {
    /// Module name to builtins, in descriptor order
    modules: HashMap<String, Vec<Builtin>>,
    /// (module, name) to builtin
    by_name: HashMap<(String, String), Builtin>,
    /// Module names in registration order
    order: Vec<String>,
}

impl BuiltinRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers every builtin of a module descriptor.
    pub fn register_module(&mut self, descriptor: ModuleDescriptor) {
        let module = descriptor.name.clone();
        let mut builtins = Vec::with_capacity(descriptor.builtins.len());
        for b in descriptor.builtins {
            let builtin = Builtin(Arc::new(BuiltinData {
                module: module.clone(),
                descriptor: b,
            }));
            self.by_name.insert(
                (module.clone(), builtin.name().to_string()),
                builtin.clone(),
            );
            builtins.push(builtin);
        }
        if !self.modules.contains_key(&module) {
            self.order.push(module.clone());
        }
        self.modules.insert(module, builtins);
    }

    /// Parses a single descriptor file and registers it.
    pub fn load_file(&mut self, path: &Path) -> std::io::Result<()> {
        let text = fs::read_to_string(path)?;
        let descriptor: ModuleDescriptor = serde_json::from_str(&text)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        self.register_module(descriptor);
        Ok(())
    }

    /// Loads a descriptor file, or every `*-builtin.json` file of a
    /// directory.
    pub fn load_path(&mut self, path: &Path) -> std::io::Result<()> {
        if path.is_dir() {
            let mut entries: Vec<_> = fs::read_dir(path)?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| {
                    p.file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.ends_with("-builtin.json"))
                })
                .collect();
            entries.sort();
            for entry in entries {
                self.load_file(&entry)?;
            }
            Ok(())
        } else {
            self.load_file(path)
        }
    }

    /// Looks up a builtin by module and name.
    pub fn lookup(&self, module: &str, name: &str) -> Option<Builtin> {
        self.by_name
            .get(&(module.to_string(), name.to_string()))
            .cloned()
    }

    /// The builtins of a module, in descriptor order.
    pub fn module(&self, name: &str) -> Option<&[Builtin]> {
        self.modules.get(name).map(|v| v.as_slice())
    }

    /// Resolves a boot URL to its module's builtins.
    pub fn boot_module(&self, url: &str) -> Option<&[Builtin]> {
        let name = url.strip_prefix("x-oz://boot/")?;
        self.module(name)
    }

    /// Module names, in registration order.
    pub fn module_names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(|s| s.as_str())
    }

    /// Builds the synthetic export record of a boot module: one field per
    /// builtin, keyed by the builtin's name, valued by the builtin
    /// constant. This is what an import of `x-oz://boot/<name>` is bound
    /// to at compile time.
    pub fn export_record(&self, module: &str, pos: &Pos) -> Option<Expression> {
        let builtins = self.module(module)?;
        let fields = builtins
            .iter()
            .map(|b| RecordField {
                feature: Expression::atom(b.name(), pos.clone()),
                value: Expression::Constant {
                    value: crate::ast::Constant::Builtin(b.clone()),
                    pos: pos.clone(),
                },
            })
            .collect();
        Some(Expression::Record {
            label: Box::new(Expression::atom("export", pos.clone())),
            fields,
            pos: pos.clone(),
        })
    }
}

/// A registry holding the builtins the lowering passes rely on, used by
/// the unit tests of the passes.
#[cfg(test)]
pub(crate) fn test_registry() -> BuiltinRegistry {
    let mut registry = BuiltinRegistry::new();
    for descriptor in test_descriptors() {
        registry.register_module(descriptor);
    }
    registry
}

#[cfg(test)]
pub(crate) fn test_descriptors() -> Vec<ModuleDescriptor> {
    serde_json::from_str(crate::builtins::TEST_DESCRIPTORS_JSON).unwrap()
}

#[cfg(test)]
const TEST_DESCRIPTORS_JSON: &str = r#"[
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
