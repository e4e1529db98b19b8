//! C++ serialization of a compiled program.
//!
//! The emitter is a pure transformation: it reads the finished program
//! and its code areas and produces one C++ translation unit that, when
//! compiled against the VM runtime, rebuilds the program as VM data
//! structures.
//!
//! The file contains one `createCodeAreaN` function per abstraction and
//! one entry function per output mode:
//!
//! - module mode: `createFunctor_<name>(vm, baseEnv, bootMM)`
//! - base-environment mode: `createBaseEnv(vm, bootModules, result)`
//! - linker mode: `createRunThread(vm, bootMM)` plus `main()`
//!
//! Each code-area function materializes the opcode vector as a
//! `ByteCode` array, builds the `CodeArea` with its constant count, code
//! block, byte size, and X count, and installs every pool constant
//! (`trivialBuild` for literals, `buildArity` for arities, the builtin's
//! `build`, or a nested `createCodeAreaN` call for code-area constants).
//!
//! The entry function allocates the top-level abstraction, feeding its G
//! registers from the entry parameters, and spawns a thread on it; the
//! thread runs at the next `VirtualMachine::run`.

use std::fmt::Write;

use crate::ast::Constant;
use crate::program::{Abstraction, Program};
use crate::symbol::SymbolId;
use crate::transform::PassError;

/// The output shape, selected by the driver.
#[derive(Debug, Clone)]
pub enum EmitMode {
    /// One functor, registered with the boot module manager
    Module {
        /// Functor name, used in the entry function identifier
        name: String,
    },
    /// The merged base environment
    BaseEnv {
        /// The synthetic variable holding the boot-modules record
        boot_mods: SymbolId,
    },
    /// The run thread of a linked program
    Linker {
        /// Functor creator names, in link order (main first)
        functor_names: Vec<String>,
    },
}

/// Options for one emission.
#[derive(Debug, Clone)]
pub struct EmitOptions {
    /// The output shape
    pub mode: EmitMode,
    /// Additional headers to include, in the given order
    pub headers: Vec<String>,
}

/// The C++ emitter.
pub struct CppEmitter<'p> {
    program: &'p Program,
    options: EmitOptions,
}

impl<'p> CppEmitter<'p> {
    /// Creates an emitter over a finished program.
    pub fn new(program: &'p Program, options: EmitOptions) -> Self {
        Self { program, options }
    }

    /// Serializes the whole translation unit.
    pub fn generate(&self) -> Result<String, PassError> {
        let mut out = String::new();

        out.push_str("// Generated by the Oz bootstrap compiler. Do not edit.\n");
        out.push_str("#include <mozart.h>\n");
        for header in &self.options.headers {
            let _ = writeln!(out, "#include \"{}\"", header);
        }
        out.push_str("\nusing namespace mozart;\n\n");

        for abs in self.program.abstractions() {
            let _ = writeln!(
                out,
                "void createCodeArea{}(VM vm, UnstableNode &result);",
                abs.id.index()
            );
        }
        out.push('\n');

        for abs in self.program.abstractions() {
            self.emit_code_area(&mut out, abs)?;
        }

        match &self.options.mode {
            EmitMode::Module { name } => self.emit_module_entry(&mut out, name)?,
            EmitMode::BaseEnv { boot_mods } => self.emit_base_env_entry(&mut out, *boot_mods)?,
            EmitMode::Linker { functor_names } => {
                self.emit_linker_entry(&mut out, functor_names)?
            }
        }

        Ok(out)
    }

    fn emit_code_area(&self, out: &mut String, abs: &Abstraction) -> Result<(), PassError> {
        let area = abs.code_area.as_ref().ok_or_else(|| {
            PassError::new(
                "emitter",
                format!("abstraction {} has no code area", abs.name),
            )
        })?;

        let _ = writeln!(
            out,
            "// {}\nvoid createCodeArea{}(VM vm, UnstableNode &result) {{",
            area.name(),
            abs.id.index()
        );
        out.push_str("  ByteCode codeBlock[] = {\n");
        for op in area.opcodes() {
            let _ = writeln!(out, "    {},", op.words().join(", "));
        }
        out.push_str("  };\n\n");

        let _ = writeln!(
            out,
            "  result = CodeArea::build(vm, {}, codeBlock, sizeof(codeBlock), {});",
            area.constants().len(),
            area.x_count()
        );

        if !area.constants().is_empty() {
            out.push_str("\n  ArrayInitializer initializer(vm, result);\n");
            out.push_str("  UnstableNode temp;\n");
            for (index, constant) in area.constants().iter().enumerate() {
                self.emit_constant(out, constant)?;
                let _ = writeln!(out, "  initializer.initElement(vm, {}, temp);", index);
            }
        }

        out.push_str("}\n\n");
        Ok(())
    }

    fn emit_constant(&self, out: &mut String, constant: &Constant) -> Result<(), PassError> {
        match constant {
            Constant::Builtin(builtin) => {
                let _ = writeln!(out, "  temp = {}::build(vm);", builtin.full_cpp_name());
            }
            Constant::CodeArea(abs) => {
                let _ = writeln!(out, "  createCodeArea{}(vm, temp);", abs.index());
            }
            Constant::Arity(arity) => {
                let mut parts = vec![trivial_cpp(&arity.label)?];
                for feature in &arity.features {
                    parts.push(trivial_cpp(feature)?);
                }
                let _ = writeln!(out, "  temp = buildArity(vm, {});", parts.join(", "));
            }
            literal => {
                let _ = writeln!(out, "  temp = trivialBuild(vm, {});", trivial_cpp(literal)?);
            }
        }
        Ok(())
    }

    /// Emits the allocation of the top-level abstraction, feeding each G
    /// register from the named C++ expression, and spawns its thread.
    fn emit_top_level_spawn(
        &self,
        out: &mut String,
        global_exprs: &[(SymbolId, String)],
    ) -> Result<(), PassError> {
        let top = self.program.top_level();
        out.push_str("  UnstableNode codeArea;\n");
        out.push_str("  createCodeArea0(vm, codeArea);\n\n");
        let _ = writeln!(
            out,
            "  UnstableNode abstraction = Abstraction::build(vm, {}, codeArea);",
            top.globals.len()
        );

        if !top.globals.is_empty() {
            out.push_str("  ArrayInitializer globals(vm, abstraction);\n");
            out.push_str("  UnstableNode temp;\n");
            for (index, &symbol) in top.globals.iter().enumerate() {
                let expr = global_exprs
                    .iter()
                    .find(|(s, _)| *s == symbol)
                    .map(|(_, e)| e.as_str())
                    .ok_or_else(|| {
                        PassError::new(
                            "emitter",
                            format!(
                                "top-level global '{}' has no entry parameter",
                                self.program.symbols.name(symbol)
                            ),
                        )
                    })?;
                let _ = writeln!(out, "  temp.copy(vm, {});", expr);
                let _ = writeln!(out, "  globals.initElement(vm, {}, temp);", index);
            }
        }

        out.push_str("\n  new (vm) Thread(vm, vm->getTopLevelSpace(), abstraction);\n");
        Ok(())
    }

    fn emit_module_entry(&self, out: &mut String, name: &str) -> Result<(), PassError> {
        let _ = writeln!(
            out,
            "void createFunctor_{}(VM vm, RichNode baseEnv, RichNode bootMM) {{",
            sanitize(name)
        );
        self.emit_top_level_spawn(
            out,
            &[
                (self.program.base_env_symbol, "baseEnv".to_string()),
                (self.program.boot_mm_symbol, "bootMM".to_string()),
            ],
        )?;
        out.push_str("}\n");
        Ok(())
    }

    fn emit_base_env_entry(&self, out: &mut String, boot_mods: SymbolId) -> Result<(), PassError> {
        out.push_str("void createBaseEnv(VM vm, RichNode bootModules, UnstableNode &result) {\n");
        out.push_str("  result = OptVar::build(vm);\n\n");
        self.emit_top_level_spawn(
            out,
            &[
                (self.program.base_env_symbol, "result".to_string()),
                (boot_mods, "bootModules".to_string()),
            ],
        )?;
        out.push_str("}\n");
        Ok(())
    }

    fn emit_linker_entry(
        &self,
        out: &mut String,
        functor_names: &[String],
    ) -> Result<(), PassError> {
        out.push_str("void createRunThread(VM vm, RichNode bootMM) {\n");
        self.emit_top_level_spawn(
            out,
            &[(self.program.boot_mm_symbol, "bootMM".to_string())],
        )?;
        out.push_str("}\n\n");

        out.push_str("int main(int argc, char* argv[]) {\n");
        out.push_str("  VirtualMachine virtualMachine;\n");
        out.push_str("  VM vm = &virtualMachine;\n\n");
        out.push_str("  UnstableNode bootModules = buildBootModulesRecord(vm);\n");
        out.push_str("  UnstableNode baseEnv;\n");
        out.push_str("  createBaseEnv(vm, bootModules, baseEnv);\n");
        out.push_str("  UnstableNode bootMM = fetchBootMM(vm, baseEnv);\n\n");
        for name in functor_names {
            let _ = writeln!(
                out,
                "  createFunctor_{}(vm, baseEnv, bootMM);",
                sanitize(name)
            );
        }
        out.push_str("  virtualMachine.run();\n\n");
        out.push_str("  createRunThread(vm, bootMM);\n");
        out.push_str("  virtualMachine.run();\n\n");
        out.push_str("  return 0;\n");
        out.push_str("}\n");
        Ok(())
    }
}

/// The `trivialBuild` argument form of a literal constant.
fn trivial_cpp(constant: &Constant) -> Result<String, PassError> {
    match constant {
        Constant::Atom(name) => Ok(format!("MOZART_STR(\"{}\")", escape_cpp(name))),
        Constant::Int(value) => Ok(format!("(nativeint) {}", value)),
        Constant::Float(value) => Ok(format!("{:?}", value)),
        Constant::Bool(value) => Ok(value.to_string()),
        Constant::Unit => Ok("unit".to_string()),
        other => Err(PassError::new(
            "emitter",
            format!("constant {} has no trivial form", other),
        )),
    }
}

fn escape_cpp(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}
