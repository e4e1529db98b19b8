//! Code generation.
//!
//! The last pass of the pipeline: walks the flat body of every
//! abstraction and emits opcodes into its [`CodeArea`].
//!
//! The register discipline follows the machine model: arguments arrive
//! in X registers and are moved to the formals' Y registers by the
//! prologue; locals live in Y registers created unbound where their
//! `local` is entered; captured variables are read from G registers;
//! constants come from the K pool. Conditionals and exception handlers
//! emit forward jumps through holes that are back-patched once the
//! branch body's size is known.
//!
//! The serialization of finished code areas into C++ source lives in
//! [`cpp`].

pub mod code_area;
pub mod cpp;
pub mod opcodes;

pub use code_area::{CodeArea, CodeAreaBuilder, Hole};
pub use cpp::{CppEmitter, EmitMode, EmitOptions};
pub use opcodes::{OpCode, Register};

use crate::ast::{Arity, Constant, Expression, Pattern, Pos, RecordField, Statement};
use crate::error::CompileError;
use crate::program::Program;
use crate::transform::{Pass, PassError, PassResult};

/// The code-generation pass.
pub struct CodeGen;

impl CodeGen {
    /// Creates the pass.
    pub fn new() -> Self {
        Self
    }
}

impl Default for CodeGen {
    fn default() -> Self {
        Self::new()
    }
}

impl Pass for CodeGen {
    fn name(&self) -> &str {
        "codegen"
    }

    fn run(&mut self, program: &mut Program) -> PassResult<()> {
        let ids: Vec<_> = program.abstractions().map(|a| a.id).collect();
        for id in ids {
            let body = std::mem::replace(
                &mut program.abstraction_mut(id).body,
                Statement::Skip { pos: Pos::dummy() },
            );
            let abs = program.abstraction(id);
            let builder =
                CodeAreaBuilder::new(abs.name.clone(), abs.formals.clone(), abs.globals.clone());

            let mut gen = FnGen {
                builder,
                errors: Vec::new(),
                broken: None,
            };
            gen.generate(body);

            let FnGen {
                builder,
                errors,
                broken,
            } = gen;
            program.errors.extend(errors);
            if let Some(err) = broken {
                return Err(err);
            }
            let area = builder.finish()?;
            program.abstraction_mut(id).code_area = Some(area);
        }
        Ok(())
    }
}

struct FnGen {
    builder: CodeAreaBuilder,
    errors: Vec<CompileError>,
    broken: Option<PassError>,
}

impl FnGen {
    fn broken(&mut self, message: impl Into<String>) {
        if self.broken.is_none() {
            self.broken = Some(PassError::new("codegen", message));
        }
    }

    fn counting(&mut self, f: impl FnOnce(&mut Self)) -> u32 {
        let before = self.builder.emitted_words();
        f(self);
        self.builder.emitted_words() - before
    }

    fn generate(&mut self, body: Statement) {
        let frame_hole = self.builder.reserve(2);
        // Arguments arrive in X registers; the prologue parks them in
        // the formals' Y registers
        for i in 0..self.builder.arity() {
            self.builder.add(OpCode::Move {
                src: Register::X(i),
                dst: Register::Y(i),
            });
        }
        self.gen_stmt(body);
        self.builder.add(OpCode::DeallocateY);
        self.builder.add(OpCode::Return);
        let count = self.builder.y_count();
        self.builder.fill(frame_hole, OpCode::AllocateY { count });
    }

    /// The register holding a flat operand.
    fn operand_reg(&mut self, expr: &Expression) -> Register {
        match expr {
            Expression::Variable { symbol, .. } => self.builder.register_for_symbol(*symbol),
            Expression::Constant { value, .. } => self.builder.register_for_constant(value),
            other => {
                self.broken(format!("non-flat operand at {}", other.pos()));
                Register::X(0)
            }
        }
    }

    fn gen_stmt(&mut self, stmt: Statement) {
        match stmt {
            Statement::Compound { statements, .. } => {
                for s in statements {
                    self.builder.reset_x();
                    self.gen_stmt(s);
                }
            }
            Statement::Local { decls, body, .. } => {
                for decl in decls {
                    let reg = self.builder.register_for_symbol(decl);
                    self.builder.add(OpCode::CreateVar { dst: reg });
                }
                self.gen_stmt(*body);
            }
            Statement::Bind { lhs, rhs, .. } => self.gen_bind(lhs, rhs),
            Statement::Call { callee, args, pos } => self.gen_call(callee, args, pos),
            Statement::If {
                cond,
                then_body,
                else_body,
                ..
            } => {
                let test = self.operand_reg(&cond);
                let cond_hole = self.builder.reserve(3);
                let mut end_hole = None;
                let then_len = self.counting(|g| {
                    g.gen_stmt(*then_body);
                    end_hole = Some(g.builder.reserve(2));
                });
                self.builder.fill(
                    cond_hole,
                    OpCode::CondBranch {
                        test,
                        offset: then_len as i32,
                    },
                );
                let else_len = self.counting(|g| g.gen_stmt(*else_body));
                self.builder.fill(
                    end_hole.expect("then branch reserved no end hole"),
                    OpCode::Branch {
                        offset: else_len as i32,
                    },
                );
            }
            Statement::Try {
                body,
                catch_pattern,
                catch_body,
                pos,
            } => {
                let catch_reg = match catch_pattern {
                    Pattern::Capture { ref var, .. } => match var.symbol() {
                        Some(symbol) => self.builder.register_for_symbol(symbol),
                        None => {
                            self.broken(format!("unresolved catch variable at {}", pos));
                            return;
                        }
                    },
                    other => {
                        self.broken(format!(
                            "uncompiled catch pattern at {}",
                            other.pos()
                        ));
                        return;
                    }
                };
                let setup_hole = self.builder.reserve(2);
                let mut end_hole = None;
                let body_len = self.counting(|g| {
                    g.gen_stmt(*body);
                    g.builder.add(OpCode::PopExceptionHandler);
                    end_hole = Some(g.builder.reserve(2));
                });
                self.builder.fill(
                    setup_hole,
                    OpCode::SetupExceptionHandler {
                        offset: body_len as i32,
                    },
                );
                // Handler: the VM delivers the exception in X0
                let handler_len = self.counting(|g| {
                    g.builder.add(OpCode::Move {
                        src: Register::X(0),
                        dst: catch_reg,
                    });
                    g.gen_stmt(*catch_body);
                });
                self.builder.fill(
                    end_hole.expect("try body reserved no end hole"),
                    OpCode::Branch {
                        offset: handler_len as i32,
                    },
                );
            }
            Statement::Raise { value, .. } => {
                let value = self.operand_reg(&value);
                self.builder.add(OpCode::Raise { value });
            }
            Statement::Skip { .. } => {}
            other => {
                self.broken(format!("unlowered statement at {}", other.pos()));
            }
        }
    }

    fn gen_bind(&mut self, lhs: Expression, rhs: Expression) {
        let lhs_reg = self.operand_reg(&lhs);
        match rhs {
            Expression::Variable { .. } | Expression::Constant { .. } => {
                let rhs_reg = self.operand_reg(&rhs);
                self.builder.add(OpCode::Unify {
                    lhs: lhs_reg,
                    rhs: rhs_reg,
                });
            }
            Expression::Record { label, fields, pos } => {
                let dst = self.gen_record(*label, fields, pos);
                self.builder.add(OpCode::Unify {
                    lhs: lhs_reg,
                    rhs: dst,
                });
            }
            Expression::CreateAbstraction { abs, captured, .. } => {
                let body = self
                    .builder
                    .register_for_constant(&Constant::CodeArea(abs));
                let globals = captured.iter().map(|c| self.operand_reg(c)).collect();
                let dst = self.builder.alloc_x();
                self.builder.add(OpCode::CreateAbstraction {
                    body,
                    globals,
                    dst,
                });
                self.builder.add(OpCode::Unify {
                    lhs: lhs_reg,
                    rhs: dst,
                });
            }
            other => {
                self.broken(format!("unlowered binding at {}", other.pos()));
            }
        }
    }

    fn gen_call(&mut self, callee: Expression, args: Vec<Expression>, pos: Pos) {
        match callee {
            Expression::Constant {
                value: Constant::Builtin(builtin),
                ..
            } => {
                if args.len() != builtin.arity() {
                    self.errors.push(CompileError::ArityMismatch {
                        name: builtin.qualified_name(),
                        expected: builtin.arity(),
                        found: args.len(),
                        pos,
                    });
                    return;
                }
                let regs: Vec<Register> = args.iter().map(|a| self.operand_reg(a)).collect();
                match builtin.inline_op_code() {
                    Some(opcode) => self.builder.add(OpCode::CallBuiltinInline {
                        opcode,
                        args: regs,
                    }),
                    None => {
                        let slot = self
                            .builder
                            .register_for_constant(&Constant::Builtin(builtin));
                        self.builder.add(OpCode::CallBuiltin {
                            builtin: slot,
                            args: regs,
                        });
                    }
                }
            }
            callee @ Expression::Variable { .. } => {
                // Arguments are loaded into consecutive X registers
                let arity = args.len() as u32;
                for (i, arg) in args.iter().enumerate() {
                    let src = self.operand_reg(arg);
                    self.builder.add(OpCode::Move {
                        src,
                        dst: Register::X(i as u32),
                    });
                }
                let target = self.operand_reg(&callee);
                self.builder.add(OpCode::Call { target, arity });
            }
            other => {
                self.errors.push(CompileError::Unsupported {
                    message: "call of a non-procedure value".to_string(),
                    pos: other.pos().clone(),
                });
            }
        }
    }

    /// Builds a record into a scratch register. A record whose features
    /// are exactly `1..n` becomes a tuple; an empty construction is just
    /// its label.
    fn gen_record(&mut self, label: Expression, fields: Vec<RecordField>, pos: Pos) -> Register {
        let Expression::Constant { value: label, .. } = label else {
            self.broken(format!("record label is not a constant at {}", pos));
            return Register::X(0);
        };
        if fields.is_empty() {
            return self.builder.register_for_constant(&label);
        }

        let mut features = Vec::with_capacity(fields.len());
        for field in &fields {
            match &field.feature {
                Expression::Constant { value, .. } => features.push(value.clone()),
                other => {
                    self.broken(format!("record feature is not a constant at {}", other.pos()));
                    return Register::X(0);
                }
            }
        }
        let arity = Arity::new(label.clone(), features);

        // Field values, ordered to match the arity's canonical feature
        // order
        let mut ordered: Vec<(&Constant, &Expression)> = fields
            .iter()
            .map(|f| match &f.feature {
                Expression::Constant { value, .. } => (value, &f.value),
                _ => unreachable!("checked above"),
            })
            .collect();
        ordered.sort_by(|a, b| crate::ast::feature_order(a.0, b.0));
        let field_regs: Vec<Register> = ordered
            .into_iter()
            .map(|(_, value)| self.operand_reg(value))
            .collect();

        let dst = self.builder.alloc_x();
        if arity.is_tuple() {
            let label_slot = self.builder.register_for_constant(&label);
            self.builder.add(OpCode::CreateTuple {
                label: label_slot,
                fields: field_regs,
                dst,
            });
        } else {
            let arity_slot = self.builder.register_for_constant(&Constant::Arity(arity));
            self.builder.add(OpCode::CreateRecord {
                arity: arity_slot,
                fields: field_regs,
                dst,
            });
        }
        dst
    }
}
