//! Program assembly.
//!
//! Before the pipeline runs, the parsed input is wrapped into one of the
//! three top-level program shapes the driver can ask for:
//!
//! - **module**: register one functor with the boot module manager
//! - **base environment**: merge the base functors into one, apply it to
//!   an import record built from the boot-modules record, and publish
//!   the result
//! - **linker**: tell the boot module manager to run the main functor
//!
//! This module also owns the URL conventions: a fixed allow-list decides
//! which module names are system modules.

use crate::ast::{Constant, Expression, FunctorImport, Pos, RecordField, Statement};
use crate::error::CompileError;
use crate::program::{AbsId, Program};
use crate::symbol::SymbolId;

/// The module names resolved against the system area.
const SYSTEM_MODULES: &[&str] = &[
    "Application",
    "Browser",
    "Connection",
    "Error",
    "Module",
    "OS",
    "Open",
    "Pickle",
    "Property",
    "Remote",
    "Search",
    "System",
];

/// The URL a module import resolves to: system modules live under
/// `x-oz://system/`, user modules next to the program.
pub fn module_url(name: &str) -> String {
    if SYSTEM_MODULES.contains(&name) {
        format!("x-oz://system/{}.ozf", name)
    } else {
        format!("{}.ozf", name)
    }
}

/// The registration URL of a compiled module file: its stem plus `.ozf`.
pub fn functor_url(file_stem: &str) -> String {
    format!("{}.ozf", file_stem)
}

/// Module mode: the program becomes
/// `{BootMM.registerFunctor '<url>' <functor>}`.
pub fn wrap_module(program: &mut Program, functor: Expression, url: &str) {
    let pos = functor.pos().clone();
    let callee = Expression::FeatureAccess {
        record: Box::new(Expression::var(program.boot_mm_symbol, pos.clone())),
        feature: Box::new(Expression::atom("registerFunctor", pos.clone())),
        pos: pos.clone(),
    };
    program.set_code(Statement::Call {
        callee,
        args: vec![Expression::atom(url, pos.clone()), functor],
        pos,
    });
}

/// Merges several base functors into one: requires, imports, and
/// exports concatenate; prepare and define sections run in order; the
/// first non-empty name wins. Export names are recorded as base
/// declarations.
pub fn merge_base_functors(
    program: &mut Program,
    functors: Vec<Expression>,
) -> Option<Expression> {
    let mut name = String::new();
    let mut require = Vec::new();
    let mut prepares: Vec<Statement> = Vec::new();
    let mut imports = Vec::new();
    let mut defines: Vec<Statement> = Vec::new();
    let mut exports = Vec::new();
    let mut pos: Option<Pos> = None;

    for functor in functors {
        let Expression::Functor {
            name: f_name,
            require: f_require,
            prepare: f_prepare,
            imports: f_imports,
            define: f_define,
            exports: f_exports,
            pos: f_pos,
            ..
        } = functor
        else {
            program.report(CompileError::MalformedFunctor {
                message: "base environment input is not a functor".to_string(),
                pos: functor.pos().clone(),
            });
            return None;
        };

        if name.is_empty() {
            name = f_name;
        }
        if pos.is_none() {
            pos = Some(f_pos);
        }
        require.extend(f_require);
        if let Some(s) = f_prepare {
            prepares.push(*s);
        }
        imports.extend(f_imports);
        if let Some(s) = f_define {
            defines.push(*s);
        }
        for export in &f_exports {
            // The name user programs reference is the export feature,
            // not the functor's internal variable
            if let Constant::Atom(name) = &export.feature {
                program.add_base_declaration(name);
            }
        }
        exports.extend(f_exports);
    }

    let pos = pos.unwrap_or_default();
    Some(Expression::Functor {
        name,
        require,
        prepare: merge_sections(prepares, &pos),
        imports,
        define: merge_sections(defines, &pos),
        exports,
        abs: None,
        pos,
    })
}

fn merge_sections(sections: Vec<Statement>, pos: &Pos) -> Option<Box<Statement>> {
    if sections.is_empty() {
        None
    } else {
        Some(Box::new(Statement::sequence(sections, pos.clone())))
    }
}

/// Base-environment mode. The program becomes
///
/// ```text
/// local F Import BootMM in
///    F = <merged base functor>
///    Import = 'import'(mod1: BootModules.'<url1>' ...)
///    Base = {F Import}
///    local B in B = Base.'Base'  B = Base end
///    BootMM = Base.'$BootMM'
///    {BootMM.registerModule '<url>' BootModules.'<url>'}   % per boot module
/// end
/// ```
///
/// where `BootModules` is a fresh top-level variable holding the record
/// of boot modules, supplied by the generated entry function. Returns
/// that variable for the emitter.
pub fn assemble_base_env(program: &mut Program, functor: Expression) -> SymbolId {
    let pos = functor.pos().clone();

    let boot_mods = program.symbols.fresh("BootModules");
    program.symbols.place(boot_mods, AbsId::top_level());

    let the_functor = program.symbols.fresh_synthetic();
    program.symbols.place(the_functor, AbsId::top_level());
    let import_record = program.symbols.fresh_synthetic();
    program.symbols.place(import_record, AbsId::top_level());
    let self_feature = program.symbols.fresh_synthetic();
    program.symbols.place(self_feature, AbsId::top_level());

    // The import record: one field per required module, fetched from
    // the boot-modules record by URL
    let mut import_urls = Vec::new();
    let import_fields: Vec<RecordField> = functor_imports(&functor)
        .iter()
        .filter_map(|item| {
            let Expression::RawVariable { name, .. } = &item.var else {
                return None;
            };
            let url = item.url.clone().unwrap_or_else(|| module_url(name));
            if url.starts_with("x-oz://boot/") {
                import_urls.push(url.clone());
            }
            Some(RecordField {
                feature: Expression::atom(name.clone(), item.pos.clone()),
                value: Expression::FeatureAccess {
                    record: Box::new(Expression::var(boot_mods, item.pos.clone())),
                    feature: Box::new(Expression::atom(url, item.pos.clone())),
                    pos: item.pos.clone(),
                },
            })
        })
        .collect();

    let base_env = program.base_env_symbol;
    let boot_mm = program.boot_mm_symbol;

    let mut body = vec![
        Statement::Bind {
            lhs: Expression::var(the_functor, pos.clone()),
            rhs: functor,
            pos: pos.clone(),
        },
        Statement::Bind {
            lhs: Expression::var(import_record, pos.clone()),
            rhs: Expression::Record {
                label: Box::new(Expression::atom("import", pos.clone())),
                fields: import_fields,
                pos: pos.clone(),
            },
            pos: pos.clone(),
        },
        Statement::Bind {
            lhs: Expression::var(base_env, pos.clone()),
            rhs: Expression::Call {
                callee: Box::new(Expression::var(the_functor, pos.clone())),
                args: vec![Expression::var(import_record, pos.clone())],
                pos: pos.clone(),
            },
            pos: pos.clone(),
        },
        // The conventional 'Base' feature is the environment itself
        Statement::Local {
            decls: vec![self_feature],
            body: Box::new(Statement::sequence(
                vec![
                    Statement::Bind {
                        lhs: Expression::var(self_feature, pos.clone()),
                        rhs: Expression::FeatureAccess {
                            record: Box::new(Expression::var(base_env, pos.clone())),
                            feature: Box::new(Expression::atom("Base", pos.clone())),
                            pos: pos.clone(),
                        },
                        pos: pos.clone(),
                    },
                    Statement::Bind {
                        lhs: Expression::var(self_feature, pos.clone()),
                        rhs: Expression::var(base_env, pos.clone()),
                        pos: pos.clone(),
                    },
                ],
                pos.clone(),
            )),
            pos: pos.clone(),
        },
        Statement::Bind {
            lhs: Expression::var(boot_mm, pos.clone()),
            rhs: Expression::FeatureAccess {
                record: Box::new(Expression::var(base_env, pos.clone())),
                feature: Box::new(Expression::atom("$BootMM", pos.clone())),
                pos: pos.clone(),
            },
            pos: pos.clone(),
        },
    ];

    for url in import_urls {
        body.push(Statement::Call {
            callee: Expression::FeatureAccess {
                record: Box::new(Expression::var(boot_mm, pos.clone())),
                feature: Box::new(Expression::atom("registerModule", pos.clone())),
                pos: pos.clone(),
            },
            args: vec![
                Expression::atom(url.clone(), pos.clone()),
                Expression::FeatureAccess {
                    record: Box::new(Expression::var(boot_mods, pos.clone())),
                    feature: Box::new(Expression::atom(url, pos.clone())),
                    pos: pos.clone(),
                },
            ],
            pos: pos.clone(),
        });
    }

    program.set_code(Statement::Local {
        decls: vec![the_functor, import_record, boot_mm],
        body: Box::new(Statement::sequence(body, pos.clone())),
        pos,
    });
    boot_mods
}

fn functor_imports(functor: &Expression) -> Vec<FunctorImport> {
    match functor {
        Expression::Functor {
            require, imports, ..
        } => require.iter().chain(imports.iter()).cloned().collect(),
        _ => Vec::new(),
    }
}

/// Linker mode: the program becomes `{BootMM.run '<mainUrl>'}`.
pub fn assemble_linker(program: &mut Program, main_url: &str) {
    let pos = Pos::new("<linker>", 1, 1);
    let callee = Expression::FeatureAccess {
        record: Box::new(Expression::var(program.boot_mm_symbol, pos.clone())),
        feature: Box::new(Expression::atom("run", pos.clone())),
        pos: pos.clone(),
    };
    program.set_code(Statement::Call {
        callee,
        args: vec![Expression::Constant {
            value: Constant::Atom(main_url.to_string()),
            pos: pos.clone(),
        }],
        pos,
    });
}
