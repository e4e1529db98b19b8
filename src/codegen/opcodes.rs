//! The opcode model.
//!
//! An opcode is a mnemonic plus an ordered argument list. In the
//! generated C++, every opcode becomes a run of `ByteCode` words: the
//! mnemonic, then one word per argument. Register arguments are wrapped
//! in the VM's `XReg`/`YReg`/`GReg`/`KReg` constructors so the bank
//! survives into the word encoding; counts and offsets are emitted as
//! plain integers.
//!
//! [`OpCode::size`] is the word count of the instruction, the unit in
//! which jump offsets are measured. A [`OpCode::Hole`] is a reserved
//! slot of a declared size that a later back-patch replaces; none may
//! survive code generation.

use std::fmt;

/// A register reference: scratch (X), local (Y), captured (G), or
/// constant-pool (K).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    /// Temporary register
    X(u32),
    /// Local-frame register
    Y(u32),
    /// Captured-variable register
    G(u32),
    /// Constant-pool slot
    K(u32),
}

impl Register {
    /// The X index, when this is an X register.
    pub fn x_index(self) -> Option<u32> {
        match self {
            Register::X(i) => Some(i),
            _ => None,
        }
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Register::X(i) => write!(f, "XReg({})", i),
            Register::Y(i) => write!(f, "YReg({})", i),
            Register::G(i) => write!(f, "GReg({})", i),
            Register::K(i) => write!(f, "KReg({})", i),
        }
    }
}

/// One virtual machine instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum OpCode {
    /// Reserve the Y frame
    AllocateY { count: u32 },
    /// Release the Y frame
    DeallocateY,
    /// Create a fresh unbound variable in a register
    CreateVar { dst: Register },
    /// Copy a register
    Move { src: Register, dst: Register },
    /// Unify two registers
    Unify { lhs: Register, rhs: Register },
    /// Call the procedure in `target` with `arity` arguments in X0..
    Call { target: Register, arity: u32 },
    /// Call a builtin with explicit argument registers
    CallBuiltin {
        builtin: Register,
        args: Vec<Register>,
    },
    /// An inlineable builtin, emitted as its own opcode word
    CallBuiltinInline { opcode: u32, args: Vec<Register> },
    /// Return from the abstraction
    Return,
    /// Relative jump, in words from the next instruction
    Branch { offset: i32 },
    /// Jump when the test register holds `false`
    CondBranch { test: Register, offset: i32 },
    /// Install an exception handler at the given offset
    SetupExceptionHandler { offset: i32 },
    /// Remove the innermost exception handler
    PopExceptionHandler,
    /// Raise the value in a register
    Raise { value: Register },
    /// Allocate a closure over a code area
    CreateAbstraction {
        body: Register,
        globals: Vec<Register>,
        dst: Register,
    },
    /// Build a tuple from field registers, in feature order
    CreateTuple {
        label: Register,
        fields: Vec<Register>,
        dst: Register,
    },
    /// Build a record from field registers, in arity order
    CreateRecord {
        arity: Register,
        fields: Vec<Register>,
        dst: Register,
    },
    /// A reserved slot awaiting back-patching
    Hole { size: u32 },
}

impl OpCode {
    /// The C++ words of this instruction: the mnemonic followed by one
    /// word per argument.
    pub fn words(&self) -> Vec<String> {
        match self {
            OpCode::AllocateY { count } => vec!["OpAllocateY".into(), count.to_string()],
            OpCode::DeallocateY => vec!["OpDeallocateY".into()],
            OpCode::CreateVar { dst } => vec!["OpCreateVar".into(), dst.to_string()],
            OpCode::Move { src, dst } => {
                vec!["OpMove".into(), src.to_string(), dst.to_string()]
            }
            OpCode::Unify { lhs, rhs } => {
                vec!["OpUnify".into(), lhs.to_string(), rhs.to_string()]
            }
            OpCode::Call { target, arity } => {
                vec!["OpCall".into(), target.to_string(), arity.to_string()]
            }
            OpCode::CallBuiltin { builtin, args } => {
                let mut words = vec![
                    "OpCallBuiltin".into(),
                    builtin.to_string(),
                    args.len().to_string(),
                ];
                words.extend(args.iter().map(|a| a.to_string()));
                words
            }
            OpCode::CallBuiltinInline { opcode, args } => {
                let mut words = vec![opcode.to_string()];
                words.extend(args.iter().map(|a| a.to_string()));
                words
            }
            OpCode::Return => vec!["OpReturn".into()],
            OpCode::Branch { offset } => vec!["OpBranch".into(), offset.to_string()],
            OpCode::CondBranch { test, offset } => vec![
                "OpCondBranch".into(),
                test.to_string(),
                offset.to_string(),
            ],
            OpCode::SetupExceptionHandler { offset } => vec![
                "OpSetupExceptionHandler".into(),
                offset.to_string(),
            ],
            OpCode::PopExceptionHandler => vec!["OpPopExceptionHandler".into()],
            OpCode::Raise { value } => vec!["OpRaise".into(), value.to_string()],
            OpCode::CreateAbstraction { body, globals, dst } => {
                let mut words = vec![
                    "OpCreateAbstraction".into(),
                    body.to_string(),
                    globals.len().to_string(),
                    dst.to_string(),
                ];
                words.extend(globals.iter().map(|g| g.to_string()));
                words
            }
            OpCode::CreateTuple { label, fields, dst } => {
                let mut words = vec![
                    "OpCreateTuple".into(),
                    label.to_string(),
                    fields.len().to_string(),
                    dst.to_string(),
                ];
                words.extend(fields.iter().map(|f| f.to_string()));
                words
            }
            OpCode::CreateRecord { arity, fields, dst } => {
                let mut words = vec![
                    "OpCreateRecord".into(),
                    arity.to_string(),
                    fields.len().to_string(),
                    dst.to_string(),
                ];
                words.extend(fields.iter().map(|f| f.to_string()));
                words
            }
            OpCode::Hole { .. } => vec!["OpHole".into()],
        }
    }

    /// The size of this instruction in words.
    pub fn size(&self) -> u32 {
        match self {
            OpCode::Hole { size } => *size,
            other => other.words().len() as u32,
        }
    }

    /// The register arguments of this instruction.
    pub fn registers(&self) -> Vec<Register> {
        match self {
            OpCode::AllocateY { .. }
            | OpCode::DeallocateY
            | OpCode::Return
            | OpCode::Branch { .. }
            | OpCode::SetupExceptionHandler { .. }
            | OpCode::PopExceptionHandler
            | OpCode::Hole { .. } => Vec::new(),
            OpCode::CreateVar { dst } => vec![*dst],
            OpCode::Move { src, dst } => vec![*src, *dst],
            OpCode::Unify { lhs, rhs } => vec![*lhs, *rhs],
            OpCode::Call { target, .. } => vec![*target],
            OpCode::CallBuiltin { builtin, args } => {
                let mut regs = vec![*builtin];
                regs.extend(args.iter().copied());
                regs
            }
            OpCode::CallBuiltinInline { args, .. } => args.clone(),
            OpCode::CondBranch { test, .. } => vec![*test],
            OpCode::Raise { value } => vec![*value],
            OpCode::CreateAbstraction { body, globals, dst } => {
                let mut regs = vec![*body, *dst];
                regs.extend(globals.iter().copied());
                regs
            }
            OpCode::CreateTuple { label, fields, dst } => {
                let mut regs = vec![*label, *dst];
                regs.extend(fields.iter().copied());
                regs
            }
            OpCode::CreateRecord { arity, fields, dst } => {
                let mut regs = vec![*arity, *dst];
                regs.extend(fields.iter().copied());
                regs
            }
        }
    }
}
