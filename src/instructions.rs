//! The instruction model used by the index and the resolver.
//!
//! Every Dalvik opcode is lifted into one variant of the closed [`Operation`] enum. The
//! resolver's backward walk only needs to know which register an instruction defines and
//! whether that definition is a literal load, a register copy or something it cannot follow.

use crate::error::Result;
use crate::types::{ClassName, FieldRef, MethodDescriptor, MethodRef};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A slot in a method's register frame.
///
/// Parameter registers are normalised when a method is read: with `.locals 3`, `p1` becomes
/// `Register(4)`. Use [`Method::register_name`](crate::index::Method::register_name) to get
/// the smali spelling back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Register(pub u16);

impl Register {
    /// The second half of a wide register pair.
    pub fn high(self) -> Register {
        Register(self.0 + 1)
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Whether a written value occupies one register or a register pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Width {
    Single,
    Wide,
}

/// A constant loaded by a `const*` instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Literal {
    String(String),
    Number(i64),
    Class(ClassName),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvokeKind {
    Virtual,
    Super,
    Direct,
    Static,
    Interface,
}

impl InvokeKind {
    fn from_opcode(op: &str) -> Option<InvokeKind> {
        let base = op.strip_suffix("/range").unwrap_or(op);
        Some(match base {
            "invoke-virtual" => InvokeKind::Virtual,
            "invoke-super" => InvokeKind::Super,
            "invoke-direct" => InvokeKind::Direct,
            "invoke-static" => InvokeKind::Static,
            "invoke-interface" => InvokeKind::Interface,
            _ => return None,
        })
    }

    /// Every invoke except invoke-static passes the receiver as its first register.
    pub fn has_receiver(self) -> bool {
        self != InvokeKind::Static
    }
}

/// A lifted Dalvik operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    /// const, const/4, const-wide/16, const-string, const-class ...
    Const {
        dest: Register,
        width: Width,
        value: Literal,
    },
    /// move, move/from16, move-object, move-wide/16 ...
    Move {
        dest: Register,
        src: Register,
        width: Width,
    },
    /// move-result* after an invoke or filled-new-array
    MoveResult { dest: Register, width: Width },
    /// invoke-{virtual,super,direct,static,interface}[/range]
    Invoke {
        kind: InvokeKind,
        registers: Vec<Register>,
        target: MethodRef,
    },
    /// Unary, binary, literal, conversion and compare operations
    Arithmetic {
        dest: Register,
        width: Width,
        sources: Vec<Register>,
    },
    FieldGet {
        dest: Register,
        width: Width,
        object: Option<Register>,
        field: FieldRef,
    },
    FieldPut {
        src: Register,
        object: Option<Register>,
        field: FieldRef,
    },
    ArrayGet {
        dest: Register,
        width: Width,
        array: Register,
        index: Register,
    },
    ArrayPut {
        src: Register,
        array: Register,
        index: Register,
    },
    NewInstance { dest: Register, class: ClassName },
    NewArray {
        dest: Register,
        size: Register,
        class: String,
    },
    /// check-cast narrows the static type only, the register keeps its value
    CheckCast { reg: Register, class: String },
    /// goto, if-*, packed-switch, sparse-switch
    Branch {
        conditional: bool,
        operands: Vec<Register>,
        target: String,
    },
    Return { src: Option<Register> },
    Throw { src: Register },
    /// Everything else: instance-of, array-length, move-exception, monitor-*, nop ...
    Other { dest: Option<(Register, Width)> },
}

impl Operation {
    /// The register (pair) this operation writes, if any.
    pub fn dest(&self) -> Option<(Register, Width)> {
        match self {
            Operation::Const { dest, width, .. }
            | Operation::Move { dest, width, .. }
            | Operation::MoveResult { dest, width }
            | Operation::Arithmetic { dest, width, .. }
            | Operation::FieldGet { dest, width, .. }
            | Operation::ArrayGet { dest, width, .. } => Some((*dest, *width)),
            Operation::NewInstance { dest, .. } | Operation::NewArray { dest, .. } => {
                Some((*dest, Width::Single))
            }
            Operation::Other { dest } => *dest,
            Operation::Invoke { .. }
            | Operation::FieldPut { .. }
            | Operation::ArrayPut { .. }
            | Operation::CheckCast { .. }
            | Operation::Branch { .. }
            | Operation::Return { .. }
            | Operation::Throw { .. } => None,
        }
    }

    /// True if executing this operation overwrites `reg`, including as the high half of a pair.
    pub fn writes(&self, reg: Register) -> bool {
        match self.dest() {
            Some((d, Width::Single)) => d == reg,
            Some((d, Width::Wide)) => d == reg || d.high() == reg,
            None => false,
        }
    }

    /// Control never falls through to the next instruction.
    pub fn is_unconditional_transfer(&self) -> bool {
        matches!(
            self,
            Operation::Branch {
                conditional: false,
                ..
            } | Operation::Return { .. }
                | Operation::Throw { .. }
        )
    }

    pub fn is_invoke(&self) -> bool {
        matches!(self, Operation::Invoke { .. })
    }
}

/// One instruction of a method body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    /// Position within the method's instruction list
    pub offset: usize,
    /// The smali mnemonic, e.g. `invoke-virtual/range`
    pub opcode: String,
    pub op: Operation,
    /// Source line from the closest preceding `.line` directive
    pub line: Option<u32>,
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.op {
            Operation::Invoke { registers, target, .. } => {
                let regs: Vec<String> = registers.iter().map(|r| r.to_string()).collect();
                write!(f, "{:04} {} {{{}}}, {}", self.offset, self.opcode, regs.join(", "), target)
            }
            Operation::Const {
                dest,
                value: Literal::String(s),
                ..
            } => write!(f, "{:04} {} {}, {:?}", self.offset, self.opcode, dest, s),
            _ => write!(f, "{:04} {}", self.offset, self.opcode),
        }
    }
}

/// A decoded operand of a smali instruction line.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Operand {
    Reg(Register),
    Regs(Vec<Register>),
    Str(String),
    Int(i64),
    Label(String),
    Method(MethodRef),
    Field(FieldRef),
    Type(String),
    /// Operands the analysis has no use for: call-site names, method handles, inline@ indices
    Opaque,
}

impl Operand {
    fn describe(&self) -> &'static str {
        match self {
            Operand::Reg(_) => "register",
            Operand::Regs(_) => "register list",
            Operand::Str(_) => "string",
            Operand::Int(_) => "literal",
            Operand::Label(_) => "label",
            Operand::Method(_) => "method reference",
            Operand::Field(_) => "field reference",
            Operand::Type(_) => "type",
            Operand::Opaque => "operand",
        }
    }
}

/// Positional access to an operand list with helpful malformed errors.
struct Operands<'a> {
    opcode: &'a str,
    items: &'a [Operand],
}

impl<'a> Operands<'a> {
    fn get(&self, ix: usize) -> Result<&'a Operand> {
        match self.items.get(ix) {
            Some(o) => Ok(o),
            None => Err(malformed!("`{}` is missing operand {}", self.opcode, ix + 1)),
        }
    }

    fn reg(&self, ix: usize) -> Result<Register> {
        match self.get(ix)? {
            Operand::Reg(r) => Ok(*r),
            o => Err(malformed!("`{}` expected a register as operand {}, found {}", self.opcode, ix + 1, o.describe())),
        }
    }

    fn regs(&self) -> Vec<Register> {
        self.items
            .iter()
            .filter_map(|o| match o {
                Operand::Reg(r) => Some(*r),
                _ => None,
            })
            .collect()
    }

    fn expect_len(&self, n: usize) -> Result<()> {
        if self.items.len() != n {
            fail!("`{}` takes {} operands, found {}", self.opcode, n, self.items.len());
        }
        Ok(())
    }

    fn label(&self, ix: usize) -> Result<String> {
        match self.get(ix)? {
            Operand::Label(l) => Ok(l.clone()),
            o => Err(malformed!("`{}` expected a label, found {}", self.opcode, o.describe())),
        }
    }

    fn type_desc(&self, ix: usize) -> Result<String> {
        match self.get(ix)? {
            Operand::Type(t) => Ok(t.clone()),
            o => Err(malformed!("`{}` expected a type, found {}", self.opcode, o.describe())),
        }
    }

    fn field(&self, ix: usize) -> Result<FieldRef> {
        match self.get(ix)? {
            Operand::Field(f) => Ok(f.clone()),
            o => Err(malformed!("`{}` expected a field reference, found {}", self.opcode, o.describe())),
        }
    }
}

fn width_of(opcode: &str) -> Width {
    // For conversions only the destination type matters
    let dest_type = match opcode.split_once("-to-") {
        Some((_, to)) => to,
        None => opcode,
    };
    if opcode.starts_with("cmp") {
        Width::Single
    } else if dest_type.contains("wide") || dest_type.contains("long") || dest_type.contains("double") {
        Width::Wide
    } else {
        Width::Single
    }
}

fn is_arithmetic(opcode: &str) -> bool {
    const PREFIXES: [&str; 13] = [
        "add-", "sub-", "rsub-", "mul-", "div-", "rem-", "and-", "or-", "xor-", "shl-", "shr-", "ushr-", "neg-",
    ];
    PREFIXES.iter().any(|p| opcode.starts_with(p))
        || opcode.starts_with("not-")
        || opcode.starts_with("cmp")
        || opcode.contains("-to-")
}

/// Lifts a mnemonic and its decoded operands into an [`Operation`].
pub(crate) fn lift(opcode: &str, items: &[Operand]) -> Result<Operation> {
    let ops = Operands { opcode, items };

    // Invokes
    if let Some(kind) = InvokeKind::from_opcode(opcode) {
        ops.expect_len(2)?;
        let registers = match ops.get(0)? {
            Operand::Regs(r) => r.clone(),
            o => fail!("`{}` expected a register list, found {}", opcode, o.describe()),
        };
        let target = match ops.get(1)? {
            Operand::Method(m) => m.clone(),
            o => fail!("`{}` expected a method reference, found {}", opcode, o.describe()),
        };
        check_invoke_registers(kind, &registers, &target)?;
        return Ok(Operation::Invoke {
            kind,
            registers,
            target,
        });
    }

    let op = match opcode {
        "nop" => Operation::Other { dest: None },
        "const-string" | "const-string/jumbo" => {
            ops.expect_len(2)?;
            match ops.get(1)? {
                Operand::Str(s) => Operation::Const {
                    dest: ops.reg(0)?,
                    width: Width::Single,
                    value: Literal::String(s.clone()),
                },
                o => fail!("`{}` expected a string, found {}", opcode, o.describe()),
            }
        }
        "const-class" => {
            ops.expect_len(2)?;
            Operation::Const {
                dest: ops.reg(0)?,
                width: Width::Single,
                value: Literal::Class(ClassName::new(&ops.type_desc(1)?)),
            }
        }
        "const-method-handle" | "const-method-type" => Operation::Other {
            dest: Some((ops.reg(0)?, Width::Single)),
        },
        "const" | "const/4" | "const/16" | "const/high16" | "const-wide" | "const-wide/16" | "const-wide/32"
        | "const-wide/high16" => {
            ops.expect_len(2)?;
            match ops.get(1)? {
                Operand::Int(i) => Operation::Const {
                    dest: ops.reg(0)?,
                    width: width_of(opcode),
                    value: Literal::Number(*i),
                },
                o => fail!("`{}` expected a literal, found {}", opcode, o.describe()),
            }
        }
        "move-result" | "move-result-wide" | "move-result-object" => {
            ops.expect_len(1)?;
            Operation::MoveResult {
                dest: ops.reg(0)?,
                width: width_of(opcode),
            }
        }
        "move-exception" => {
            ops.expect_len(1)?;
            Operation::Other {
                dest: Some((ops.reg(0)?, Width::Single)),
            }
        }
        "move" | "move/from16" | "move/16" | "move-wide" | "move-wide/from16" | "move-wide/16" | "move-object"
        | "move-object/from16" | "move-object/16" => {
            ops.expect_len(2)?;
            Operation::Move {
                dest: ops.reg(0)?,
                src: ops.reg(1)?,
                width: width_of(opcode),
            }
        }
        "return-void" | "return-void-no-barrier" => Operation::Return { src: None },
        "return" | "return-wide" | "return-object" => {
            ops.expect_len(1)?;
            Operation::Return {
                src: Some(ops.reg(0)?),
            }
        }
        "throw" => {
            ops.expect_len(1)?;
            Operation::Throw { src: ops.reg(0)? }
        }
        "monitor-enter" | "monitor-exit" | "fill-array-data" => Operation::Other { dest: None },
        "invoke-polymorphic" | "invoke-polymorphic/range" | "invoke-custom" | "invoke-custom/range"
        | "filled-new-array" | "filled-new-array/range" => Operation::Other { dest: None },
        "check-cast" => {
            ops.expect_len(2)?;
            Operation::CheckCast {
                reg: ops.reg(0)?,
                class: ops.type_desc(1)?,
            }
        }
        "instance-of" | "array-length" => Operation::Other {
            dest: Some((ops.reg(0)?, Width::Single)),
        },
        "new-instance" => {
            ops.expect_len(2)?;
            Operation::NewInstance {
                dest: ops.reg(0)?,
                class: ClassName::new(&ops.type_desc(1)?),
            }
        }
        "new-array" => {
            ops.expect_len(3)?;
            Operation::NewArray {
                dest: ops.reg(0)?,
                size: ops.reg(1)?,
                class: ops.type_desc(2)?,
            }
        }
        "goto" | "goto/16" | "goto/32" => {
            ops.expect_len(1)?;
            Operation::Branch {
                conditional: false,
                operands: vec![],
                target: ops.label(0)?,
            }
        }
        "packed-switch" | "sparse-switch" => {
            ops.expect_len(2)?;
            Operation::Branch {
                conditional: true,
                operands: vec![ops.reg(0)?],
                target: ops.label(1)?,
            }
        }
        op if op.starts_with("if-") => {
            let last = items.len().saturating_sub(1);
            Operation::Branch {
                conditional: true,
                operands: ops.regs(),
                target: ops.label(last)?,
            }
        }
        op if op.starts_with("iget") || op.starts_with("sget") => {
            let instance = op.starts_with('i');
            ops.expect_len(if instance { 3 } else { 2 })?;
            Operation::FieldGet {
                dest: ops.reg(0)?,
                width: width_of(op),
                object: if instance { Some(ops.reg(1)?) } else { None },
                field: ops.field(items.len() - 1)?,
            }
        }
        op if op.starts_with("iput") || op.starts_with("sput") => {
            let instance = op.starts_with('i');
            ops.expect_len(if instance { 3 } else { 2 })?;
            Operation::FieldPut {
                src: ops.reg(0)?,
                object: if instance { Some(ops.reg(1)?) } else { None },
                field: ops.field(items.len() - 1)?,
            }
        }
        op if op.starts_with("aget") => {
            ops.expect_len(3)?;
            Operation::ArrayGet {
                dest: ops.reg(0)?,
                width: width_of(op),
                array: ops.reg(1)?,
                index: ops.reg(2)?,
            }
        }
        op if op.starts_with("aput") => {
            ops.expect_len(3)?;
            Operation::ArrayPut {
                src: ops.reg(0)?,
                array: ops.reg(1)?,
                index: ops.reg(2)?,
            }
        }
        op if is_arithmetic(op) => {
            let dest = ops.reg(0)?;
            let regs = ops.regs();
            Operation::Arithmetic {
                dest,
                width: width_of(op),
                sources: regs[1..].to_vec(),
            }
        }
        _ => fail!("unknown opcode `{}`", opcode),
    };
    Ok(op)
}

/// The register list of an invoke must cover the receiver plus every declared argument.
fn check_invoke_registers(kind: InvokeKind, registers: &[Register], target: &MethodRef) -> Result<()> {
    let descriptor = MethodDescriptor::parse(&target.descriptor)?;
    let expected = descriptor.argument_registers() + usize::from(kind.has_receiver());
    if registers.len() != expected {
        fail!(
            "invoke of {} passes {} registers but its descriptor needs {}",
            target,
            registers.len(),
            expected
        );
    }
    Ok(())
}
