//! Backward register tracing for the arguments of a call site.
//!
//! For each argument register the resolver walks the caller's instructions backwards from
//! the invoke to the first instruction writing that register:
//!
//! * a `const*` load resolves to its literal,
//! * a register move continues from the source register, one hop per move, up to the
//!   configured hop limit,
//! * anything else (a call result, a field read, arithmetic, a parameter that is never
//!   written) leaves the argument [`ResolvedValue::Unresolved`].
//!
//! The walk always steps to the physically preceding instruction. It does not build a
//! control-flow graph: when it steps past a branch target or past an instruction that does
//! not fall through (goto, return, throw) the value found may come from another path than
//! the one that reaches the call. Such bindings are flagged with
//! [`RegisterBinding::crossed_merge`].

use crate::config::Config;
use crate::error::Result;
use crate::index::{Index, Method};
use crate::instructions::{Literal, Operation, Register, Width};
use crate::locator::CallSite;
use crate::types::MethodDescriptor;
use log::trace;
use rayon::prelude::*;
use serde::Serialize;
use std::fmt;

/// Settings of one resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolveOptions {
    pub hop_limit: usize,
    pub include_receiver: bool,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        ResolveOptions::from(&Config::default())
    }
}

impl From<&Config> for ResolveOptions {
    fn from(c: &Config) -> Self {
        ResolveOptions {
            hop_limit: c.hop_limit,
            include_receiver: c.include_receiver,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ResolvedValue {
    String(String),
    Number(i64),
    /// A `const-class` reference, in descriptor form
    Class(String),
    Unresolved,
}

impl ResolvedValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            ResolvedValue::String(_) => ValueKind::StringLiteral,
            ResolvedValue::Number(_) => ValueKind::NumericLiteral,
            ResolvedValue::Class(_) => ValueKind::ClassReference,
            ResolvedValue::Unresolved => ValueKind::Unknown,
        }
    }

    pub fn is_unresolved(&self) -> bool {
        *self == ResolvedValue::Unresolved
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ResolvedValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<i64> {
        match self {
            ResolvedValue::Number(n) => Some(*n),
            _ => None,
        }
    }
}

impl From<&Literal> for ResolvedValue {
    fn from(l: &Literal) -> Self {
        match l {
            Literal::String(s) => ResolvedValue::String(s.clone()),
            Literal::Number(n) => ResolvedValue::Number(*n),
            Literal::Class(c) => ResolvedValue::Class(c.as_jni_type()),
        }
    }
}

impl fmt::Display for ResolvedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolvedValue::String(s) => write!(f, "{s}"),
            ResolvedValue::Number(n) => write!(f, "{n}"),
            ResolvedValue::Class(c) => write!(f, "{c}"),
            ResolvedValue::Unresolved => write!(f, "UNRESOLVED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ValueKind {
    StringLiteral,
    NumericLiteral,
    ClassReference,
    Unknown,
}

/// The traced value of one argument of a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegisterBinding {
    /// Position in the returned sequence, i.e. declared argument order
    pub position: usize,
    /// True for the implicit receiver of an instance invoke
    pub receiver: bool,
    /// The argument register at the call, the low half for wide arguments
    pub register: Register,
    pub width: Width,
    pub value: ResolvedValue,
    pub kind: ValueKind,
    /// Offset of the instruction that ended the walk, `None` if no write was found
    pub definition: Option<usize>,
    /// Register moves followed
    pub hops: usize,
    /// The walk stepped past a branch target or a non fall-through instruction
    pub crossed_merge: bool,
}

/// Resolves the arguments of a call site with the index's configuration.
pub fn resolve(site: &CallSite, index: &Index) -> Result<Vec<RegisterBinding>> {
    resolve_with(site, index, &ResolveOptions::from(index.config()))
}

/// Resolves the arguments of a call site.
///
/// Bindings come back in declared argument order. Values that cannot be traced are
/// [`ResolvedValue::Unresolved`], never errors; only a call site that does not agree with
/// its method is malformed.
pub fn resolve_with(site: &CallSite, _index: &Index, options: &ResolveOptions) -> Result<Vec<RegisterBinding>> {
    let method = site.caller;
    let Some(instruction) = method.instruction(site.offset) else {
        fail!("offset {} is outside {} ({} instructions)", site.offset, method, method.instructions.len());
    };
    let Operation::Invoke {
        kind,
        registers,
        target,
    } = &instruction.op
    else {
        fail!("{} at offset {} in {} is not an invoke", instruction.opcode, site.offset, method);
    };

    let descriptor = MethodDescriptor::parse(&target.descriptor)?;
    let receiver = usize::from(kind.has_receiver());
    if registers.len() != descriptor.argument_registers() + receiver {
        fail!(
            "invoke at offset {} in {} passes {} registers to {}",
            site.offset,
            method,
            registers.len(),
            target
        );
    }

    // (register, width, is receiver) in declared order
    let mut arguments: Vec<(Register, Width, bool)> = vec![];
    if receiver == 1 && options.include_receiver {
        arguments.push((registers[0], Width::Single, true));
    }
    let mut next = receiver;
    for arg in &descriptor.args {
        let width = if arg.is_wide() { Width::Wide } else { Width::Single };
        arguments.push((registers[next], width, false));
        next += arg.register_width();
    }

    let bindings = arguments
        .into_iter()
        .enumerate()
        .map(|(position, (register, width, is_receiver))| {
            let walk = trace_register(method, site.offset, register, width, options.hop_limit);
            trace!(
                "{} @{:04} arg {} ({}): {} after {} hops{}",
                method,
                site.offset,
                position,
                method.register_name(register),
                walk.value,
                walk.hops,
                if walk.crossed_merge { ", crossed merge" } else { "" }
            );
            RegisterBinding {
                position,
                receiver: is_receiver,
                register,
                width,
                kind: walk.value.kind(),
                value: walk.value,
                definition: walk.definition,
                hops: walk.hops,
                crossed_merge: walk.crossed_merge,
            }
        })
        .collect();
    Ok(bindings)
}

/// Resolves many call sites in parallel, results in input order.
pub fn resolve_all(sites: &[CallSite], index: &Index) -> Vec<Result<Vec<RegisterBinding>>> {
    let options = ResolveOptions::from(index.config());
    sites.par_iter().map(|s| resolve_with(s, index, &options)).collect()
}

struct Walk {
    value: ResolvedValue,
    definition: Option<usize>,
    hops: usize,
    crossed_merge: bool,
}

/// Walks backwards from `from` (exclusive) to the definition of `register`.
fn trace_register(method: &Method, from: usize, register: Register, width: Width, hop_limit: usize) -> Walk {
    let mut walk = Walk {
        value: ResolvedValue::Unresolved,
        definition: None,
        hops: 0,
        crossed_merge: false,
    };
    let mut reg = register;
    let mut pos = from;

    while pos > 0 {
        if method.is_merge_point(pos) {
            walk.crossed_merge = true;
        }
        pos -= 1;
        let op = &method.instructions[pos].op;
        if op.is_unconditional_transfer() {
            walk.crossed_merge = true;
        }

        let touched = op.writes(reg) || (width == Width::Wide && op.writes(reg.high()));
        if !touched {
            continue;
        }
        walk.definition = Some(pos);

        // Only a write of exactly this register with the same width defines it,
        // anything else clobbers part of the value
        if op.dest() != Some((reg, width)) {
            return walk;
        }
        match op {
            Operation::Const { value, .. } => {
                walk.value = ResolvedValue::from(value);
                return walk;
            }
            Operation::Move { src, .. } => {
                if walk.hops == hop_limit {
                    return walk;
                }
                walk.hops += 1;
                reg = *src;
            }
            _ => return walk,
        }
    }
    walk
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locator::locate_calls;

    fn sink_class(body: &str, descriptor: &str, locals: usize) -> String {
        format!(
            ".class public Lcom/test/T;\n.super Ljava/lang/Object;\n\n.method public static run()V\n    .locals {locals}\n{body}\n    invoke-static {{{}}}, Lcom/test/Sink;->take{descriptor}\n    return-void\n.end method\n",
            args_for(descriptor)
        )
    }

    fn args_for(descriptor: &str) -> String {
        let d = MethodDescriptor::parse(descriptor).unwrap();
        (0..d.argument_registers()).map(|n| format!("v{n}")).collect::<Vec<_>>().join(", ")
    }

    fn resolve_single(smali: &str) -> Vec<RegisterBinding> {
        let index = Index::from_smali(&[smali]).unwrap();
        let calls = locate_calls("Lcom/test/Sink;", "take", &index).unwrap();
        assert_eq!(calls.len(), 1);
        resolve(&calls[0], &index).unwrap()
    }

    #[test]
    fn literal_string() {
        let b = resolve_single(&sink_class("    const-string v0, \"12345\"", "(Ljava/lang/String;)V", 1));
        assert_eq!(b.len(), 1);
        assert_eq!(b[0].value, ResolvedValue::String("12345".to_string()));
        assert_eq!(b[0].kind, ValueKind::StringLiteral);
        assert_eq!(b[0].definition, Some(0));
        assert_eq!(b[0].hops, 0);
        assert!(!b[0].crossed_merge);
    }

    #[test]
    fn literals_of_every_kind() {
        let body = "    const/4 v0, -0x1\n    const-class v1, Ljava/lang/String;\n    const-wide v2, 0x100000000L";
        let b = resolve_single(&sink_class(body, "(ILjava/lang/Class;J)V", 4));
        assert_eq!(b.len(), 3);
        assert_eq!(b[0].value, ResolvedValue::Number(-1));
        assert_eq!(b[1].value, ResolvedValue::Class("Ljava/lang/String;".to_string()));
        assert_eq!(b[1].kind, ValueKind::ClassReference);
        assert_eq!(b[2].value, ResolvedValue::Number(0x100000000));
        assert_eq!(b[2].width, Width::Wide);
        assert_eq!(b[2].register, Register(2));
    }

    #[test]
    fn move_chain_follows_sources() {
        let body = "    const-string v2, \"cmd\"\n    move-object v1, v2\n    move-object v0, v1";
        let b = resolve_single(&sink_class(body, "(Ljava/lang/String;)V", 3));
        assert_eq!(b[0].value.as_str(), Some("cmd"));
        assert_eq!(b[0].hops, 2);
        assert_eq!(b[0].definition, Some(0));
    }

    #[test]
    fn hop_limit_is_respected() {
        let mut body = vec!["    const-string v0, \"deep\"".to_string()];
        for _ in 0..20 {
            body.push("    move-object v1, v0".to_string());
            body.push("    move-object v0, v1".to_string());
        }
        let smali = sink_class(&body.join("\n"), "(Ljava/lang/String;)V", 2);
        let index = Index::from_smali(&[smali.as_str()]).unwrap();
        let calls = locate_calls("Lcom/test/Sink;", "take", &index).unwrap();

        let b = resolve(&calls[0], &index).unwrap();
        assert!(b[0].value.is_unresolved());
        assert_eq!(b[0].hops, 16);

        let wide_open = ResolveOptions {
            hop_limit: 40,
            include_receiver: false,
        };
        let b = resolve_with(&calls[0], &index, &wide_open).unwrap();
        assert_eq!(b[0].value.as_str(), Some("deep"));
        assert_eq!(b[0].hops, 40);
    }

    #[test]
    fn other_definitions_are_unresolved() {
        let body = "    const/4 v1, 0x2\n    add-int/lit8 v0, v1, 0x3";
        let b = resolve_single(&sink_class(body, "(I)V", 2));
        assert!(b[0].value.is_unresolved());
        assert_eq!(b[0].kind, ValueKind::Unknown);
        assert_eq!(b[0].definition, Some(1));

        let body = "    sget-object v0, Lcom/test/Cfg;->NUMBER:Ljava/lang/String;";
        let b = resolve_single(&sink_class(body, "(Ljava/lang/String;)V", 1));
        assert!(b[0].value.is_unresolved());
    }

    #[test]
    fn never_written_is_unresolved() {
        let b = resolve_single(&sink_class("    nop", "(I)V", 1));
        assert!(b[0].value.is_unresolved());
        assert_eq!(b[0].definition, None);
    }

    #[test]
    fn check_cast_is_transparent() {
        let body = "    const-string v0, \"x\"\n    check-cast v0, Ljava/lang/String;";
        let b = resolve_single(&sink_class(body, "(Ljava/lang/Object;)V", 1));
        assert_eq!(b[0].value.as_str(), Some("x"));
    }

    #[test]
    fn wide_high_half_clobbers() {
        // v1 is the high half of the v0/v1 pair
        let body = "    const-wide/16 v0, 0x5\n    const/4 v1, 0x0";
        let b = resolve_single(&sink_class(body, "(J)V", 2));
        assert!(b[0].value.is_unresolved());
        assert_eq!(b[0].definition, Some(1));

        // A wide write over v0/v1 clobbers a single argument in v1
        let smali = ".class public Lcom/test/T;\n.super Ljava/lang/Object;\n.method public static run()V\n    .locals 2\n    const/4 v1, 0x7\n    const-wide/16 v0, 0x0\n    invoke-static {v1}, Lcom/test/Sink;->take(I)V\n    return-void\n.end method\n";
        let b = resolve_single(smali);
        assert!(b[0].value.is_unresolved());
    }

    #[test]
    fn argument_order_follows_the_invoke() {
        let smali = r#"
.class public Lcom/test/T;
.super Ljava/lang/Object;

.method public static run()V
    .locals 4
    const-string v1, "second"
    const-string v3, "first"
    invoke-static {v3, v1}, Lcom/test/Sink;->take(Ljava/lang/String;Ljava/lang/String;)V
    return-void
.end method
"#;
        let b = resolve_single(smali);
        assert_eq!(b[0].register, Register(3));
        assert_eq!(b[0].value.as_str(), Some("first"));
        assert_eq!(b[1].register, Register(1));
        assert_eq!(b[1].value.as_str(), Some("second"));
        assert_eq!(b.iter().map(|b| b.position).collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn receiver_only_on_request() {
        let smali = r#"
.class public Lcom/test/T;
.super Ljava/lang/Object;

.method public run()V
    .locals 2
    const-string v1, "arg"
    invoke-virtual {p0, v1}, Lcom/test/Sink;->take(Ljava/lang/String;)V
    return-void
.end method
"#;
        let index = Index::from_smali(&[smali]).unwrap();
        let calls = locate_calls("Lcom/test/Sink;", "take", &index).unwrap();

        let b = resolve(&calls[0], &index).unwrap();
        assert_eq!(b.len(), 1);
        assert_eq!(b[0].value.as_str(), Some("arg"));

        let with_receiver = ResolveOptions {
            include_receiver: true,
            ..ResolveOptions::default()
        };
        let b = resolve_with(&calls[0], &index, &with_receiver).unwrap();
        assert_eq!(b.len(), 2);
        assert!(b[0].receiver);
        assert_eq!(calls[0].caller.register_name(b[0].register), "p0");
        assert!(b[0].value.is_unresolved());
    }

    #[test]
    fn merge_points_follow_the_physical_predecessor() {
        let smali = r#"
.class public Lcom/test/T;
.super Ljava/lang/Object;

.method public static run(Z)V
    .locals 1
    if-eqz p0, :cond_0
    const-string v0, "first"
    goto :goto_0
    :cond_0
    const-string v0, "second"
    :goto_0
    invoke-static {v0}, Lcom/test/Sink;->take(Ljava/lang/String;)V
    return-void
.end method
"#;
        let b = resolve_single(smali);
        assert_eq!(b[0].value.as_str(), Some("second"));
        assert!(b[0].crossed_merge);
    }

    #[test]
    fn idempotent_and_parallel() {
        let body = "    const-string v0, \"a\"";
        let smali = sink_class(body, "(Ljava/lang/String;)V", 1);
        let index = Index::from_smali(&[smali.as_str()]).unwrap();
        let calls = locate_calls("Lcom/test/Sink;", "take", &index).unwrap();
        let first = resolve(&calls[0], &index).unwrap();
        assert_eq!(first, resolve(&calls[0], &index).unwrap());
        let all = resolve_all(&calls, &index);
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].as_ref().unwrap(), &first);
    }

    #[test]
    fn inconsistent_sites_are_malformed() {
        let smali = sink_class("    const/4 v0, 0x1", "(I)V", 1);
        let index = Index::from_smali(&[smali.as_str()]).unwrap();
        let calls = locate_calls("Lcom/test/Sink;", "take", &index).unwrap();

        let mut bad = calls[0];
        bad.offset = 0;
        assert!(resolve(&bad, &index).unwrap_err().is_malformed());
        bad.offset = 99;
        assert!(resolve(&bad, &index).unwrap_err().is_malformed());
    }

    #[test]
    fn bindings_serialise() {
        let b = resolve_single(&sink_class("    const-string v0, \"12345\"", "(Ljava/lang/String;)V", 1));
        let json = serde_json::to_value(&b[0]).unwrap();
        assert_eq!(json["value"]["String"], "12345");
        assert_eq!(json["kind"], "StringLiteral");
        assert_eq!(json["register"], 0);
    }
}
