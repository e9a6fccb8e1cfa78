use crate::error::{Error, Result};
use crate::index::{Class, ClassOrigin, Method};
use crate::instructions::{lift, Instruction, Literal, Operand, Operation, Register};
use crate::types::{parse_method_descriptor, parse_typesignature, split_member, AccessFlags, ClassName, FieldRef, MethodDescriptor, MethodRef};
use nom::branch::alt;
use nom::bytes::complete::{escaped, tag, take_till1, take_until, take_while1};
use nom::character::complete::{char, digit1, none_of, one_of, space0, space1};
use nom::combinator::{not, opt, recognize};
use nom::multi::separated_list0;
use nom::sequence::{delimited, pair, terminated};
use nom::{IResult, Parser};
use std::collections::{BTreeSet, HashMap};
use std::iter::Enumerate;
use std::str::Lines;

/// Non-blank, non-comment lines of a smali document with their 1-based line numbers.
struct SmaliLines<'a> {
    inner: Enumerate<Lines<'a>>,
}

impl<'a> SmaliLines<'a> {
    fn new(smali: &'a str) -> Self {
        SmaliLines {
            inner: smali.lines().enumerate(),
        }
    }
}

impl<'a> Iterator for SmaliLines<'a> {
    type Item = (usize, &'a str);

    fn next(&mut self) -> Option<Self::Item> {
        for (n, l) in self.inner.by_ref() {
            let l = l.trim();
            if l.is_empty() || l.starts_with('#') {
                continue;
            }
            return Some((n + 1, strip_comment(l)));
        }
        None
    }
}

fn at_line(n: usize, e: Error) -> Error {
    match e {
        Error::MalformedBinary { message, origin } => Error::MalformedBinary {
            message: format!("line {n}: {message}"),
            origin,
        },
        e => e,
    }
}

/// Drops a trailing `# comment`, ignoring any `#` inside a string literal.
fn strip_comment(line: &str) -> &str {
    let mut in_string = false;
    let mut escaped = false;
    for (ix, c) in line.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '#' if !in_string => return line[..ix].trim_end(),
            _ => {}
        }
    }
    line
}

/// Decodes the escapes smali uses inside string literals.
pub(crate) fn unescape(s: &str) -> Result<String> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('b') => out.push('\u{8}'),
            Some('f') => out.push('\u{c}'),
            Some('\'') => out.push('\''),
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some('u') => {
                let mut units = vec![unicode_escape(&mut chars)?];
                // A high surrogate pairs with an immediately following low surrogate escape
                if (0xD800..=0xDBFF).contains(&units[0]) {
                    let mut ahead = chars.clone();
                    if ahead.next() == Some('\\') && ahead.next() == Some('u') {
                        if let Ok(low) = unicode_escape(&mut ahead) {
                            if (0xDC00..=0xDFFF).contains(&low) {
                                units.push(low);
                                chars = ahead;
                            }
                        }
                    }
                }
                out.extend(char::decode_utf16(units).map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER)));
            }
            Some(other) => fail!("unknown escape `\\{}`", other),
            None => fail!("dangling escape at end of string"),
        }
    }
    Ok(out)
}

/// Reads the four hex digits of a `\u` escape as a UTF-16 code unit.
fn unicode_escape(chars: &mut std::str::Chars) -> Result<u16> {
    let hex: String = chars.by_ref().take(4).collect();
    if hex.len() != 4 {
        fail!("bad unicode escape `\\u{}`", hex);
    }
    u16::from_str_radix(&hex, 16).map_err(|_| malformed!("bad unicode escape `\\u{}`", hex))
}

/// Parses a quoted string literal and returns its raw (still escaped) body.
fn quoted(input: &str) -> IResult<&str, &str> {
    let esc = escaped(none_of("\\\""), '\\', one_of("'\"tbnrfu\\"));
    let esc_or_empty = alt((esc, tag("")));
    delimited(char('"'), esc_or_empty, char('"')).parse(input)
}

/// Parses an integer literal: decimal or hex, optionally negative, with an optional
/// width suffix (`L`, `t`, `s`).
pub(crate) fn parse_literal_int(input: &str) -> IResult<&str, i64> {
    let (input, sign) = opt(char('-')).parse(input)?;

    let hex: IResult<&str, &str> = alt((tag("0x"), tag("0X"))).parse(input);
    let (input, magnitude) = if let Ok((o, _)) = hex {
        let (o, digits) = take_while1(|c: char| c.is_ascii_hexdigit()).parse(o)?;
        let v = u64::from_str_radix(digits, 16)
            .map_err(|_| nom::Err::Failure(nom::error::Error::new(input, nom::error::ErrorKind::Digit)))?;
        (o, v)
    } else {
        let (o, digits) = digit1.parse(input)?;
        let v = digits
            .parse::<u64>()
            .map_err(|_| nom::Err::Failure(nom::error::Error::new(input, nom::error::ErrorKind::Digit)))?;
        (o, v)
    };
    let (input, _) = opt(one_of("Lts")).parse(input)?;

    // Unsigned hex above i64::MAX is a two's complement bit pattern
    let value = magnitude as i64;
    Ok((input, if sign.is_some() { value.wrapping_neg() } else { value }))
}

/// Raw register as written, before it is placed in the method frame.
#[derive(Debug, Clone, Copy, PartialEq)]
enum SmaliRegister {
    Parameter(u16),
    Local(u16),
}

fn parse_register(input: &str) -> IResult<&str, SmaliRegister> {
    let (input, t) = alt((char('v'), char('p'))).parse(input)?;
    let (input, num) = digit1.parse(input)?;
    let n = num
        .parse::<u16>()
        .map_err(|_| nom::Err::Failure(nom::error::Error::new(input, nom::error::ErrorKind::Digit)))?;
    Ok((input, if t == 'v' { SmaliRegister::Local(n) } else { SmaliRegister::Parameter(n) }))
}

enum RegisterList {
    List(Vec<SmaliRegister>),
    Range(SmaliRegister, SmaliRegister),
}

/// `{v0, v1, p2}` or `{v0 .. v6}`
fn parse_register_list(input: &str) -> IResult<&str, RegisterList> {
    let (input, _) = terminated(char('{'), space0).parse(input)?;
    let range: IResult<&str, (SmaliRegister, SmaliRegister)> = pair(
        terminated(parse_register, delimited(space0, tag(".."), space0)),
        parse_register,
    )
    .parse(input);
    let (input, list) = match range {
        Ok((o, (start, end))) => (o, RegisterList::Range(start, end)),
        Err(_) => {
            let (o, l) = separated_list0(delimited(space0, char(','), space0), parse_register).parse(input)?;
            (o, RegisterList::List(l))
        }
    };
    let (input, _) = pair(space0, char('}')).parse(input)?;
    Ok((input, list))
}

fn is_label_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

fn parse_label(input: &str) -> IResult<&str, &str> {
    let (input, _) = char(':').parse(input)?;
    take_while1(is_label_char).parse(input)
}

enum Member {
    Method(MethodRef),
    Field(FieldRef),
}

/// `Lcom/a/B;->name(args)ret` or `Lcom/a/B;->name:Type`
fn parse_member_ref(input: &str) -> IResult<&str, Member> {
    let (input, class) = split_member(input)?;
    let (rest, name) = take_till1(|c: char| c == '(' || c == ':').parse(input)?;
    let class = ClassName::new(class);
    if let Ok((o, _)) = char::<&str, nom::error::Error<&str>>(':').parse(rest) {
        let (o, sig) = recognize(parse_typesignature).parse(o)?;
        return Ok((
            o,
            Member::Field(FieldRef {
                class,
                name: name.to_string(),
                descriptor: sig.to_string(),
            }),
        ));
    }
    let (o, sig) = recognize(parse_method_descriptor).parse(rest)?;
    Ok((
        o,
        Member::Method(MethodRef {
            class,
            name: name.to_string(),
            descriptor: sig.to_string(),
        }),
    ))
}

/// Places raw registers in the method frame: `pN` becomes `v(locals + N)`.
#[derive(Debug, Clone, Copy)]
struct Frame {
    registers: u16,
    locals: u16,
}

impl Frame {
    fn place(&self, r: SmaliRegister) -> Result<Register> {
        let abs = match r {
            SmaliRegister::Local(n) => n as u32,
            SmaliRegister::Parameter(n) => self.locals as u32 + n as u32,
        };
        if abs >= self.registers as u32 {
            let name = match r {
                SmaliRegister::Local(n) => format!("v{n}"),
                SmaliRegister::Parameter(n) => format!("p{n}"),
            };
            fail!("register {} is outside a frame of {} registers", name, self.registers);
        }
        Ok(Register(abs as u16))
    }

    fn place_list(&self, l: RegisterList) -> Result<Vec<Register>> {
        match l {
            RegisterList::List(regs) => regs.into_iter().map(|r| self.place(r)).collect(),
            RegisterList::Range(start, end) => {
                let (s, e) = (self.place(start)?, self.place(end)?);
                if e.0 < s.0 {
                    fail!("register range {{{} .. {}}} runs backwards", s, e);
                }
                Ok((s.0..=e.0).map(Register).collect())
            }
        }
    }
}

/// Decodes the operand list of one instruction.
fn parse_operands(text: &str, frame: &Frame) -> Result<Vec<Operand>> {
    let mut out = vec![];
    let mut input = text.trim();
    while !input.is_empty() {
        let (rest, operand) = parse_operand(input, frame)?;
        out.push(operand);
        let rest = rest.trim_start();
        input = match rest.strip_prefix(',') {
            Some(r) => r.trim_start(),
            None if rest.is_empty() => rest,
            None => fail!("unexpected `{}` after operand", rest),
        };
    }
    Ok(out)
}

fn parse_operand<'a>(input: &'a str, frame: &Frame) -> Result<(&'a str, Operand)> {
    if let Ok((o, l)) = parse_register_list(input) {
        return Ok((o, Operand::Regs(frame.place_list(l)?)));
    }
    if let Ok((o, s)) = quoted(input) {
        return Ok((o, Operand::Str(unescape(s)?)));
    }
    if let Ok((o, l)) = parse_label(input) {
        return Ok((o, Operand::Label(l.to_string())));
    }
    if input.contains("->") && (input.starts_with('L') || input.starts_with('[')) {
        return match parse_member_ref(input) {
            Ok((o, Member::Method(m))) => Ok((o, Operand::Method(m))),
            Ok((o, Member::Field(f))) => Ok((o, Operand::Field(f))),
            Err(_) => Err(malformed!("bad member reference `{}`", input)),
        };
    }
    // Registers before types: `v0` would otherwise never be seen, `V` alone is a type
    let reg: IResult<&str, SmaliRegister> =
        terminated(parse_register, not(take_while1(is_label_char))).parse(input);
    if let Ok((o, r)) = reg {
        return Ok((o, Operand::Reg(frame.place(r)?)));
    }
    if let Ok((o, t)) = recognize(parse_typesignature).parse(input) {
        return Ok((o, Operand::Type(t.to_string())));
    }
    if let Ok((o, i)) = parse_literal_int(input) {
        return Ok((o, Operand::Int(i)));
    }
    Err(malformed!("cannot parse operand `{}`", input))
}

/// Opcodes whose operands the analysis never looks at.
fn has_opaque_operands(opcode: &str) -> bool {
    opcode.starts_with("invoke-custom") || opcode.starts_with("invoke-polymorphic")
}

fn parse_modifiers(input: &str) -> IResult<&str, AccessFlags> {
    let mut flags = AccessFlags::empty();
    let mut input = input;
    loop {
        let word: IResult<&str, &str> =
            terminated(take_while1(|c: char| c.is_ascii_lowercase() || c == '-'), space1).parse(input);
        match word {
            Ok((o, w)) => match AccessFlags::from_keyword(w) {
                Some(f) => {
                    flags |= f;
                    input = o;
                }
                None => break,
            },
            Err(_) => break,
        }
    }
    Ok((input, flags))
}

/// `.class public final Lcom/a/B;`
fn parse_class_line(line: &str) -> IResult<&str, (AccessFlags, ClassName)> {
    let (input, _) = pair(tag(".class"), space1).parse(line)?;
    let (input, flags) = parse_modifiers(input)?;
    let (input, desc) = take_while1(|c: char| !c.is_whitespace()).parse(input)?;
    Ok((input, (flags, ClassName::new(desc))))
}

/// `.method public static constructor <clinit>()V`
fn parse_method_line(line: &str) -> IResult<&str, (AccessFlags, &str, MethodDescriptor)> {
    let (input, _) = pair(tag(".method"), space1).parse(line)?;
    let (input, flags) = parse_modifiers(input)?;
    let (input, name) = take_until("(").parse(input)?;
    let (input, descriptor) = parse_method_descriptor(input)?;
    Ok((input, (flags, name.trim(), descriptor)))
}

fn directive_value<'a>(line: &'a str, directive: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(directive)?;
    if rest.is_empty() || rest.starts_with(char::is_whitespace) {
        Some(rest.trim())
    } else {
        None
    }
}

/// Consumes lines up to and including `end`.
fn skip_block(lines: &mut SmaliLines, start: usize, end: &str) -> Result<()> {
    for (_, l) in lines.by_ref() {
        if l == end {
            return Ok(());
        }
    }
    Err(malformed!("line {}: missing `{}`", start, end))
}

/// Parses a complete smali document into a [`Class`].
pub(crate) fn parse_class(smali: &str) -> Result<Class> {
    let mut lines = SmaliLines::new(smali);

    let (access, name) = match lines.next() {
        Some((n, l)) => match parse_class_line(l) {
            Ok((_, c)) => c,
            Err(_) => fail!("line {}: expected a .class directive, found `{}`", n, l),
        },
        None => fail!("empty smali document"),
    };

    let mut class = Class {
        name,
        origin: ClassOrigin::Defined,
        access,
        super_class: None,
        interfaces: vec![],
        source: None,
        methods: vec![],
        strings: BTreeSet::new(),
    };

    while let Some((n, line)) = lines.next() {
        if let Some(v) = directive_value(line, ".super") {
            class.super_class = Some(ClassName::new(v));
        } else if let Some(v) = directive_value(line, ".implements") {
            class.interfaces.push(ClassName::new(v));
        } else if let Some(v) = directive_value(line, ".source") {
            class.source = match quoted(v) {
                Ok((_, s)) => Some(unescape(s).map_err(|e| at_line(n, e))?),
                Err(_) => Some(v.to_string()),
            };
        } else if directive_value(line, ".annotation").is_some() {
            skip_block(&mut lines, n, ".end annotation")?;
        } else if let Some(v) = directive_value(line, ".field") {
            // Only string initialisers matter: they are string constants of the class
            if let Some((_, init)) = v.split_once(" = ") {
                if let Ok((_, s)) = quoted(init.trim()) {
                    class.strings.insert(unescape(s).map_err(|e| at_line(n, e))?);
                }
            }
        } else if line == ".end field" {
            continue;
        } else if directive_value(line, ".method").is_some() {
            let method = parse_method(&mut lines, n, line, &class.name)?;
            for i in &method.instructions {
                if let Operation::Const {
                    value: Literal::String(s),
                    ..
                } = &i.op
                {
                    class.strings.insert(s.clone());
                }
            }
            class.methods.push(method);
        } else {
            fail!("line {}: unexpected `{}` at class level", n, line);
        }
    }

    Ok(class)
}

/// Where a label is referenced from, so the merge points of a method can be derived.
enum LabelUse {
    Branch,
    SwitchPayload,
    Switch,
    CatchHandler,
    TryBoundary,
}

fn parse_method(lines: &mut SmaliLines, start: usize, header: &str, class: &ClassName) -> Result<Method> {
    let (access, name, descriptor) = match parse_method_line(header) {
        Ok((_, m)) => m,
        Err(_) => fail!("line {}: bad method header `{}`", start, header),
    };
    let name = name.to_string();

    // Parameter registers include the implicit `this`
    let params = descriptor.argument_registers() + usize::from(!access.contains(AccessFlags::STATIC));
    let params = u16::try_from(params).map_err(|_| malformed!("line {}: too many parameters", start))?;

    let mut frame: Option<Frame> = None;
    let mut instructions: Vec<Instruction> = vec![];
    let mut labels: HashMap<String, usize> = HashMap::new();
    let mut uses: Vec<(usize, String, LabelUse)> = vec![];
    let mut pending_labels: Vec<String> = vec![];
    let mut payload_labels: BTreeSet<String> = BTreeSet::new();
    let mut line_no: Option<u32> = None;

    loop {
        let Some((n, line)) = lines.next() else {
            fail!("line {}: method {} is truncated, missing `.end method`", start, name);
        };

        if line == ".end method" {
            break;
        }

        if let Some(v) = directive_value(line, ".locals") {
            let locals = count(v, n)?;
            frame = Some(Frame {
                registers: locals
                    .checked_add(params)
                    .ok_or_else(|| malformed!("line {}: frame too large", n))?,
                locals,
            });
        } else if let Some(v) = directive_value(line, ".registers") {
            let registers = count(v, n)?;
            let Some(locals) = registers.checked_sub(params) else {
                fail!("line {}: {} registers cannot hold {} parameter registers", n, registers, params);
            };
            frame = Some(Frame { registers, locals });
        } else if let Some(v) = directive_value(line, ".line") {
            line_no = v.parse::<u32>().ok();
        } else if directive_value(line, ".annotation").is_some() {
            skip_block(lines, n, ".end annotation")?;
        } else if [
            ".param",
            ".parameter",
            ".end param",
            ".end parameter",
            ".prologue",
            ".epilogue",
            ".local",
            ".end local",
            ".restart local",
            ".source",
        ]
        .iter()
        .any(|d| directive_value(line, d).is_some())
        {
            continue;
        } else if let Some(l) = line.strip_prefix(':') {
            if labels.insert(l.to_string(), instructions.len()).is_some() {
                fail!("line {}: label :{} defined twice", n, l);
            }
            pending_labels.push(l.to_string());
            continue;
        } else if let Some(v) = directive_value(line, ".catch").or_else(|| directive_value(line, ".catchall")) {
            for (ix, l) in v.split(|c: char| c.is_whitespace() || c == '{' || c == '}').filter(|t| t.starts_with(':')).enumerate() {
                let use_kind = if ix < 2 { LabelUse::TryBoundary } else { LabelUse::CatchHandler };
                uses.push((n, l[1..].to_string(), use_kind));
            }
        } else if directive_value(line, ".packed-switch").is_some() || line == ".sparse-switch" {
            let end = if line == ".sparse-switch" { ".end sparse-switch" } else { ".end packed-switch" };
            payload_labels.extend(pending_labels.drain(..));
            parse_switch_payload(lines, n, end, &mut uses)?;
        } else if directive_value(line, ".array-data").is_some() {
            payload_labels.extend(pending_labels.drain(..));
            skip_block(lines, n, ".end array-data")?;
        } else if line.starts_with('.') {
            fail!("line {}: unexpected directive `{}` in method {}", n, line, name);
        } else {
            let Some(frame) = frame else {
                fail!("line {}: instruction before .locals/.registers in method {}", n, name);
            };
            let instruction = parse_instruction(line, &frame, instructions.len(), line_no).map_err(|e| at_line(n, e))?;
            if let Operation::Branch { target, .. } = &instruction.op {
                let kind = if instruction.opcode.ends_with("-switch") { LabelUse::Switch } else { LabelUse::Branch };
                uses.push((n, target.clone(), kind));
            }
            instructions.push(instruction);
        }
        pending_labels.clear();
    }

    // Every referenced label must exist and switches must point at a payload
    let mut merge_points = BTreeSet::new();
    for (n, l, kind) in uses {
        let Some(&target) = labels.get(&l) else {
            fail!("line {}: label :{} is never defined in method {}", n, l, name);
        };
        match kind {
            LabelUse::Switch if !payload_labels.contains(&l) => {
                fail!("line {}: switch refers to :{} which is not a switch payload", n, l)
            }
            LabelUse::Branch | LabelUse::SwitchPayload | LabelUse::CatchHandler => {
                merge_points.insert(target);
            }
            _ => {}
        }
    }

    let frame = frame.unwrap_or(Frame {
        registers: params,
        locals: 0,
    });

    Ok(Method {
        class: class.clone(),
        name,
        descriptor,
        access,
        registers: frame.registers,
        locals: frame.locals,
        instructions,
        labels,
        merge_points,
        external: false,
    })
}

fn count(v: &str, n: usize) -> Result<u16> {
    match parse_literal_int(v) {
        Ok(("", c)) => u16::try_from(c).map_err(|_| malformed!("line {}: bad register count `{}`", n, v)),
        _ => Err(malformed!("line {}: bad register count `{}`", n, v)),
    }
}

/// Collects the case targets of a `.packed-switch` / `.sparse-switch` payload.
fn parse_switch_payload(lines: &mut SmaliLines, start: usize, end: &str, uses: &mut Vec<(usize, String, LabelUse)>) -> Result<()> {
    for (n, l) in lines.by_ref() {
        if l == end {
            return Ok(());
        }
        // packed: `:pswitch_0`, sparse: `0x1 -> :sswitch_0`
        let target = match l.rsplit_once("->") {
            Some((_, t)) => t.trim(),
            None => l,
        };
        match parse_label(target) {
            Ok(("", label)) => uses.push((n, label.to_string(), LabelUse::SwitchPayload)),
            _ => fail!("line {}: bad switch case `{}`", n, l),
        }
    }
    Err(malformed!("line {}: missing `{}`", start, end))
}

/// Parses one instruction line into an [`Instruction`] at `offset`.
fn parse_instruction(line: &str, frame: &Frame, offset: usize, source_line: Option<u32>) -> Result<Instruction> {
    let (rest, opcode) = match take_while1::<_, &str, nom::error::Error<&str>>(|c: char| c.is_alphanumeric() || c == '-' || c == '/')
        .parse(line)
    {
        Ok(r) => r,
        Err(_) => fail!("cannot parse instruction `{}`", line),
    };

    let operands = if has_opaque_operands(opcode) {
        vec![Operand::Opaque]
    } else if opcode.starts_with("const-method") {
        // Only the destination register is of interest
        let first = rest.split(',').next().unwrap_or_default();
        parse_operands(first, frame)?
    } else {
        parse_operands(rest, frame)?
    };

    Ok(Instruction {
        offset,
        opcode: opcode.to_string(),
        op: lift(opcode, &operands)?,
        line: source_line,
    })
}
