/* Class names, descriptors and member references shared by the reader, the index and the resolver */
/* Class names are stored in the smali internal form without the `L` and `;` e.g. java/lang/Object */

use crate::error::{Error, Result};
use bitflags::bitflags;
use nom::branch::alt;
use nom::bytes::complete::{tag, take_until};
use nom::character::complete::char;
use nom::error::ErrorKind;
use nom::multi::many0;
use nom::{IResult, Parser};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A fully-qualified class name in canonical form.
///
/// Call sites spell class names as descriptors (`Landroid/telephony/SmsManager;`), manifests
/// and users spell them in Java form (`android.telephony.SmsManager`) and detector rules
/// often drop the trailing semicolon (`Landroid/telephony/SmsManager`). All of these
/// normalise to the same value.
///
/// # Examples
///
/// ```
///  use smali_warn::types::ClassName;
///
///  let a = ClassName::new("Landroid/telephony/SmsManager;");
///  let b = ClassName::new("android.telephony.SmsManager");
///  let c = ClassName::new("Landroid/telephony/SmsManager");
///  assert_eq!(a, b);
///  assert_eq!(b, c);
///  assert_eq!(a.as_jni_type(), "Landroid/telephony/SmsManager;");
///  assert_eq!(a.as_java_type(), "android.telephony.SmsManager");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClassName(String);

impl ClassName {
    pub fn new(name: &str) -> ClassName {
        let t = name.trim();

        // Array descriptors are kept verbatim, they are only ever call targets (e.g. clone())
        if t.starts_with('[') {
            return ClassName(t.to_string());
        }

        let is_descriptor = t.starts_with('L') && (t.ends_with(';') || t.contains('/'));
        let body = if is_descriptor {
            let t = &t[1..];
            t.strip_suffix(';').unwrap_or(t)
        } else {
            t
        };
        ClassName(body.replace('.', "/"))
    }

    /// Resolves a manifest component name against its package.
    ///
    /// `.SmsReceiver` and `SmsReceiver` are relative to `package`, a name containing a dot is
    /// taken as fully qualified.
    pub fn from_component(package: &str, name: &str) -> Result<ClassName> {
        let name = name.trim();
        if name.is_empty() || name == "." {
            return Err(Error::pattern(name, "empty component name"));
        }
        let full = if let Some(rest) = name.strip_prefix('.') {
            format!("{}.{}", package.trim(), rest)
        } else if !name.contains('.') {
            format!("{}.{}", package.trim(), name)
        } else {
            name.to_string()
        };
        Ok(ClassName::new(&full))
    }

    /// The internal slashed form, e.g. `java/lang/Object`.
    pub fn as_internal(&self) -> &str {
        &self.0
    }

    pub fn as_jni_type(&self) -> String {
        if self.0.starts_with('[') {
            return self.0.clone();
        }
        format!("L{};", self.0)
    }

    pub fn as_java_type(&self) -> String {
        self.0.replace('/', ".")
    }

    /// The package part in slashed form, empty for the default package.
    pub fn package(&self) -> &str {
        match self.0.rfind('/') {
            Some(ix) => &self.0[..ix],
            None => "",
        }
    }
}

impl fmt::Display for ClassName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_jni_type())
    }
}

/// The kind of a single parameter or return type in a method descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeSignature {
    Array(Box<TypeSignature>),
    Object(ClassName),
    Int,
    Bool,
    Byte,
    Char,
    Short,
    Long,
    Float,
    Double,
    Void,
}

impl TypeSignature {
    /// Long and double values occupy a register pair.
    pub fn is_wide(&self) -> bool {
        matches!(self, TypeSignature::Long | TypeSignature::Double)
    }

    /// Number of registers a value of this type takes as an argument.
    pub fn register_width(&self) -> usize {
        if self.is_wide() {
            2
        } else {
            1
        }
    }

    pub fn to_jni(&self) -> String {
        match self {
            TypeSignature::Array(a) => "[".to_string() + &a.to_jni(),
            TypeSignature::Object(o) => o.as_jni_type(),
            TypeSignature::Int => "I".to_string(),
            TypeSignature::Bool => "Z".to_string(),
            TypeSignature::Byte => "B".to_string(),
            TypeSignature::Char => "C".to_string(),
            TypeSignature::Short => "S".to_string(),
            TypeSignature::Long => "J".to_string(),
            TypeSignature::Float => "F".to_string(),
            TypeSignature::Double => "D".to_string(),
            TypeSignature::Void => "V".to_string(),
        }
    }
}

/// A method descriptor: argument types and a return type, e.g. `(Ljava/lang/String;J)V`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodDescriptor {
    pub args: Vec<TypeSignature>,
    pub result: TypeSignature,
}

impl MethodDescriptor {
    pub fn parse(s: &str) -> Result<MethodDescriptor> {
        match parse_method_descriptor(s.trim()) {
            Ok(("", m)) => Ok(m),
            Ok((rest, _)) => Err(malformed!("trailing `{}` after method descriptor `{}`", rest, s)),
            Err(_) => Err(malformed!("bad method descriptor `{}`", s)),
        }
    }

    /// Registers taken by the declared arguments, excluding any receiver.
    pub fn argument_registers(&self) -> usize {
        self.args.iter().map(TypeSignature::register_width).sum()
    }

    pub fn to_jni(&self) -> String {
        let mut s = "(".to_string();
        for a in &self.args {
            s.push_str(&a.to_jni());
        }
        s.push(')');
        s.push_str(&self.result.to_jni());
        s
    }
}

impl fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_jni())
    }
}

/// A symbolic reference to a method as it appears in an invoke instruction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodRef {
    pub class: ClassName,
    pub name: String,
    pub descriptor: String,
}

impl MethodRef {
    pub fn descriptor(&self) -> Result<MethodDescriptor> {
        MethodDescriptor::parse(&self.descriptor)
    }
}

impl fmt::Display for MethodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Example: Landroid/telephony/SmsManager;->sendTextMessage(Ljava/lang/String;...)V
        write!(f, "{}->{}{}", self.class, self.name, self.descriptor)
    }
}

/// A symbolic reference to a field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldRef {
    pub class: ClassName,
    pub name: String,
    pub descriptor: String,
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}:{}", self.class, self.name, self.descriptor)
    }
}

bitflags! {
    /// Class and method access flags, as written in `.class` and `.method` lines.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct AccessFlags: u32 {
        const PUBLIC = 0x1;
        const PRIVATE = 0x2;
        const PROTECTED = 0x4;
        const STATIC = 0x8;
        const FINAL = 0x10;
        const SYNCHRONIZED = 0x20;
        const VOLATILE = 0x40;
        const BRIDGE = 0x40;
        const TRANSIENT = 0x80;
        const VARARGS = 0x80;
        const NATIVE = 0x100;
        const INTERFACE = 0x200;
        const ABSTRACT = 0x400;
        const STRICT = 0x800;
        const SYNTHETIC = 0x1000;
        const ANNOTATION = 0x2000;
        const ENUM = 0x4000;
        const CONSTRUCTOR = 0x10000;
        const DECLARED_SYNCHRONIZED = 0x20000;
    }
}

impl AccessFlags {
    /// Maps a smali modifier keyword to its flag.
    pub fn from_keyword(s: &str) -> Option<AccessFlags> {
        Some(match s {
            "public" => Self::PUBLIC,
            "private" => Self::PRIVATE,
            "protected" => Self::PROTECTED,
            "static" => Self::STATIC,
            "final" => Self::FINAL,
            "synchronized" => Self::SYNCHRONIZED,
            "volatile" => Self::VOLATILE,
            "bridge" => Self::BRIDGE,
            "transient" => Self::TRANSIENT,
            "varargs" => Self::VARARGS,
            "native" => Self::NATIVE,
            "interface" => Self::INTERFACE,
            "abstract" => Self::ABSTRACT,
            "strict" => Self::STRICT,
            "synthetic" => Self::SYNTHETIC,
            "annotation" => Self::ANNOTATION,
            "enum" => Self::ENUM,
            "constructor" => Self::CONSTRUCTOR,
            "declared-synchronized" => Self::DECLARED_SYNCHRONIZED,
            _ => return None,
        })
    }
}

pub(crate) fn parse_typesignature(smali: &str) -> IResult<&str, TypeSignature> {
    // Object
    let l: IResult<&str, &str> = tag("L").parse(smali);
    if let Ok((o, _)) = l {
        let (o, t) = take_until(";").parse(o)?;
        let (o, _) = char(';').parse(o)?;
        return Ok((o, TypeSignature::Object(ClassName(t.to_string()))));
    }

    // Array
    let b: IResult<&str, &str> = tag("[").parse(smali);
    if let Ok((o, _)) = b {
        let (o, t) = parse_typesignature(o)?;
        return Ok((o, TypeSignature::Array(Box::new(t))));
    }

    // Primitive type
    let p: IResult<&str, &str> = alt((
        tag("Z"),
        tag("B"),
        tag("C"),
        tag("S"),
        tag("I"),
        tag("J"),
        tag("F"),
        tag("D"),
        tag("V"),
    ))
    .parse(smali);
    if let Ok((o, t)) = p {
        let ts = match t {
            "Z" => TypeSignature::Bool,
            "B" => TypeSignature::Byte,
            "C" => TypeSignature::Char,
            "S" => TypeSignature::Short,
            "I" => TypeSignature::Int,
            "J" => TypeSignature::Long,
            "F" => TypeSignature::Float,
            "D" => TypeSignature::Double,
            _ => TypeSignature::Void,
        };
        return Ok((o, ts));
    }

    Err(nom::Err::Error(nom::error::Error {
        input: smali,
        code: ErrorKind::Complete,
    }))
}

pub(crate) fn parse_method_descriptor(smali: &str) -> IResult<&str, MethodDescriptor> {
    let (o, _) = tag("(").parse(smali)?;
    let (o, args) = many0(parse_typesignature).parse(o)?;
    let (o, _) = tag(")").parse(o)?;
    let (o, result) = parse_typesignature(o)?;
    Ok((o, MethodDescriptor { args, result }))
}

/// Splits `Lcom/a/B;->member...` into the class descriptor and the member part.
pub(crate) fn split_member(smali: &str) -> IResult<&str, &str> {
    let (o, class) = take_until("->").parse(smali)?;
    let (o, _) = tag("->").parse(o)?;
    Ok((o, class))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_name_spellings() {
        let expected = "com/basic/Test";
        for s in ["Lcom/basic/Test;", "Lcom/basic/Test", "com.basic.Test", "com/basic/Test", " Lcom/basic/Test; "] {
            assert_eq!(ClassName::new(s).as_internal(), expected, "{s}");
        }
        assert_eq!(ClassName::new("com.basic.Test$Inner").as_jni_type(), "Lcom/basic/Test$Inner;");
        assert_eq!(ClassName::new("Lcom/basic/Test;").package(), "com/basic");
    }

    #[test]
    fn class_name_without_package_starting_with_l() {
        // No slash and no semicolon: a Java simple name, not a descriptor
        let c = ClassName::new("LoginActivity");
        assert_eq!(c.as_jni_type(), "LLoginActivity;");
        assert_eq!(c.package(), "");
    }

    #[test]
    fn array_class_name_kept() {
        let c = ClassName::new("[Ljava/lang/Object;");
        assert_eq!(c.as_jni_type(), "[Ljava/lang/Object;");
    }

    #[test]
    fn component_names() {
        let c = ClassName::from_component("com.test", ".Interceptor").unwrap();
        assert_eq!(c.as_jni_type(), "Lcom/test/Interceptor;");
        let c = ClassName::from_component("com.test", "Interceptor").unwrap();
        assert_eq!(c.as_jni_type(), "Lcom/test/Interceptor;");
        let c = ClassName::from_component("com.test", "org.other.Receiver").unwrap();
        assert_eq!(c.as_jni_type(), "Lorg/other/Receiver;");
        assert!(ClassName::from_component("com.test", "").is_err());
    }

    #[test]
    fn descriptor_widths() {
        let m = MethodDescriptor::parse("(Ljava/lang/String;JI[DLandroid/app/PendingIntent;)V").unwrap();
        assert_eq!(m.args.len(), 5);
        assert_eq!(m.argument_registers(), 6);
        assert_eq!(m.result, TypeSignature::Void);
        assert_eq!(m.to_jni(), "(Ljava/lang/String;JI[DLandroid/app/PendingIntent;)V");
    }

    #[test]
    fn descriptor_errors() {
        assert!(MethodDescriptor::parse("(Ljava/lang/String").is_err());
        assert!(MethodDescriptor::parse("(I)Vjunk").is_err());
        assert!(MethodDescriptor::parse("(Q)V").is_err());
    }

    #[test]
    fn access_flag_keywords() {
        let f = ["public", "static", "final"]
            .iter()
            .filter_map(|k| AccessFlags::from_keyword(k))
            .fold(AccessFlags::empty(), |a, b| a | b);
        assert!(f.contains(AccessFlags::STATIC));
        assert!(!f.contains(AccessFlags::PRIVATE));
        assert!(AccessFlags::from_keyword("bogus").is_none());
    }
}
