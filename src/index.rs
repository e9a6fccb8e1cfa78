//! The bytecode index: every class, method and instruction of a package, built once and
//! queried read-only afterwards.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::instructions::{Instruction, Literal, Operation, Register};
use crate::pattern::ClassPattern;
use crate::smali_parse::parse_class;
use crate::types::{AccessFlags, ClassName, MethodDescriptor};
use dashmap::DashMap;
use log::debug;
use once_cell::sync::OnceCell;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One disassembled unit: the text of a `.smali` file and where it came from.
#[derive(Debug, Clone)]
pub struct SmaliUnit {
    pub origin: Option<PathBuf>,
    pub text: String,
}

impl SmaliUnit {
    pub fn new(text: impl Into<String>) -> SmaliUnit {
        SmaliUnit {
            origin: None,
            text: text.into(),
        }
    }

    pub fn read_from_file(path: &Path) -> Result<SmaliUnit> {
        let text = std::fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(SmaliUnit {
            origin: Some(path.to_path_buf()),
            text,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClassOrigin {
    /// Read from a unit of the package
    Defined,
    /// Only referenced by the package, e.g. framework classes
    External,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Class {
    pub name: ClassName,
    pub origin: ClassOrigin,
    pub access: AccessFlags,
    pub super_class: Option<ClassName>,
    pub interfaces: Vec<ClassName>,
    pub source: Option<String>,
    pub methods: Vec<Method>,
    /// String constants loaded by the class's code or used as field initialisers
    pub strings: BTreeSet<String>,
}

impl Class {
    pub fn is_external(&self) -> bool {
        self.origin == ClassOrigin::External
    }

    pub fn method(&self, name: &str) -> impl Iterator<Item = &Method> {
        let name = name.to_string();
        self.methods.iter().filter(move |m| m.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Method {
    pub class: ClassName,
    pub name: String,
    pub descriptor: MethodDescriptor,
    pub access: AccessFlags,
    /// Size of the register frame
    pub registers: u16,
    /// Registers below the parameter area
    pub locals: u16,
    pub instructions: Vec<Instruction>,
    pub(crate) labels: HashMap<String, usize>,
    pub(crate) merge_points: BTreeSet<usize>,
    /// A stub for a method that is referenced but not defined in the package
    pub external: bool,
}

impl Method {
    fn stub(class: &ClassName, name: &str, descriptor: MethodDescriptor) -> Method {
        Method {
            class: class.clone(),
            name: name.to_string(),
            descriptor,
            access: AccessFlags::empty(),
            registers: 0,
            locals: 0,
            instructions: vec![],
            labels: HashMap::new(),
            merge_points: BTreeSet::new(),
            external: true,
        }
    }

    pub fn is_static(&self) -> bool {
        self.access.contains(AccessFlags::STATIC)
    }

    pub fn instruction(&self, offset: usize) -> Option<&Instruction> {
        self.instructions.get(offset)
    }

    /// Offset of the instruction following `label`.
    pub fn label_offset(&self, label: &str) -> Option<usize> {
        self.labels.get(label.trim_start_matches(':')).copied()
    }

    /// True if control can reach `offset` from somewhere other than the previous instruction.
    pub fn is_merge_point(&self, offset: usize) -> bool {
        self.merge_points.contains(&offset)
    }

    /// The smali spelling of a register in this frame, `p0` for the first parameter register.
    pub fn register_name(&self, r: Register) -> String {
        if r.0 >= self.locals {
            format!("p{}", r.0 - self.locals)
        } else {
            format!("v{}", r.0)
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}{}", self.class, self.name, self.descriptor)
    }
}

/// Position of one instruction in the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CodeLocation {
    pub class: usize,
    pub method: usize,
    pub offset: usize,
}

/// A method loading a given string constant.
#[derive(Debug, Clone, Copy)]
pub struct StringReference<'a> {
    pub method: &'a Method,
    pub offset: usize,
}

impl StringReference<'_> {
    pub fn instruction(&self) -> Option<&Instruction> {
        self.method.instruction(self.offset)
    }
}

/// Memoised pattern matches, owned by one index.
///
/// Entries are never evicted: the cache holds one entry per distinct pattern queried and
/// is dropped with the index.
#[derive(Debug, Default)]
struct QueryCache {
    classes: DashMap<String, Arc<[usize]>>,
}

/// The index over a package.
///
/// # Examples
///
/// ```
///  use smali_warn::Index;
///
///  let smali = r#"
///  .class public Lcom/test/A;
///  .super Ljava/lang/Object;
///
///  .method public static foo()V
///      .locals 1
///      const-string v0, "hello"
///      invoke-static {v0}, Lcom/test/Log;->log(Ljava/lang/String;)V
///      return-void
///  .end method
///  "#;
///  let index = Index::from_smali(&[smali]).unwrap();
///  assert_eq!(index.find_methods("com.test.A", "foo").unwrap().len(), 1);
///  assert_eq!(index.find_string_references("hello").len(), 1);
///
///  // Referenced framework classes are known too
///  assert!(index.find_classes("Lcom/test/Log;").unwrap()[0].is_external());
/// ```
#[derive(Debug)]
pub struct Index {
    classes: Vec<Class>,
    by_name: HashMap<ClassName, usize>,
    call_targets: HashMap<(ClassName, String), Vec<CodeLocation>>,
    strings: OnceCell<HashMap<String, Vec<CodeLocation>>>,
    cache: QueryCache,
    config: Config,
}

impl Index {
    /// Builds an index from a set of units with the default [`Config`].
    pub fn build(units: &[SmaliUnit]) -> Result<Index> {
        Index::build_with(units, &Config::default())
    }

    /// Builds an index. Either every unit is well formed and the index is returned, or
    /// the first problem is reported and nothing is built.
    pub fn build_with(units: &[SmaliUnit], config: &Config) -> Result<Index> {
        let defined = match config.threads {
            Some(n) => {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(n)
                    .build()
                    .map_err(|e| Error::Config(e.to_string()))?;
                pool.install(|| parse_units(units))?
            }
            None => parse_units(units)?,
        };

        let mut classes: BTreeMap<ClassName, Class> = BTreeMap::new();
        for (n, (unit, class)) in units.iter().zip(defined).enumerate() {
            if classes.contains_key(&class.name) {
                return Err(malformed!("class {} is defined more than once", class.name)
                    .with_origin(&unit_origin(unit, n)));
            }
            classes.insert(class.name.clone(), class);
        }
        let defined_count = classes.len();

        // Synthesise every class that is called or accessed but not part of the package
        let mut external: BTreeMap<ClassName, BTreeMap<(String, String), MethodDescriptor>> = BTreeMap::new();
        for class in classes.values() {
            for method in &class.methods {
                for i in &method.instructions {
                    match &i.op {
                        Operation::Invoke { target, .. } if !classes.contains_key(&target.class) => {
                            let descriptor = target.descriptor()?;
                            external
                                .entry(target.class.clone())
                                .or_default()
                                .insert((target.name.clone(), target.descriptor.clone()), descriptor);
                        }
                        Operation::FieldGet { field, .. } | Operation::FieldPut { field, .. }
                            if !classes.contains_key(&field.class) =>
                        {
                            external.entry(field.class.clone()).or_default();
                        }
                        _ => {}
                    }
                }
            }
        }
        for (name, methods) in external {
            let methods = methods
                .into_iter()
                .map(|((method, _), descriptor)| Method::stub(&name, &method, descriptor))
                .collect();
            classes.insert(
                name.clone(),
                Class {
                    name,
                    origin: ClassOrigin::External,
                    access: AccessFlags::empty(),
                    super_class: None,
                    interfaces: vec![],
                    source: None,
                    methods,
                    strings: BTreeSet::new(),
                },
            );
        }

        let classes: Vec<Class> = classes.into_values().collect();
        let by_name = classes.iter().enumerate().map(|(ix, c)| (c.name.clone(), ix)).collect();

        let mut call_targets: HashMap<(ClassName, String), Vec<CodeLocation>> = HashMap::new();
        for (ci, class) in classes.iter().enumerate() {
            for (mi, method) in class.methods.iter().enumerate() {
                for i in &method.instructions {
                    if let Operation::Invoke { target, .. } = &i.op {
                        call_targets
                            .entry((target.class.clone(), target.name.clone()))
                            .or_default()
                            .push(CodeLocation {
                                class: ci,
                                method: mi,
                                offset: i.offset,
                            });
                    }
                }
            }
        }

        debug!(
            "indexed {} classes ({} external), {} call targets",
            classes.len(),
            classes.len() - defined_count,
            call_targets.len()
        );

        Ok(Index {
            classes,
            by_name,
            call_targets,
            strings: OnceCell::new(),
            cache: QueryCache::default(),
            config: config.clone(),
        })
    }

    /// Builds an index from smali documents held in memory.
    pub fn from_smali(documents: &[&str]) -> Result<Index> {
        let units: Vec<SmaliUnit> = documents.iter().map(|d| SmaliUnit::new(*d)).collect();
        Index::build(&units)
    }

    /// Builds an index from every `.smali` file below `dir`, e.g. an apktool output folder.
    pub fn from_dir(dir: &Path) -> Result<Index> {
        Index::build(&crate::load_smali_dir(dir)?)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// All classes, defined and external, ordered by name.
    pub fn classes(&self) -> &[Class] {
        &self.classes
    }

    pub(crate) fn class(&self, name: &ClassName) -> Option<&Class> {
        self.by_name.get(name).map(|ix| &self.classes[*ix])
    }

    pub(crate) fn class_at(&self, ix: usize) -> &Class {
        &self.classes[ix]
    }

    pub(crate) fn method_at(&self, loc: &CodeLocation) -> Option<&Method> {
        self.classes.get(loc.class)?.methods.get(loc.method)
    }

    /// Classes matching an exact name (in any spelling) or a regular expression.
    pub fn find_classes(&self, pattern: &str) -> Result<Vec<&Class>> {
        Ok(self.matching_classes(pattern)?.iter().map(|ix| &self.classes[*ix]).collect())
    }

    /// Methods called `method_name` in every class matching `class_pattern`.
    pub fn find_methods(&self, class_pattern: &str, method_name: &str) -> Result<Vec<&Method>> {
        let mut out = vec![];
        for ix in self.matching_classes(class_pattern)?.iter() {
            out.extend(self.classes[*ix].method(method_name));
        }
        Ok(out)
    }

    /// Every instruction loading exactly `literal`.
    pub fn find_string_references(&self, literal: &str) -> Vec<StringReference<'_>> {
        let table = self.strings.get_or_init(|| self.string_table());
        match table.get(literal) {
            Some(locs) => locs
                .iter()
                .filter_map(|l| {
                    Some(StringReference {
                        method: self.method_at(l)?,
                        offset: l.offset,
                    })
                })
                .collect(),
            None => vec![],
        }
    }

    /// Invoke sites whose target is `class`.`method_name`, in index order.
    pub(crate) fn call_sites_of(&self, class: &ClassName, method_name: &str) -> &[CodeLocation] {
        match self.call_targets.get(&(class.clone(), method_name.to_string())) {
            Some(v) => v,
            None => &[],
        }
    }

    pub(crate) fn matching_classes(&self, pattern: &str) -> Result<Arc<[usize]>> {
        if let Some(hit) = self.cache.classes.get(pattern) {
            return Ok(hit.value().clone());
        }

        // Failed compilations are not cached so a bad pattern only affects its own query
        let matched: Arc<[usize]> = match ClassPattern::new(pattern)? {
            ClassPattern::Exact(name) => self.by_name.get(&name).copied().into_iter().collect(),
            re => self
                .classes
                .iter()
                .enumerate()
                .filter(|(_, c)| re.matches(&c.name))
                .map(|(ix, _)| ix)
                .collect(),
        };
        self.cache.classes.insert(pattern.to_string(), matched.clone());
        Ok(matched)
    }

    fn string_table(&self) -> HashMap<String, Vec<CodeLocation>> {
        let mut table: HashMap<String, Vec<CodeLocation>> = HashMap::new();
        for (ci, class) in self.classes.iter().enumerate() {
            for (mi, method) in class.methods.iter().enumerate() {
                for i in &method.instructions {
                    if let Operation::Const {
                        value: Literal::String(s),
                        ..
                    } = &i.op
                    {
                        table.entry(s.clone()).or_default().push(CodeLocation {
                            class: ci,
                            method: mi,
                            offset: i.offset,
                        });
                    }
                }
            }
        }
        debug!("string reference table holds {} constants", table.len());
        table
    }
}

fn unit_origin(unit: &SmaliUnit, ordinal: usize) -> String {
    match &unit.origin {
        Some(p) => p.display().to_string(),
        None => format!("unit {ordinal}"),
    }
}

fn parse_units(units: &[SmaliUnit]) -> Result<Vec<Class>> {
    units
        .par_iter()
        .enumerate()
        .map(|(n, u)| parse_class(&u.text).map_err(|e| e.with_origin(&unit_origin(u, n))))
        .collect()
}
