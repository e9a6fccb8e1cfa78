//! Command execution, reflection, cryptography and native libraries.

use super::{argument, traced_calls, Category, Finding};
use crate::error::Result;
use crate::index::Index;
use std::collections::BTreeSet;

/// `Runtime.exec(...)`, with the command when it can be traced.
pub fn detect_command_execution(index: &Index) -> Result<Option<Finding>> {
    let mut evidence = BTreeSet::new();
    for bindings in traced_calls(index, "Ljava/lang/Runtime", "exec")? {
        let line = match argument(&bindings, 0) {
            Some(command) => format!("This application executes a UNIX command containing this argument: '{command}'"),
            None => "This application executes a UNIX command".to_string(),
        };
        evidence.insert(line);
    }
    Ok(Finding::collapse(Category::CodeExecution, "exec", evidence))
}

/// `Method.invoke(receiver, args)`
pub fn detect_reflection(index: &Index) -> Result<Option<Finding>> {
    let mut evidence = BTreeSet::new();
    for bindings in traced_calls(index, "java.lang.reflect.Method", "invoke")? {
        let line = match (argument(&bindings, 0), argument(&bindings, 1)) {
            (Some(object), Some(args)) => format!("Reflection containing this argument: '{object}' '{args}'"),
            _ => "Reflection".to_string(),
        };
        evidence.insert(line);
    }
    Ok(Finding::collapse(Category::CodeExecution, "Reflection", evidence))
}

/// Any use of a `javax.crypto` class.
pub fn detect_cryptography(index: &Index) -> Result<Option<Finding>> {
    let evidence: BTreeSet<String> = index
        .find_classes("Ljavax/crypto/.*")?
        .iter()
        .map(|c| c.name.as_java_type())
        .collect();
    Ok(Finding::collapse(Category::CodeExecution, "Cryptography", evidence))
}

/// Names passed to `System.loadLibrary`, unresolved names are left out.
pub fn gather_loaded_libraries(index: &Index) -> Result<Vec<String>> {
    let mut libraries = BTreeSet::new();
    for bindings in traced_calls(index, "Ljava/lang/System", "loadLibrary")? {
        if let [b] = bindings.as_slice() {
            if let Some(name) = b.value.as_str() {
                libraries.insert(name.to_string());
            }
        }
    }
    Ok(libraries.into_iter().collect())
}

pub fn detect_library_loading(index: &Index) -> Result<Option<Finding>> {
    let libraries = gather_loaded_libraries(index)?;
    Ok(Finding::collapse(Category::CodeExecution, "LoadLibrary", libraries.into_iter().collect()))
}
