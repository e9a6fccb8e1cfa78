//! Behaviour detectors built on the index, the locator and the resolver.
//!
//! Each detector returns at most one [`Finding`]: a short behaviour label plus the
//! deduplicated, sorted evidence that led to it. [`scan`] runs them all; a detector that
//! fails is logged and skipped so the others still report.

use crate::error::Result;
use crate::index::Index;
use crate::locator::locate_calls;
use crate::resolver::{resolve, RegisterBinding, ResolvedValue};
use log::{debug, error};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

pub mod code_execution;
pub mod telephony;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Category {
    TelephonyServices,
    CodeExecution,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Category::TelephonyServices => write!(f, "telephony services abuse"),
            Category::CodeExecution => write!(f, "code execution"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub category: Category,
    /// e.g. `sendTextMessage`, `SMSInterception`, `Reflection`
    pub label: String,
    pub evidence: Vec<String>,
}

impl Finding {
    /// `None` when there is no evidence at all.
    pub(crate) fn collapse(category: Category, label: &str, evidence: BTreeSet<String>) -> Option<Finding> {
        if evidence.is_empty() {
            return None;
        }
        Some(Finding {
            category,
            label: label.to_string(),
            evidence: evidence.into_iter().collect(),
        })
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.category, self.label)
    }
}

/// The parts of `AndroidManifest.xml` the detectors look at, decoded by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Manifest {
    pub package: String,
    pub receivers: Vec<Receiver>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Receiver {
    /// Component name as written, `.SmsReceiver` or fully qualified
    pub name: String,
    pub intent_filters: Vec<IntentFilter>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntentFilter {
    pub priority: Option<String>,
    pub actions: Vec<String>,
}

/// Resolves every call to `class_pattern`.`method_name`, one binding list per call site.
pub(crate) fn traced_calls(index: &Index, class_pattern: &str, method_name: &str) -> Result<Vec<Vec<RegisterBinding>>> {
    let calls = locate_calls(class_pattern, method_name, index)?;
    calls.iter().map(|c| resolve(c, index)).collect()
}

/// The value of argument `n`, if the call passed that many.
pub(crate) fn argument(bindings: &[RegisterBinding], n: usize) -> Option<&ResolvedValue> {
    bindings.get(n).map(|b| &b.value)
}

/// Runs every detector against a package.
pub fn scan(index: &Index, manifest: &Manifest) -> Vec<Finding> {
    let results = [
        ("phone calls", telephony::detect_phone_calls(index)),
        ("SMS interception", telephony::detect_sms_interception(index, manifest)),
        ("SMS abuse", telephony::detect_sms_abuse(index)),
        ("UNIX command execution", code_execution::detect_command_execution(index)),
        ("reflection", code_execution::detect_reflection(index)),
        ("cryptography", code_execution::detect_cryptography(index)),
        ("library loading", code_execution::detect_library_loading(index)),
    ];

    let mut findings = vec![];
    for (name, result) in results {
        match result {
            Ok(Some(f)) => {
                debug!("{name}: {} ({} pieces of evidence)", f.label, f.evidence.len());
                findings.push(f);
            }
            Ok(None) => {}
            Err(e) => error!("{name} detector failed: {e}"),
        }
    }
    findings
}
