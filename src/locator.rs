//! Finds the invoke instructions calling a given class and method name.

use crate::error::Result;
use crate::index::{CodeLocation, Index, Method};
use crate::instructions::{Instruction, Operation};
use crate::types::MethodRef;
use std::collections::BTreeSet;
use std::fmt;

/// An invoke instruction in a method body.
///
/// The instruction at `offset` in `caller` is always an invoke of `target`.
#[derive(Debug, Clone, Copy)]
pub struct CallSite<'a> {
    pub caller: &'a Method,
    pub offset: usize,
    pub target: &'a MethodRef,
}

impl<'a> CallSite<'a> {
    pub fn instruction(&self) -> Option<&'a Instruction> {
        self.caller.instruction(self.offset)
    }
}

impl PartialEq for CallSite<'_> {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.caller, other.caller) && self.offset == other.offset
    }
}

impl fmt::Display for CallSite<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @{:04} -> {}", self.caller, self.offset, self.target)
    }
}

/// Every call site targeting `method_name` on a class matching `class_pattern`.
///
/// Callers are found in any class of the index. Results are unique per caller and offset
/// and ordered by caller class, caller method and offset. A target that is never called
/// gives an empty result.
///
/// # Examples
///
/// ```
///  use smali_warn::{locate_calls, Index};
///
///  let smali = r#"
///  .class public Lcom/test/A;
///  .super Ljava/lang/Object;
///
///  .method public foo()V
///      .locals 1
///      invoke-static {}, Landroid/telephony/SmsManager;->getDefault()Landroid/telephony/SmsManager;
///      move-result-object v0
///      return-void
///  .end method
///  "#;
///  let index = Index::from_smali(&[smali]).unwrap();
///  let calls = locate_calls("Landroid/telephony/SmsManager", "getDefault", &index).unwrap();
///  assert_eq!(calls.len(), 1);
///  assert_eq!(calls[0].caller.name, "foo");
/// ```
pub fn locate_calls<'a>(class_pattern: &str, method_name: &str, index: &'a Index) -> Result<Vec<CallSite<'a>>> {
    let mut locations: BTreeSet<CodeLocation> = BTreeSet::new();
    for ix in index.matching_classes(class_pattern)?.iter() {
        locations.extend(index.call_sites_of(&index.class_at(*ix).name, method_name));
    }

    // Class indices follow class-name order so the set is already in reporting order
    let mut out = Vec::with_capacity(locations.len());
    for loc in locations {
        let Some(caller) = index.method_at(&loc) else {
            continue;
        };
        if let Some(Instruction {
            op: Operation::Invoke { target, .. },
            ..
        }) = caller.instruction(loc.offset)
        {
            out.push(CallSite {
                caller,
                offset: loc.offset,
                target,
            });
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SENDER: &str = r#"
.class public Lcom/test/Sender;
.super Ljava/lang/Object;

.method public send(Ljava/lang/String;)V
    .locals 6

    invoke-static {}, Landroid/telephony/SmsManager;->getDefault()Landroid/telephony/SmsManager;
    move-result-object v0
    const-string v1, "12345"
    const/4 v3, 0x0
    invoke-virtual/range {v0 .. v5}, Landroid/telephony/SmsManager;->sendTextMessage(Ljava/lang/String;Ljava/lang/String;Ljava/lang/String;Landroid/app/PendingIntent;Landroid/app/PendingIntent;)V
    invoke-virtual/range {v0 .. v5}, Landroid/telephony/SmsManager;->sendTextMessage(Ljava/lang/String;Ljava/lang/String;Ljava/lang/String;Landroid/app/PendingIntent;Landroid/app/PendingIntent;)V
    return-void
.end method
"#;

    const OTHER: &str = r#"
.class public Lcom/other/Z;
.super Ljava/lang/Object;

.method public static go()V
    .locals 6
    invoke-static {}, Landroid/telephony/SmsManager;->getDefault()Landroid/telephony/SmsManager;
    move-result-object v0
    invoke-virtual {v0, v1, v2, v3, v4, v5}, Landroid/telephony/SmsManager;->sendTextMessage(Ljava/lang/String;Ljava/lang/String;Ljava/lang/String;Landroid/app/PendingIntent;Landroid/app/PendingIntent;)V
    return-void
.end method
"#;

    #[test]
    fn all_sites_in_deterministic_order() {
        let index = Index::from_smali(&[SENDER, OTHER]).unwrap();
        let calls = locate_calls("android.telephony.SmsManager", "sendTextMessage", &index).unwrap();
        let found: Vec<(String, usize)> = calls
            .iter()
            .map(|c| (c.caller.class.as_java_type(), c.offset))
            .collect();
        assert_eq!(
            found,
            vec![
                ("com.other.Z".to_string(), 2),
                ("com.test.Sender".to_string(), 4),
                ("com.test.Sender".to_string(), 5),
            ]
        );
        for c in &calls {
            assert!(c.instruction().unwrap().op.is_invoke());
            assert_eq!(c.target.name, "sendTextMessage");
        }
    }

    #[test]
    fn overlapping_patterns_are_deduplicated() {
        let index = Index::from_smali(&[SENDER]).unwrap();
        let calls = locate_calls("Landroid/telephony/.*", "getDefault", &index).unwrap();
        assert_eq!(calls.len(), 1);
        let calls = locate_calls("Landroid/.*|Landroid/telephony/.*", "getDefault", &index).unwrap();
        assert_eq!(calls.len(), 1);
    }

    #[test]
    fn missing_targets_give_empty_results() {
        let index = Index::from_smali(&[SENDER]).unwrap();
        assert!(locate_calls("Landroid/telephony/SmsManager;", "sendDataMessage", &index).unwrap().is_empty());
        assert!(locate_calls("Lcom/nothing/Here;", "send", &index).unwrap().is_empty());
        // The defining class is not a call target
        assert!(locate_calls("Lcom/test/Sender;", "send", &index).unwrap().is_empty());
    }

    #[test]
    fn invalid_pattern() {
        let index = Index::from_smali(&[SENDER]).unwrap();
        assert!(locate_calls("Landroid/(", "getDefault", &index).is_err());
    }
}
