//! Class-name patterns: an exact name in any spelling, or a regular expression.

use crate::error::{Error, Result};
use crate::types::ClassName;
use regex::Regex;

/// Characters that make a pattern a regular expression.
///
/// `.` and `$` are left out: they occur in ordinary dotted names and inner classes.
const REGEX_MARKERS: &[char] = &['*', '+', '?', '[', ']', '(', ')', '{', '}', '|', '^', '\\'];

/// A compiled class pattern.
///
/// # Examples
///
/// ```
///  use smali_warn::pattern::ClassPattern;
///  use smali_warn::types::ClassName;
///
///  let p = ClassPattern::new("Ljavax/crypto/.*").unwrap();
///  assert!(p.matches(&ClassName::new("javax.crypto.Cipher")));
///
///  let p = ClassPattern::new("android.telephony.SmsManager").unwrap();
///  assert!(p.matches(&ClassName::new("Landroid/telephony/SmsManager;")));
/// ```
#[derive(Debug, Clone)]
pub enum ClassPattern {
    Exact(ClassName),
    Regex(Regex),
}

impl ClassPattern {
    pub fn new(pattern: &str) -> Result<ClassPattern> {
        let p = pattern.trim();
        if p.is_empty() {
            return Err(Error::pattern(pattern, "empty pattern"));
        }
        // Array descriptors are exact names even though they start with '['
        if !p.contains(REGEX_MARKERS) || is_array_descriptor(p) {
            return Ok(ClassPattern::Exact(ClassName::new(p)));
        }
        let re = Regex::new(&format!("^(?:{p})")).map_err(|e| Error::pattern(pattern, e))?;
        Ok(ClassPattern::Regex(re))
    }

    pub fn is_exact(&self) -> bool {
        matches!(self, ClassPattern::Exact(_))
    }

    /// Tests a class against the pattern in descriptor, slashed and dotted form.
    pub fn matches(&self, class: &ClassName) -> bool {
        match self {
            ClassPattern::Exact(c) => c == class,
            ClassPattern::Regex(re) => {
                re.is_match(&class.as_jni_type())
                    || re.is_match(class.as_internal())
                    || re.is_match(&class.as_java_type())
            }
        }
    }
}

fn is_array_descriptor(p: &str) -> bool {
    let body = p.trim_start_matches('[');
    p.starts_with('[')
        && (body.len() == 1 && "ZBCSIJFD".contains(body)
            || body.starts_with('L') && body.ends_with(';') && !body[1..body.len() - 1].contains(REGEX_MARKERS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_patterns_in_every_spelling() {
        let target = ClassName::new("Landroid/telephony/SmsManager;");
        for p in [
            "Landroid/telephony/SmsManager;",
            "Landroid/telephony/SmsManager",
            "android/telephony/SmsManager",
            "android.telephony.SmsManager",
        ] {
            let pat = ClassPattern::new(p).unwrap();
            assert!(pat.is_exact(), "{p}");
            assert!(pat.matches(&target), "{p}");
        }
        assert!(!ClassPattern::new("android.telephony.SmsManagerX").unwrap().matches(&target));
    }

    #[test]
    fn inner_classes_are_exact() {
        let p = ClassPattern::new("com.test.Outer$Inner").unwrap();
        assert!(p.is_exact());
        assert!(p.matches(&ClassName::new("Lcom/test/Outer$Inner;")));
    }

    #[test]
    fn regex_is_anchored_at_start() {
        let p = ClassPattern::new("Ljavax/crypto/.*").unwrap();
        assert!(!p.is_exact());
        assert!(p.matches(&ClassName::new("Ljavax/crypto/Cipher;")));
        assert!(p.matches(&ClassName::new("Ljavax/crypto/spec/SecretKeySpec;")));
        assert!(!p.matches(&ClassName::new("Lcom/evil/javax/crypto/Fake;")));

        let p = ClassPattern::new("com\\.test\\..*Receiver").unwrap();
        assert!(p.matches(&ClassName::new("Lcom/test/SmsReceiver;")));
    }

    #[test]
    fn array_descriptors_are_exact() {
        assert!(ClassPattern::new("[Ljava/lang/String;").unwrap().is_exact());
        assert!(ClassPattern::new("[I").unwrap().is_exact());
    }

    #[test]
    fn invalid_regex_is_a_pattern_error() {
        let e = ClassPattern::new("Lcom/(unclosed").unwrap_err();
        assert!(matches!(e, Error::Pattern { .. }));
        assert!(ClassPattern::new("  ").is_err());
    }
}
