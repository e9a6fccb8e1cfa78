//! SMS and phone call abuse.

use super::{argument, traced_calls, Category, Finding, Manifest};
use crate::error::Result;
use crate::index::Index;
use crate::locator::locate_calls;
use crate::types::ClassName;
use log::{debug, warn};
use std::collections::BTreeSet;

pub const SMS_RECEIVED: &str = "android.provider.Telephony.SMS_RECEIVED";
pub const CALL_ACTIONS: [&str; 2] = ["android.intent.action.CALL", "android.intent.action.DIAL"];

/// `SmsManager.sendTextMessage(destination, serviceCentre, text, sent, delivered)`
pub fn detect_sms_abuse(index: &Index) -> Result<Option<Finding>> {
    let mut evidence = BTreeSet::new();
    for bindings in traced_calls(index, "Landroid/telephony/SmsManager", "sendTextMessage")? {
        let (Some(number), Some(text)) = (argument(&bindings, 0), argument(&bindings, 2)) else {
            continue;
        };
        evidence.insert(format!(
            "This application sends an SMS message '{text}' to the '{number}' phone number"
        ));
    }
    Ok(Finding::collapse(Category::TelephonyServices, "sendTextMessage", evidence))
}

/// A receiver that listens for incoming SMS with a raised priority gets them before the
/// messaging app, and can hide them with `abortBroadcast()`.
pub fn detect_sms_interception(index: &Index, manifest: &Manifest) -> Result<Option<Finding>> {
    let mut evidence = BTreeSet::new();
    for receiver in &manifest.receivers {
        let intercepts = receiver
            .intent_filters
            .iter()
            .any(|f| f.priority.is_some() && f.actions.iter().any(|a| a == SMS_RECEIVED));
        if !intercepts {
            continue;
        }
        evidence.insert("This application intercepts your incoming SMS".to_string());

        let class = ClassName::from_component(&manifest.package, &receiver.name)?;
        if index.find_classes(&class.as_jni_type())?.is_empty() {
            warn!("SMS receiver {} is declared but not part of the package", class);
        }
        if aborts_broadcast(index, &class)? {
            evidence.insert("This application disables incoming SMS notifications".to_string());
        }
    }
    Ok(Finding::collapse(Category::TelephonyServices, "SMSInterception", evidence))
}

/// `abortBroadcast()` is called on the receiver class, or from inside it.
fn aborts_broadcast(index: &Index, class: &ClassName) -> Result<bool> {
    if !locate_calls(&class.as_jni_type(), "abortBroadcast", index)?.is_empty() {
        return Ok(true);
    }
    let inherited = locate_calls("Landroid/content/BroadcastReceiver;", "abortBroadcast", index)?;
    Ok(inherited.iter().any(|c| &c.caller.class == class))
}

/// String references to the call and dial intent actions.
pub fn detect_phone_calls(index: &Index) -> Result<Option<Finding>> {
    let mut evidence = BTreeSet::new();
    for action in CALL_ACTIONS {
        for r in index.find_string_references(action) {
            debug!("{} loads {:?} at {:04}", r.method, action, r.offset);
            evidence.insert("This application makes phone calls".to_string());
        }
    }
    Ok(Finding::collapse(Category::TelephonyServices, "PhoneCall", evidence))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behaviours::{IntentFilter, Receiver};

    const SENDER: &str = r#"
.class public Lcom/test/Premium;
.super Ljava/lang/Object;

.method public static send()V
    .locals 6
    invoke-static {}, Landroid/telephony/SmsManager;->getDefault()Landroid/telephony/SmsManager;
    move-result-object v0
    const-string v1, "12345"
    const/4 v2, 0x0
    const-string v3, "Premium SMS"
    const/4 v4, 0x0
    const/4 v5, 0x0
    invoke-virtual/range {v0 .. v5}, Landroid/telephony/SmsManager;->sendTextMessage(Ljava/lang/String;Ljava/lang/String;Ljava/lang/String;Landroid/app/PendingIntent;Landroid/app/PendingIntent;)V
    return-void
.end method
"#;

    const INTERCEPTOR: &str = r#"
.class public Lcom/test/Interceptor;
.super Landroid/content/BroadcastReceiver;

.method public onReceive(Landroid/content/Context;Landroid/content/Intent;)V
    .locals 0
    invoke-virtual {p0}, Lcom/test/Interceptor;->abortBroadcast()V
    return-void
.end method
"#;

    const DIALER: &str = r#"
.class public Lcom/test/Dialer;
.super Ljava/lang/Object;

.method public static dial()Landroid/content/Intent;
    .locals 2
    new-instance v0, Landroid/content/Intent;
    const-string v1, "android.intent.action.DIAL"
    invoke-direct {v0, v1}, Landroid/content/Intent;-><init>(Ljava/lang/String;)V
    return-object v0
.end method
"#;

    fn interceptor_manifest(priority: Option<&str>) -> Manifest {
        Manifest {
            package: "com.test".to_string(),
            receivers: vec![Receiver {
                name: ".Interceptor".to_string(),
                intent_filters: vec![IntentFilter {
                    priority: priority.map(str::to_string),
                    actions: vec![SMS_RECEIVED.to_string()],
                }],
            }],
        }
    }

    #[test]
    fn sms_abuse_reports_number_and_text() {
        let index = Index::from_smali(&[SENDER]).unwrap();
        let f = detect_sms_abuse(&index).unwrap().unwrap();
        assert_eq!(f.label, "sendTextMessage");
        assert_eq!(
            f.evidence,
            vec!["This application sends an SMS message 'Premium SMS' to the '12345' phone number"]
        );
        assert_eq!(f.category, Category::TelephonyServices);
    }

    #[test]
    fn no_sms_no_finding() {
        let index = Index::from_smali(&[DIALER]).unwrap();
        assert!(detect_sms_abuse(&index).unwrap().is_none());
    }

    #[test]
    fn sms_interception_with_abort() {
        let index = Index::from_smali(&[INTERCEPTOR]).unwrap();
        let f = detect_sms_interception(&index, &interceptor_manifest(Some("999")))
            .unwrap()
            .unwrap();
        assert_eq!(f.label, "SMSInterception");
        assert_eq!(
            f.evidence,
            vec![
                "This application disables incoming SMS notifications",
                "This application intercepts your incoming SMS"
            ]
        );
    }

    #[test]
    fn sms_interception_needs_priority() {
        let index = Index::from_smali(&[INTERCEPTOR]).unwrap();
        assert!(detect_sms_interception(&index, &interceptor_manifest(None)).unwrap().is_none());
    }

    #[test]
    fn receiver_missing_from_the_package() {
        let index = Index::from_smali(&[SENDER]).unwrap();
        let f = detect_sms_interception(&index, &interceptor_manifest(Some("999")))
            .unwrap()
            .unwrap();
        assert_eq!(f.evidence, vec!["This application intercepts your incoming SMS"]);
    }

    #[test]
    fn bad_receiver_name_is_an_error() {
        let index = Index::from_smali(&[INTERCEPTOR]).unwrap();
        let mut manifest = interceptor_manifest(Some("100"));
        manifest.receivers[0].name = String::new();
        assert!(detect_sms_interception(&index, &manifest).is_err());
    }

    #[test]
    fn phone_calls() {
        let index = Index::from_smali(&[DIALER]).unwrap();
        let f = detect_phone_calls(&index).unwrap().unwrap();
        assert_eq!(f.label, "PhoneCall");
        assert_eq!(f.evidence, vec!["This application makes phone calls"]);

        let index = Index::from_smali(&[SENDER]).unwrap();
        assert!(detect_phone_calls(&index).unwrap().is_none());
    }
}
