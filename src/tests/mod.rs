
#[cfg(test)]
mod tests {
    use crate::types::{ClassName, MethodDescriptor, TypeSignature};
    use crate::Index;

    #[test]
    fn class_name_to_jni() {
        let o = ClassName::new("com.basic.Test");
        assert_eq!(o.as_java_type(), "com.basic.Test");
        assert_eq!(o.as_jni_type(), "Lcom/basic/Test;");
    }

    #[test]
    fn class_name_to_java() {
        let o = ClassName::new("Lcom/basic/Test;");
        assert_eq!(o.as_jni_type(), "Lcom/basic/Test;");
        assert_eq!(o.as_java_type(), "com.basic.Test");
    }

    #[test]
    fn signatures() {
        let t = TypeSignature::Bool;
        assert_eq!(t.to_jni(), "Z");
        let m = MethodDescriptor::parse("([I)V").unwrap();
        assert_eq!(m.result, TypeSignature::Void);
    }

    #[test]
    fn manifest_and_call_site_spellings_meet() {
        let smali = ".class public Lcom/test/SmsReceiver;\n.super Landroid/content/BroadcastReceiver;\n";
        let index = Index::from_smali(&[smali]).unwrap();
        let from_manifest = ClassName::from_component("com.test", ".SmsReceiver").unwrap();
        assert!(index.class(&from_manifest).is_some());
        assert_eq!(index.find_classes(&from_manifest.as_java_type()).unwrap().len(), 1);
    }
}
