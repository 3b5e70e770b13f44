//! Host-defined opaque values (spec §4.B "Abstract: call the vtable
//! `gcmark`"), expressed as a trait object rather than a C vtable struct —
//! the same "extension point as a trait" idiom `ValueSerialize` uses for
//! bolting serialization behavior onto `Value`.

use janet_core::Value;

/// Implemented by host types embedded into the heap as `Value::Abstract`.
///
/// `gc_mark` lets an abstract value hold references to ordinary `Value`s
/// (e.g. a host-defined queue of Janet values) without the GC needing to
/// know the concrete type: the mark phase calls this to collect further
/// roots to mark, mirroring the C vtable's `gcmark` entry.
pub trait AbstractObject: std::fmt::Debug + Send {
    fn type_name(&self) -> &'static str;

    /// Values this object holds that the mark phase must also visit.
    /// Most abstracts hold no Janet values and can use the default.
    fn gc_mark(&self) -> Vec<Value> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Opaque(i64);

    impl AbstractObject for Opaque {
        fn type_name(&self) -> &'static str {
            "opaque"
        }
    }

    #[test]
    fn default_gc_mark_is_empty() {
        let o = Opaque(1);
        assert!(o.gc_mark().is_empty());
        assert_eq!(o.type_name(), "opaque");
    }
}
