use proptest::prelude::*;
use quilldb::IndexValue;

proptest! {
    #[test]
    fn int32_order_is_preserved(a in any::<i32>(), b in any::<i32>()) {
        let ka = IndexValue::Int32(a).encode();
        let kb = IndexValue::Int32(b).encode();
        prop_assert_eq!(a.cmp(&b), ka.cmp(&kb));
    }

    #[test]
    fn int64_order_is_preserved(a in any::<i64>(), b in any::<i64>()) {
        let ka = IndexValue::Int64(a).encode();
        let kb = IndexValue::Int64(b).encode();
        prop_assert_eq!(a.cmp(&b), ka.cmp(&kb));
    }

    #[test]
    fn finite_double_order_is_preserved(
        a in prop::num::f64::NORMAL | prop::num::f64::ZERO,
        b in prop::num::f64::NORMAL | prop::num::f64::ZERO,
    ) {
        let ka = IndexValue::Double(a).encode();
        let kb = IndexValue::Double(b).encode();
        if a < b {
            prop_assert!(ka < kb);
        } else if a > b {
            prop_assert!(ka > kb);
        }
    }

    #[test]
    fn string_order_is_preserved(a in ".{0,24}", b in ".{0,24}") {
        let ka = IndexValue::String(a.clone()).encode();
        let kb = IndexValue::String(b.clone()).encode();
        prop_assert_eq!(a.as_bytes().cmp(b.as_bytes()), ka.cmp(&kb));
    }

    #[test]
    fn prefix_encoding_matches_full_encoding(s in "[a-z]{0,16}", rest in "[a-z]{0,8}") {
        let full = IndexValue::String(format!("{s}{rest}")).encode();
        let prefix = IndexValue::String(s).encode_prefix();
        prop_assert!(full.starts_with(&prefix));
    }

    #[test]
    fn null_sorts_before_everything(v in ".{0,8}") {
        let null = IndexValue::Null.encode();
        prop_assert!(null < IndexValue::String(v).encode());
        prop_assert!(null < IndexValue::Int64(i64::MIN).encode());
        prop_assert!(null < IndexValue::Bool(false).encode());
    }
}
