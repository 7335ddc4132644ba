// Copyright (c) 2015-2024 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.


use crate::error::{Error, ErrorCode};
use crate::Value;

/// Decodes a stream that is expected to be well-formed.
fn load(data: &[u8]) -> Value {
    crate::value_from_slice(data).unwrap()
}

/// Extracts the error code of an expected failure.
fn code_of(data: &[u8]) -> ErrorCode {
    match crate::value_from_slice(data).unwrap_err() {
        Error::Eval(code, _) => code,
        Error::Syntax(code) => code,
        Error::Io(err) => panic!("unexpected io error: {}", err),
    }
}

mod value_tests {
    use std::rc::Rc;

    use crate::de::Unpickler;
    use crate::Value;
    use super::load;

    #[test]
    fn none() {
        // pickle.dumps(None, protocol=1) / protocol=2
        assert_eq!(load(b"N."), Value::None);
        assert_eq!(load(b"\x80\x02N."), Value::None);
    }

    #[test]
    fn bools() {
        // Protocol 0 spells booleans as INT 00/01.
        assert_eq!(load(b"I01\n."), Value::Bool(true));
        assert_eq!(load(b"I00\n."), Value::Bool(false));
        assert_eq!(load(b"\x80\x02\x88."), Value::Bool(true));
        assert_eq!(load(b"\x80\x02\x89."), Value::Bool(false));
    }

    #[test]
    fn ints_text() {
        // pickle.dumps(42, protocol=0), pickle.dumps(-42, protocol=0)
        assert_eq!(load(b"I42\n."), Value::I64(42));
        assert_eq!(load(b"I-42\n."), Value::I64(-42));
    }

    #[test]
    fn ints_binary() {
        // pickle.dumps(100200, protocol=1) and friends
        assert_eq!(load(b"Jh\x87\x01\x00."), Value::I64(100200));
        assert_eq!(load(b"J\x98x\xfe\xff."), Value::I64(-100200));
        assert_eq!(load(b"\x80\x04\x95\x06\x00\x00\x00\x00\x00\x00\x00J\xd4\x11\x01\x00."),
                   Value::I64(70100));
        assert_eq!(load(b"\x80\x04\x95\x06\x00\x00\x00\x00\x00\x00\x00J,\xee\xfe\xff."),
                   Value::I64(-70100));
        assert_eq!(load(b"\x80\x02K*."), Value::I64(42));
        assert_eq!(load(b"\x80\x02M,\x01."), Value::I64(300));
    }

    #[test]
    fn longs_text() {
        // pickle.dumps(100200300400, protocol=1); values within i64 demote
        assert_eq!(load(b"L100200300400L\n."), Value::I64(100200300400));
        assert_eq!(load(b"L-100200300400L\n."), Value::I64(-100200300400));
        match load(b"L100200300400500600700L\n.") {
            Value::Int(i) => assert_eq!(i.to_string(), "100200300400500600700"),
            other => panic!("expected big int, got {:?}", other),
        }
        match load(b"L-100200300400500600700L\n.") {
            Value::Int(i) => assert_eq!(i.to_string(), "-100200300400500600700"),
            other => panic!("expected big int, got {:?}", other),
        }
    }

    #[test]
    fn longs_binary() {
        // pickle.dumps(100200300400, protocol=2) etc.
        assert_eq!(load(b"\x80\x02\x8a\x05p?gT\x17."), Value::I64(100200300400));
        assert_eq!(load(b"\x80\x02\x8a\x05\x90\xc0\x98\xab\xe8."), Value::I64(-100200300400));
        match load(b"\x80\x02\x8a\t|\xefD\x8fT\xfa\x8en\x05.") {
            Value::Int(i) => assert_eq!(i.to_string(), "100200300400500600700"),
            other => panic!("expected big int, got {:?}", other),
        }
        match load(b"\x80\x02\x8a\t\x84\x10\xbbp\xab\x05q\x91\xfa.") {
            Value::Int(i) => assert_eq!(i.to_string(), "-100200300400500600700"),
            other => panic!("expected big int, got {:?}", other),
        }
        // Zero-length payload decodes to zero.
        assert_eq!(load(b"\x80\x02\x8a\x00."), Value::I64(0));
    }

    #[test]
    fn floats() {
        assert_eq!(load(b"F4.2\n."), Value::F64(4.2));
        assert_eq!(load(b"F-4.2\n."), Value::F64(-4.2));
        assert_eq!(load(b"\x80\x02G?\xf3333333."), Value::F64(1.2));
        assert_eq!(load(b"\x80\x02G\xbf\xf3333333."), Value::F64(-1.2));
    }

    #[test]
    fn string_p0_keeps_escapes() {
        // pickle.dumps('Café', protocol=0) from Python 2.7: the payload
        // carries the escape sequences literally and is pushed verbatim.
        assert_eq!(load(b"S'Caf\\xc3\\xa9'\np0\n."),
                   Value::String("Caf\\xc3\\xa9".into()));
    }

    #[test]
    fn binstrings() {
        // pickle.dumps(b'1234567890'*26, protocol=1) from Python 2.7
        let mut data = b"T\x04\x01\x00\x00".to_vec();
        data.extend("1234567890".repeat(26).bytes());
        data.extend(b"q\x00.");
        assert_eq!(load(&data), Value::String("1234567890".repeat(26)));

        // pickle.dumps(b'Caf\xc3\xa9', protocol=1) from Python 2.7
        assert_eq!(load(b"U\x05Caf\xc3\xa9q\x00."), Value::String("Café".into()));
        // Non-UTF-8 payloads fall back to byte strings.
        assert_eq!(load(b"U\x02\xff\xfe."), Value::Bytes(vec![0xff, 0xfe]));
    }

    #[test]
    fn unicode_strings() {
        // pickle.dumps(u'Café', protocol=0) from Python 2.7:
        // raw-unicode-escape promotes plain bytes as latin-1.
        assert_eq!(load(b"VCaf\xe9\np0\n."), Value::String("Café".into()));
        assert_eq!(load(b"V\\u00e9\n."), Value::String("é".into()));
        // pickle.dumps('Café', protocol=1)
        assert_eq!(load(b"X\x05\x00\x00\x00Caf\xc3\xa9q\x00."), Value::String("Café".into()));
        // pickle.dumps('Café', protocol=4)
        assert_eq!(load(b"\x80\x04\x95\t\x00\x00\x00\x00\x00\x00\x00\x8c\x05Caf\xc3\xa9\x94."),
                   Value::String("Café".into()));
        assert_eq!(load(b"\x8d\x04\x00\x00\x00\x00\x00\x00\x00abcd."),
                   Value::String("abcd".into()));
    }

    #[test]
    fn bytes_values() {
        let mut data = b"\x80\x03B\x04\x01\x00\x00".to_vec();
        data.extend("1234567890".repeat(26).bytes());
        data.extend(b"q\x00.");
        assert_eq!(load(&data), Value::Bytes("1234567890".repeat(26).into_bytes()));

        assert_eq!(load(b"\x80\x03C\x02abq\x00."), Value::Bytes(b"ab".to_vec()));
        assert_eq!(load(b"\x8e\x03\x00\x00\x00\x00\x00\x00\x00abc."),
                   Value::Bytes(b"abc".to_vec()));
    }

    #[test]
    fn bytearray() {
        // pickle.dumps(bytearray(b'ab'), protocol=5)
        let value = load(b"\x80\x05\x95\r\x00\x00\x00\x00\x00\x00\x00\
                           \x96\x02\x00\x00\x00\x00\x00\x00\x00ab\x94.");
        match value {
            Value::ByteArray(b) => assert_eq!(*b.borrow(), b"ab".to_vec()),
            other => panic!("expected bytearray, got {:?}", other),
        }
    }

    #[test]
    fn tuples() {
        assert_eq!(load(b"(t."), Value::tuple(vec![]));
        assert_eq!(load(b"\x80\x02)."), Value::tuple(vec![]));
        assert_eq!(load(b"(I1\ntp0\n."), Value::tuple(vec![Value::I64(1)]));
        assert_eq!(load(b"\x80\x02K\x01\x85q\x00."), Value::tuple(vec![Value::I64(1)]));
        assert_eq!(load(b"\x80\x02K\x01K\x02\x86q\x00."),
                   Value::tuple(vec![Value::I64(1), Value::I64(2)]));
        assert_eq!(load(b"\x80\x02K\x01K\x02K\x03\x87q\x00."),
                   Value::tuple(vec![Value::I64(1), Value::I64(2), Value::I64(3)]));
    }

    #[test]
    fn lists() {
        assert_eq!(load(b"(lp0\n.").list_items().unwrap(), vec![]);
        assert_eq!(load(b"\x80\x02]q\x00.").list_items().unwrap(), vec![]);
        assert_eq!(load(b"\x80\x02]q\x00K\x01a.").list_items().unwrap(),
                   vec![Value::I64(1)]);
        assert_eq!(load(b"\x80\x02]q\x00(K\x01K\x02e.").list_items().unwrap(),
                   vec![Value::I64(1), Value::I64(2)]);
    }

    #[test]
    fn dicts() {
        for data in [&b"(dp0\n."[..], &b"\x80\x02}q\x00."[..]] {
            match load(data) {
                Value::Dict(d) => assert_eq!(d.borrow().len(), 0),
                other => panic!("expected dict, got {:?}", other),
            }
        }
        // pickle.dumps({'a': 1}, protocol=0)
        match load(b"(dp0\nVa\np1\nI1\ns.") {
            Value::Dict(d) => {
                let d = d.borrow();
                assert_eq!(d.len(), 1);
                assert_eq!(d.get_str("a"), Some(&Value::I64(1)));
            }
            other => panic!("expected dict, got {:?}", other),
        }
    }

    #[test]
    fn nested_dicts() {
        // pickle.dumps({'a': 1, 'b': {'c': 2}}, protocol=4)
        let value = load(b"\x80\x04\x95\x18\x00\x00\x00\x00\x00\x00\x00}\
                           \x94(\x8c\x01a\x94K\x01\x8c\x01b\x94}\x94\x8c\x01c\x94K\x02su.");
        match value {
            Value::Dict(d) => {
                let d = d.borrow();
                assert_eq!(d.len(), 2);
                assert_eq!(d.get_str("a"), Some(&Value::I64(1)));
                match d.get_str("b") {
                    Some(Value::Dict(inner)) => {
                        let inner = inner.borrow();
                        assert_eq!(inner.len(), 1);
                        assert_eq!(inner.get_str("c"), Some(&Value::I64(2)));
                    }
                    other => panic!("expected inner dict, got {:?}", other),
                }
            }
            other => panic!("expected dict, got {:?}", other),
        }
    }

    #[test]
    fn dict_insertion_order() {
        let value = load(b"\x80\x02}q\x00(X\x01\x00\x00\x00bK\x01\
                           X\x01\x00\x00\x00aK\x02X\x01\x00\x00\x00cK\x03u.");
        match value {
            Value::Dict(d) => {
                let d = d.borrow();
                let keys: Vec<_> = d.pairs().iter()
                    .map(|(k, _)| k.as_str().unwrap().to_string()).collect();
                assert_eq!(keys, ["b", "a", "c"]);
            }
            other => panic!("expected dict, got {:?}", other),
        }
    }

    #[test]
    fn sets() {
        // pickle.dumps(set(), protocol=4)
        match load(b"\x80\x04\x8f\x94.") {
            Value::Set(s) => assert_eq!(s.borrow().len(), 0),
            other => panic!("expected set, got {:?}", other),
        }
        // pickle.dumps(set([1]), protocol=4)
        match load(b"\x80\x04\x95\x07\x00\x00\x00\x00\x00\x00\x00\x8f\x94(K\x01\x90.") {
            Value::Set(s) => {
                let s = s.borrow();
                assert_eq!(s.len(), 1);
                assert!(s.has(&Value::I64(1)));
            }
            other => panic!("expected set, got {:?}", other),
        }
    }

    #[test]
    fn frozensets() {
        // pickle.dumps(frozenset(), protocol=4)
        match load(b"\x80\x04\x95\x04\x00\x00\x00\x00\x00\x00\x00(\x91\x94.") {
            Value::FrozenSet(s) => assert_eq!(s.len(), 0),
            other => panic!("expected frozenset, got {:?}", other),
        }
        // pickle.dumps(frozenset([1]), protocol=4)
        match load(b"\x80\x04\x95\x06\x00\x00\x00\x00\x00\x00\x00(K\x01\x91\x94.") {
            Value::FrozenSet(s) => {
                assert_eq!(s.len(), 1);
                assert!(s.has(&Value::I64(1)));
            }
            other => panic!("expected frozenset, got {:?}", other),
        }
    }

    #[test]
    fn memo_preserves_identity() {
        // The same memoized list fetched twice must be the same handle,
        // for each of the memo opcode families.
        for data in [&b"\x80\x02]q\x00h\x00\x86."[..],
                     &b"]p0\ng0\n\x86."[..],
                     &b"]r\x00\x00\x00\x00j\x00\x00\x00\x00\x86."[..]] {
            match load(data) {
                Value::Tuple(t) => match (&t[0], &t[1]) {
                    (Value::List(a), Value::List(b)) => assert!(Rc::ptr_eq(a, b)),
                    other => panic!("expected two lists, got {:?}", other),
                },
                other => panic!("expected tuple, got {:?}", other),
            }
        }
    }

    #[test]
    fn memoize_opcode() {
        // MEMOIZE keys count up from zero.
        match load(b"\x80\x04]\x94h\x00\x86\x94.") {
            Value::Tuple(t) => match (&t[0], &t[1]) {
                (Value::List(a), Value::List(b)) => assert!(Rc::ptr_eq(a, b)),
                other => panic!("expected two lists, got {:?}", other),
            },
            other => panic!("expected tuple, got {:?}", other),
        }
    }

    #[test]
    fn dup_shares_reference() {
        match load(b"\x80\x02]q\x002\x86.") {
            Value::Tuple(t) => match (&t[0], &t[1]) {
                (Value::List(a), Value::List(b)) => assert!(Rc::ptr_eq(a, b)),
                other => panic!("expected two lists, got {:?}", other),
            },
            other => panic!("expected tuple, got {:?}", other),
        }
    }

    #[test]
    fn self_referential_list() {
        // l = []; l.append(l)
        match load(b"\x80\x02]q\x00h\x00a.") {
            Value::List(l) => {
                let inner = l.borrow()[0].clone();
                match inner {
                    Value::List(i) => assert!(Rc::ptr_eq(&l, &i)),
                    other => panic!("expected list, got {:?}", other),
                }
            }
            other => panic!("expected list, got {:?}", other),
        }
    }

    #[test]
    fn self_referential_dict() {
        // d = {}; d[1] = d
        match load(b"\x80\x02}q\x00K\x01h\x00s.") {
            Value::Dict(d) => {
                let value = d.borrow().get(&Value::I64(1)).cloned();
                match value {
                    Some(Value::Dict(i)) => assert!(Rc::ptr_eq(&d, &i)),
                    other => panic!("expected dict, got {:?}", other),
                }
            }
            other => panic!("expected dict, got {:?}", other),
        }
    }

    #[test]
    fn stack_is_empty_at_stop() {
        // Every well-formed pickle leaves exactly the result on the stack.
        for data in [&b"N."[..],
                     &b"\x80\x02K*."[..],
                     &b"\x80\x02]q\x00(K\x01K\x02e."[..],
                     &b"\x80\x04\x95\x07\x00\x00\x00\x00\x00\x00\x00\x8f\x94(K\x01\x90."[..],
                     &b"(dp0\nVa\np1\nI1\ns."[..]] {
            let mut up = Unpickler::new(data);
            up.load().unwrap();
            assert_eq!(up.residual_stack_len(), 0);
        }
    }
}

mod object_tests {
    use std::rc::Rc;

    use crate::de::Unpickler;
    use crate::error::{Error, ErrorCode};
    use crate::{ClassRegistry, TypedData, Value};
    use super::load;

    fn expect_object(value: &Value) -> std::cell::Ref<'_, crate::Object> {
        match value {
            Value::Object(o) => o.borrow(),
            other => panic!("expected object, got {:?}", other),
        }
    }

    #[test]
    fn generic_objects_all_protocols() {
        // class Foo: pass -- pickled at each protocol
        let vectors: &[&[u8]] = &[
            b"ccopy_reg\n_reconstructor\np0\n(c__main__\nFoo\np1\nc__builtin__\nobject\np2\nNtp3\nRp4\n.",
            b"ccopy_reg\n_reconstructor\nq\x00(c__main__\nFoo\nq\x01c__builtin__\nobject\nq\x02Ntq\x03Rq\x04.",
            b"\x80\x02c__main__\nFoo\nq\x00)\x81q\x01.",
            b"\x80\x03c__main__\nFoo\nq\x00)\x81q\x01.",
            b"\x80\x04\x95\x17\x00\x00\x00\x00\x00\x00\x00\x8c\x08__main__\x94\x8c\x03Foo\x94\x93\x94)\x81\x94.",
            b"\x80\x05\x95\x17\x00\x00\x00\x00\x00\x00\x00\x8c\x08__main__\x94\x8c\x03Foo\x94\x93\x94)\x81\x94.",
        ];
        for data in vectors {
            let value = load(data);
            let obj = expect_object(&value);
            assert_eq!(obj.class.module, "__main__");
            assert_eq!(obj.class.name, "Foo");
            assert!(obj.args.is_empty());
        }
    }

    #[test]
    fn inst_and_obj() {
        // INST gathers constructor args from the mark frame.
        let value = load(b"(I1\nI2\ni__main__\nFoo\n.");
        let obj = expect_object(&value);
        assert_eq!(obj.class.name, "Foo");
        assert_eq!(obj.args, vec![Value::I64(1), Value::I64(2)]);
        drop(obj);

        // OBJ takes the class from the frame itself.
        let value = load(b"\x80\x02(c__main__\nFoo\nK\x01K\x02o.");
        let obj = expect_object(&value);
        assert_eq!(obj.class.name, "Foo");
        assert_eq!(obj.args, vec![Value::I64(1), Value::I64(2)]);
    }

    #[test]
    fn newobj_ex() {
        let value = load(b"\x80\x04c__main__\nFoo\n)}\x92.");
        let obj = expect_object(&value);
        assert_eq!(obj.class.name, "Foo");

        // Keyword arguments are not accepted.
        match crate::value_from_slice(
            b"\x80\x04c__main__\nFoo\n)}X\x01\x00\x00\x00aK\x01s\x92.") {
            Err(Error::Eval(ErrorCode::Protocol(_), _)) => {}
            other => panic!("expected protocol error, got {:?}", other),
        }
    }

    #[test]
    fn build_attribute_dict() {
        // Foo() with instance dict {'x': 5}
        let value = load(b"\x80\x02c__main__\nFoo\nq\x00)\x81q\x01}q\x02X\x01\x00\x00\x00xK\x05sb.");
        let obj = expect_object(&value);
        assert_eq!(obj.attrs.get_str("x"), Some(&Value::I64(5)));
        assert!(obj.state.is_none());
    }

    #[test]
    fn build_state_and_slots() {
        let value = load(b"\x80\x02c__main__\nFoo\n)\x81}X\x01\x00\x00\x00aK\x01s\
                           }X\x01\x00\x00\x00bK\x02s\x86b.");
        let obj = expect_object(&value);
        assert_eq!(obj.attrs.get_str("a"), Some(&Value::I64(1)));
        assert_eq!(obj.attrs.get_str("b"), Some(&Value::I64(2)));
    }

    #[test]
    fn build_opaque_state() {
        // A non-mapping state is stored verbatim.
        let value = load(b"\x80\x02c__main__\nFoo\n)\x81K\x05b.");
        let obj = expect_object(&value);
        assert_eq!(obj.state, Some(Value::I64(5)));
        assert_eq!(obj.attrs.len(), 0);
    }

    #[test]
    fn ordered_dicts() {
        // pickle.dumps(collections.OrderedDict(), protocol=4)
        let value = load(b"\x80\x04\x95\x22\x00\x00\x00\x00\x00\x00\x00\
                           \x8c\x0bcollections\x94\x8c\x0bOrderedDict\x94\x93\x94)R\x94.");
        match value {
            Value::OrderedDict(d) => assert_eq!(d.borrow().len(), 0),
            other => panic!("expected OrderedDict, got {:?}", other),
        }
        // pickle.dumps(collections.OrderedDict({'a': 1}), protocol=4)
        let value = load(b"\x80\x04\x95)\x00\x00\x00\x00\x00\x00\x00\
                           \x8c\x0bcollections\x94\x8c\x0bOrderedDict\x94\x93\x94)R\x94\
                           \x8c\x01a\x94K\x01s.");
        match value {
            Value::OrderedDict(d) => {
                let d = d.borrow();
                assert_eq!(d.len(), 1);
                assert_eq!(d.entries.get_str("a"), Some(&Value::I64(1)));
            }
            other => panic!("expected OrderedDict, got {:?}", other),
        }
    }

    #[test]
    fn ordered_dict_build_sets_instance_dict() {
        let value = load(b"\x80\x02ccollections\nOrderedDict\n)R}X\x01\x00\x00\x00mK\x01sb.");
        match value {
            Value::OrderedDict(d) => {
                let d = d.borrow();
                assert_eq!(d.entries.len(), 0);
                assert_eq!(d.attrs.get_str("m"), Some(&Value::I64(1)));
            }
            other => panic!("expected OrderedDict, got {:?}", other),
        }
    }

    #[test]
    fn reduce_builtin_set() {
        // set([1, 2]) via REDUCE over the registered constructor
        let value = load(b"\x80\x02c__builtin__\nset\nq\x00]q\x01(K\x01K\x02e\x85q\x02Rq\x03.");
        match value {
            Value::Set(s) => {
                let s = s.borrow();
                assert_eq!(s.len(), 2);
                assert!(s.has(&Value::I64(1)) && s.has(&Value::I64(2)));
            }
            other => panic!("expected set, got {:?}", other),
        }
    }

    #[test]
    fn codecs_encode_latin1() {
        // _codecs.encode('ab\xe9', 'latin1') reconstructs a byte string
        let value = load(b"\x80\x02c_codecs\nencode\nq\x00X\x04\x00\x00\x00ab\xc3\xa9q\x01\
                           X\x06\x00\x00\x00latin1q\x02\x86q\x03Rq\x04.");
        assert_eq!(value, Value::Bytes(vec![b'a', b'b', 0xe9]));
    }

    #[test]
    fn array_reconstruction() {
        // pickle.dumps(array.array("b", [0, 1, 2, -3]), protocol=4)
        let value = load(b"\x80\x04\x95F\x00\x00\x00\x00\x00\x00\x00\x8c\x05array\x94\
                           \x8c\x14_array_reconstructor\x94\x93\x94(\x8c\x05array\x94\
                           \x8c\x05array\x94\x93\x94\x8c\x01b\x94K\x01C\x04\x00\x01\x02\xfd\x94\
                           t\x94R\x94.");
        match value {
            Value::Array(a) => assert_eq!(*a, TypedData::I8(vec![0, 1, 2, -3])),
            other => panic!("expected array, got {:?}", other),
        }

        // pickle.dumps(array.array("H", [0, 1, 2, 3]), protocol=4)
        let value = load(b"\x80\x04\x95J\x00\x00\x00\x00\x00\x00\x00\x8c\x05array\x94\
                           \x8c\x14_array_reconstructor\x94\x93\x94(\x8c\x05array\x94\
                           \x8c\x05array\x94\x93\x94\x8c\x01H\x94K\x02\
                           C\x08\x00\x00\x01\x00\x02\x00\x03\x00\x94t\x94R\x94.");
        match value {
            Value::Array(a) => assert_eq!(*a, TypedData::U16(vec![0, 1, 2, 3])),
            other => panic!("expected array, got {:?}", other),
        }

        // pickle.dumps(array.array("q", [0, 1, 2, -3]), protocol=4)
        let value = load(b"\x80\x04\x95b\x00\x00\x00\x00\x00\x00\x00\x8c\x05array\x94\
                           \x8c\x14_array_reconstructor\x94\x93\x94(\x8c\x05array\x94\
                           \x8c\x05array\x94\x93\x94\x8c\x01q\x94K\x0c\
                           C \x00\x00\x00\x00\x00\x00\x00\x00\x01\x00\x00\x00\x00\x00\x00\x00\
                           \x02\x00\x00\x00\x00\x00\x00\x00\xfd\xff\xff\xff\xff\xff\xff\xff\x94\
                           t\x94R\x94.");
        match value {
            Value::Array(a) => assert_eq!(*a, TypedData::I64(vec![0, 1, 2, -3])),
            other => panic!("expected array, got {:?}", other),
        }
    }

    #[test]
    fn registry_fallback_accepts() {
        struct Seven;
        impl crate::Callable for Seven {
            fn name(&self) -> &str { "mymod.thing" }
            fn call(&self, _args: Vec<Value>) -> crate::Result<Value> {
                Ok(Value::I64(7))
            }
        }
        let mut registry = ClassRegistry::new();
        registry.set_fallback(|module, name| {
            if module == "mymod" && name == "thing" {
                Ok(Some(Value::Callable(Rc::new(Seven))))
            } else {
                Ok(None)
            }
        });
        let mut up = Unpickler::with_registry(&b"\x80\x02cmymod\nthing\nq\x00)Rq\x01."[..],
                                              registry);
        assert_eq!(up.load().unwrap(), Value::I64(7));
    }

    #[test]
    fn registry_fallback_declines() {
        let mut registry = ClassRegistry::new();
        registry.set_fallback(|_, _| Ok(None));
        let mut up = Unpickler::with_registry(&b"\x80\x02cmymod\nthing\nq\x00)Rq\x01."[..],
                                              registry);
        match up.load() {
            Err(Error::Eval(ErrorCode::ClassNotFound(module, name), _)) => {
                assert_eq!(module, "mymod");
                assert_eq!(name, "thing");
            }
            other => panic!("expected ClassNotFound, got {:?}", other),
        }
    }

    #[test]
    fn persistent_ids() {
        // Text form (PERSID) and stack form (BINPERSID).
        for data in [&b"Pfoo\n."[..], &b"\x80\x02U\x03fooQ."[..]] {
            let mut up = Unpickler::new(data);
            up.set_persistent_load(|id| {
                assert_eq!(id, Value::String("foo".into()));
                Ok(Value::I64(1))
            });
            assert_eq!(up.load().unwrap(), Value::I64(1));
        }
    }

    #[test]
    fn persistent_id_without_resolver() {
        let mut up = Unpickler::new(&b"Pfoo\n."[..]);
        match up.load() {
            Err(Error::Eval(ErrorCode::UnsupportedFeature(_), _)) => {}
            other => panic!("expected unsupported feature, got {:?}", other),
        }
    }

    #[test]
    fn next_buffer_without_source() {
        let mut up = Unpickler::new(&b"\x80\x05\x97."[..]);
        match up.load() {
            Err(Error::Eval(ErrorCode::UnsupportedFeature(_), _)) => {}
            other => panic!("expected unsupported feature, got {:?}", other),
        }
    }

    #[test]
    fn next_buffer_with_source() {
        let mut up = Unpickler::new(&b"\x80\x05\x97\x98."[..]);
        up.set_buffer_source(|| Ok(Value::Bytes(b"oob".to_vec())));
        assert_eq!(up.load().unwrap(), Value::Bytes(b"oob".to_vec()));
    }
}

mod error_tests {
    use crate::error::ErrorCode;
    use super::code_of;

    #[test]
    fn unknown_opcode() {
        assert_eq!(code_of(b"\x02."), ErrorCode::UnknownOpcode(0x02));
        // Extension registry opcodes are not implemented.
        assert_eq!(code_of(b"\x82\x01."), ErrorCode::UnknownOpcode(0x82));
    }

    #[test]
    fn unexpected_end() {
        assert_eq!(code_of(b""), ErrorCode::UnexpectedEnd);
        assert_eq!(code_of(b"\x80"), ErrorCode::UnexpectedEnd);
        assert_eq!(code_of(b"K"), ErrorCode::UnexpectedEnd);
        assert_eq!(code_of(b"X\x10\x00\x00\x00abc"), ErrorCode::UnexpectedEnd);
        assert_eq!(code_of(b"L123"), ErrorCode::UnexpectedEnd);
    }

    #[test]
    fn stack_underflow() {
        assert_eq!(code_of(b"."), ErrorCode::StackUnderflow);
        assert_eq!(code_of(b"\x85."), ErrorCode::StackUnderflow);
    }

    #[test]
    fn no_mark() {
        assert_eq!(code_of(b"t."), ErrorCode::NoMark);
        assert_eq!(code_of(b"e."), ErrorCode::NoMark);
        assert_eq!(code_of(b"0."), ErrorCode::NoMark);
    }

    #[test]
    fn memo_miss() {
        assert_eq!(code_of(b"h\x00."), ErrorCode::MemoMiss(0));
        assert_eq!(code_of(b"j\x05\x00\x00\x00."), ErrorCode::MemoMiss(5));
        assert_eq!(code_of(b"g12\n."), ErrorCode::MemoMiss(12));
    }

    #[test]
    fn trailing_bytes() {
        assert_eq!(code_of(b"N.N"), ErrorCode::TrailingBytes);
    }

    #[test]
    fn protocol_errors() {
        // Odd number of items in a DICT frame.
        assert_eq!(code_of(b"(I1\nd."),
                   ErrorCode::Protocol("odd number of items for dict".into()));
        // Unknown future protocol.
        assert!(matches!(code_of(b"\x80\x06N."), ErrorCode::Protocol(_)));
    }

    #[test]
    fn invalid_stack_tops() {
        // APPEND onto a non-list.
        assert!(matches!(code_of(b"K\x01K\x02a."), ErrorCode::InvalidStackTop("list", _)));
        // SETITEM into a non-dict.
        assert!(matches!(code_of(b"]K\x01K\x02s."), ErrorCode::InvalidStackTop("dict", _)));
        // REDUCE with a non-tuple argument.
        assert!(matches!(code_of(b"c__builtin__\nset\nK\x01R."),
                         ErrorCode::InvalidStackTop("tuple", _)));
    }

    #[test]
    fn unhashable_key() {
        assert_eq!(code_of(b"\x80\x02}q\x00]q\x01K\x01s."), ErrorCode::ValueNotHashable);
    }

    #[test]
    fn negative_length() {
        assert_eq!(code_of(b"T\xff\xff\xff\xff."), ErrorCode::NegativeLength);
    }

    #[test]
    fn invalid_utf8() {
        assert_eq!(code_of(b"X\x02\x00\x00\x00\xff\xfe."), ErrorCode::StringNotUtf8);
    }

    #[test]
    fn invalid_literals() {
        assert!(matches!(code_of(b"Iabc\n."), ErrorCode::InvalidLiteral(_)));
        assert!(matches!(code_of(b"F1.2.3\n."), ErrorCode::InvalidLiteral(_)));
        assert!(matches!(code_of(b"]px\n."), ErrorCode::InvalidLiteral(_)));
    }

    #[test]
    fn fuzzing() {
        use rand::Rng;
        // Tries to ensure that we don't panic when encountering strange
        // streams.
        let mut rng = rand::thread_rng();
        for _ in 0..1000 {
            let mut stream = [0u8; 1000];
            rng.fill(&mut stream[..]);
            if *stream.last().unwrap() == b'.' { continue; }
            // These must all fail with an error, since we skip the check if
            // the last byte is a STOP opcode.
            assert!(crate::value_from_slice(&stream).is_err());
        }
    }
}

mod serde_tests {
    use std::collections::HashMap;

    use serde_derive::Deserialize;

    use crate::error::{Error, ErrorCode};
    use crate::{from_slice, from_value};
    use super::load;

    #[test]
    fn into_struct() {
        #[derive(Deserialize, PartialEq, Debug)]
        struct Entry {
            a: i64,
            b: String,
        }
        let entry: Entry = from_slice(
            b"\x80\x02}q\x00(X\x01\x00\x00\x00aK\x05X\x01\x00\x00\x00bX\x02\x00\x00\x00hiu.")
            .unwrap();
        assert_eq!(entry, Entry { a: 5, b: "hi".into() });
    }

    #[test]
    fn into_containers() {
        let v: Vec<i64> = from_slice(b"\x80\x02]q\x00(K\x01K\x02e.").unwrap();
        assert_eq!(v, vec![1, 2]);

        let m: HashMap<String, i64> = from_slice(
            b"\x80\x02}q\x00(X\x01\x00\x00\x00aK\x01X\x01\x00\x00\x00bK\x02u.").unwrap();
        assert_eq!(m["a"], 1);
        assert_eq!(m["b"], 2);

        let t: (i64, String) = from_slice(b"\x80\x02K\x01X\x01\x00\x00\x00a\x86.").unwrap();
        assert_eq!(t, (1, "a".into()));
    }

    #[test]
    fn into_options() {
        let none: Option<i64> = from_slice(b"N.").unwrap();
        assert_eq!(none, None);
        let some: Option<i64> = from_slice(b"K\x05.").unwrap();
        assert_eq!(some, Some(5));
    }

    #[test]
    fn from_tuple_and_set_values() {
        let v: Vec<i64> = from_value(load(b"\x80\x02K\x01K\x02\x86q\x00.")).unwrap();
        assert_eq!(v, vec![1, 2]);
        let mut v: Vec<i64> = from_value(
            load(b"\x80\x04\x95\x08\x00\x00\x00\x00\x00\x00\x00\x8f\x94(K\x01K\x02\x90."))
            .unwrap();
        v.sort_unstable();
        assert_eq!(v, vec![1, 2]);
    }

    #[test]
    fn oversized_integer() {
        match from_slice::<i64>(b"\x80\x02\x8a\t|\xefD\x8fT\xfa\x8en\x05.") {
            Err(Error::Syntax(ErrorCode::Structure(msg))) =>
                assert_eq!(msg, "integer too large"),
            other => panic!("expected structure error, got {:?}", other),
        }
    }

    #[test]
    fn object_graphs_are_rejected() {
        match from_value::<i64>(load(b"\x80\x02c__main__\nFoo\nq\x00)\x81q\x01.")) {
            Err(Error::Syntax(ErrorCode::Structure(_))) => {}
            other => panic!("expected structure error, got {:?}", other),
        }
    }
}

mod props {
    use num_bigint::BigInt;
    use quickcheck::quickcheck;

    use crate::{value_from_slice, Value};

    fn long1_pickle(n: &BigInt) -> Vec<u8> {
        let bytes = if *n == BigInt::from(0) {
            vec![]
        } else {
            n.to_signed_bytes_le()
        };
        assert!(bytes.len() < 256);
        let mut data = b"\x80\x02\x8a".to_vec();
        data.push(bytes.len() as u8);
        data.extend(&bytes);
        data.push(b'.');
        data
    }

    #[test]
    fn long1_machine_ints() {
        fn prop(n: i64) -> bool {
            value_from_slice(&long1_pickle(&BigInt::from(n))).unwrap() == Value::I64(n)
        }
        quickcheck(prop as fn(i64) -> bool);
    }

    #[test]
    fn long1_promotes_big_ints() {
        fn prop(n: i64, shift: u8) -> bool {
            if n == 0 {
                return true;
            }
            let big = BigInt::from(n) << (64 + (shift % 32) as usize);
            value_from_slice(&long1_pickle(&big)).unwrap() == Value::Int(big)
        }
        quickcheck(prop as fn(i64, u8) -> bool);
    }
}
