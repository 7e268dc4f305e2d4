//! Property tests for the request-head parser.
//!
//! The parser must be insensitive to how bytes are split across reads: any
//! partition of a valid head must produce the same result as parsing it in
//! one call.

use molt_http::parser::{HeadParser, HeadStatus, RequestHead};
use proptest::prelude::*;

fn parse_one_shot(buf: &[u8]) -> (HeadParser, RequestHead) {
    let mut parser = HeadParser::new();
    let mut head = RequestHead::default();
    let status = parser.execute(&mut head, buf).expect("valid head");
    assert_eq!(status, HeadStatus::Complete);
    (parser, head)
}

fn parse_in_pieces(buf: &[u8], cuts: &[usize]) -> (HeadParser, RequestHead) {
    let mut parser = HeadParser::new();
    let mut head = RequestHead::default();
    let mut fed = 0;
    for &cut in cuts {
        let cut = cut % (buf.len() + 1);
        if cut > fed {
            fed = cut;
            parser.execute(&mut head, &buf[..fed]).expect("valid head");
        }
    }
    let status = parser.execute(&mut head, buf).expect("valid head");
    assert_eq!(status, HeadStatus::Complete);
    (parser, head)
}

fn method_strategy() -> impl Strategy<Value = String> {
    proptest::string::string_regex("[A-Z][A-Z0-9]{0,9}").unwrap()
}

fn path_strategy() -> impl Strategy<Value = String> {
    proptest::string::string_regex("/[a-z0-9/_.-]{0,40}").unwrap()
}

fn header_strategy() -> impl Strategy<Value = (String, String)> {
    (
        proptest::string::string_regex("X-[A-Za-z][A-Za-z0-9-]{0,12}").unwrap(),
        proptest::string::string_regex("[ -~]{0,40}").unwrap(),
    )
}

proptest! {
    #[test]
    fn split_points_do_not_change_the_result(
        method in method_strategy(),
        path in path_strategy(),
        headers in proptest::collection::vec(header_strategy(), 0..8),
        cuts in proptest::collection::vec(0usize..500, 0..6),
    ) {
        let mut wire = format!("{method} {path} HTTP/1.1\r\n");
        for (name, value) in &headers {
            wire.push_str(&format!("{name}: {value}\r\n"));
        }
        wire.push_str("\r\n");
        let wire = wire.as_bytes();

        let (one_parser, one_head) = parse_one_shot(wire);
        let (inc_parser, inc_head) = parse_in_pieces(wire, &cuts);

        prop_assert_eq!(one_head.method, inc_head.method);
        prop_assert_eq!(one_head.path, inc_head.path);
        prop_assert_eq!(one_head.query, inc_head.query);
        prop_assert_eq!(one_head.version, inc_head.version);
        prop_assert_eq!(one_head.fields, inc_head.fields);
        prop_assert_eq!(one_head.body_start, inc_head.body_start);
        prop_assert_eq!(one_parser.nread(), inc_parser.nread());
        prop_assert_eq!(one_parser.nread(), wire.len());
    }

    #[test]
    fn arbitrary_garbage_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..300)) {
        let mut parser = HeadParser::new();
        let mut head = RequestHead::default();
        let _ = parser.execute(&mut head, &bytes);
    }
}
