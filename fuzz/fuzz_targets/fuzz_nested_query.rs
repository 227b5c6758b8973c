#![no_main]

use libfuzzer_sys::fuzz_target;
use multiform::{build_nested_query, parse_nested_query};

fuzz_target!(|data: &[u8]| {
    if let Ok(params) = parse_nested_query(data) {
        let _ = parse_nested_query(build_nested_query(&params));
    }
});
