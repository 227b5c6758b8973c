#![no_main]

use std::convert::Infallible;

use libfuzzer_sys::fuzz_target;
use multiform::{memory_spool, ChunkSource, Multipart};

fuzz_target!(|data: &[u8]| {
    let source = ChunkSource::new(vec![Ok::<_, Infallible>(data.to_vec())]);

    let mut multipart = match Multipart::new(source, "X-BOUNDARY") {
        Ok(multipart) => multipart.spool_with(memory_spool),
        Err(_) => return,
    };

    let mut breaks = 0;
    while breaks < 3 {
        match multipart.next_part() {
            Err(_) | Ok(None) => breaks += 1,
            Ok(Some(_)) => continue,
        }
    }
});
