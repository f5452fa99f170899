//! Fuzz target for the pgoutput frame decoder.
//!
//! Feeds arbitrary bytes as a sequence of frames through one decoder, so
//! relation and stream state carries across frames the way it does on a
//! live connection. Decoding must return errors, never panic.

#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use table_sync::stream::PgOutputDecoder;

fuzz_target!(|frames: Vec<&[u8]>| {
    let mut decoder = PgOutputDecoder::new();
    for frame in frames {
        let _ = decoder.decode_frame(Bytes::copy_from_slice(frame));
    }
});
