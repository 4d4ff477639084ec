#![no_main]

use evhttp::http::codec::{CodecObserver, HttpMessageHandler, ParsedHead};
use evhttp::http::error::HttpError;
use evhttp::http::header::Headers;
use libfuzzer_sys::fuzz_target;

/// Sink observer: the fuzz target cares only about the parser never
/// panicking or looping, not about what gets observed.
struct NullObserver;

impl CodecObserver for NullObserver {
    fn input_start(&mut self, _head: &ParsedHead) -> (bool, bool) {
        (true, true)
    }

    fn input_body(&mut self, _chunk: &[u8]) {}

    fn input_end(&mut self, _trailers: Headers) {}

    fn input_error(&mut self, _err: Box<dyn HttpError>, _fatal: bool) {}
}

fuzz_target!(|data: &[u8]| {
    let mut codec = HttpMessageHandler::new(NullObserver);
    // Split arbitrarily to also exercise the across-reactor-ticks path,
    // not just whole-message-in-one-call.
    let mid = data.len() / 2;
    codec.handle_input(&data[..mid]);
    codec.handle_input(&data[mid..]);
});
