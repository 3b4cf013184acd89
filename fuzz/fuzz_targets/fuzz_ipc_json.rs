//! Fuzz target for IPC request and response decoding.
//!
//! Arbitrary bytes must decode to Ok or Err, never panic.

#![no_main]

use im_core::ipc::protocol::{decode_request, decode_response};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = decode_request(data);
    let _ = decode_response(data);
});
