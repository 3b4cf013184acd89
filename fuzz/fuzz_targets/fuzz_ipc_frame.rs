//! Fuzz target for length-prefixed frame reading.

#![no_main]

use im_core::ipc::frame::read_frame;
use libfuzzer_sys::fuzz_target;

const MAX_FRAME: usize = 64 * 1024;

fuzz_target!(|data: &[u8]| {
    let Ok(rt) = tokio::runtime::Builder::new_current_thread().build() else {
        return;
    };
    rt.block_on(async {
        let mut reader = data;
        // Read until EOF or the first error; each call must return, not panic.
        while let Ok(Some(frame)) = read_frame(&mut reader, MAX_FRAME).await {
            assert!(frame.len() <= MAX_FRAME);
        }
    });
});
