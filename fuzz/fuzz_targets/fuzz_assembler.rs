//! Fuzz target for the receiving-side frame assembler.
//!
//! Feeds an arbitrary interleaving of text and binary frames. The assembler
//! must never panic, and a completed push always carries exactly the bytes
//! its header announced.

#![no_main]

use bytes::Bytes;
use fanout_engine::protocol::{Assembled, FrameAssembler};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|frames: Vec<(bool, Vec<u8>)>| {
    let mut assembler = FrameAssembler::new();
    let mut announced: Option<usize> = None;

    for (is_text, data) in frames {
        if is_text {
            let text = String::from_utf8_lossy(&data);
            announced = serde_size(&text);
            let _ = assembler.on_text(&text);
        } else {
            let len = data.len();
            if let Assembled::Complete(push) = assembler.on_binary(Bytes::from(data)) {
                assert_eq!(push.payload().len(), len);
                assert_eq!(announced, Some(len));
            }
            announced = None;
        }
    }
});

fn serde_size(text: &str) -> Option<usize> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    value.get("data_size")?.as_u64().map(|n| n as usize)
}
