//! Fuzz target for inbound control message parsing.
//!
//! Anything a client sends must parse or fail cleanly, and whatever parses
//! must survive a round through `to_json`.

#![no_main]

use fanout_engine::protocol::{parse_client_message, Inbound};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|text: &str| {
    if let Ok(Inbound::Message(message)) = parse_client_message(text) {
        let json = message.to_json().expect("parsed message re-encodes");
        let again = parse_client_message(&json).expect("re-encoded message parses");
        assert_eq!(again, Inbound::Message(message));
    }
});
