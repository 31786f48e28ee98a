//! Fuzz target for handshake target parsing.
//!
//! Arbitrary paths and query strings must never panic, and an accepted id
//! is never blank or over the length cap, and only whole path segments
//! match the prefix.

#![no_main]

use fanout_engine::connection::{client_id_from_target, MAX_CLIENT_ID_LEN};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (&str, Option<&str>, bool)| {
    let (path, query, with_prefix) = data;
    let prefix = with_prefix.then_some("/ws");

    if let Ok(id) = client_id_from_target(path, query, prefix) {
        assert!(!id.trim().is_empty());
        assert!(id.len() <= MAX_CLIENT_ID_LEN);
        if let Some(prefix) = prefix {
            let rest = path.strip_prefix(prefix);
            assert!(rest.is_some_and(|rest| rest.is_empty() || rest.starts_with('/')));
        }
    }
});
