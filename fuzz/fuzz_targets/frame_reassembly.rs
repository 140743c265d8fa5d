#![no_main]

use libfuzzer_sys::fuzz_target;
use starbridge_wire::wire::FrameBuffer;
use starbridge_wire::{DebugEvent, WireError};

fuzz_target!(|data: &[u8]| {
    let Some((&split, rest)) = data.split_first() else {
        return;
    };
    let chunk = usize::from(split).max(1);

    // Decoding everything at once and feeding the same bytes in chunks must
    // agree on every frame up to the first corrupt length prefix. Frames with
    // undecodable payloads are skipped by both.
    let mut whole = FrameBuffer::new();
    whole.extend(rest);
    let mut expected = Vec::new();
    loop {
        match whole.decode_next::<DebugEvent>() {
            Ok(Some(event)) => expected.push(event),
            Err(WireError::MalformedFrame { .. }) => continue,
            Ok(None) | Err(_) => break,
        }
    }

    let mut chunked = FrameBuffer::new();
    let mut actual = Vec::new();
    'feed: for piece in rest.chunks(chunk) {
        chunked.extend(piece);
        loop {
            match chunked.decode_next::<DebugEvent>() {
                Ok(Some(event)) => actual.push(event),
                Ok(None) => break,
                Err(WireError::MalformedFrame { .. }) => continue,
                Err(_) => break 'feed,
            }
        }
    }

    assert_eq!(expected, actual);
});
