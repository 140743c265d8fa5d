#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes must decode, report an incomplete frame, or fail
    // cleanly; never panic.
    let _ = starbridge_wire::decode_event_bytes(data);
    let _ = starbridge_wire::decode_request_bytes(data);
});
