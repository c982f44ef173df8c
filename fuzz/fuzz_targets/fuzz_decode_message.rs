#![no_main]

use libfuzzer_sys::fuzz_target;
use fundamentalnode::network::decode_message;

fuzz_target!(|data: &[u8]| {
    // A 4-byte LE length prefix followed by a bincode payload. Arbitrary
    // input must decode to None, never panic.
    let _ = decode_message(data);
});
