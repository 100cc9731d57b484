#![no_main]

use libfuzzer_sys::fuzz_target;
use procmux::core::packet::Packet;

fuzz_target!(|data: &[u8]| {
    // Decoding must fail cleanly; anything that decodes must encode again
    if let Ok(packet) = Packet::decode(data) {
        let _ = packet.encode();
    }
});
