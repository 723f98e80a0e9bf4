#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Host input is untrusted text; parsing must never panic
    if let Ok(line) = std::str::from_utf8(data) {
        let _ = evcm::bridge::parse_line(line);
    }
});
