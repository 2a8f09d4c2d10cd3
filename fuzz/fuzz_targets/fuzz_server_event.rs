#![no_main]

use libfuzzer_sys::fuzz_target;
use rps_match_client::protocol::ServerEvent;

fuzz_target!(|data: &[u8]| {
    // Frames arrive as text, but the byte path also covers invalid UTF-8.
    let _ = serde_json::from_slice::<ServerEvent>(data);

    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(event) = serde_json::from_str::<ServerEvent>(s) {
            // Anything we accept must re-encode under the same event name.
            let encoded = serde_json::to_value(&event).expect("re-encode");
            assert_eq!(encoded["event"], event.name());
        }
    }
});
