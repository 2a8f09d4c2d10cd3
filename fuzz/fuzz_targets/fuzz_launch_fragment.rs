#![no_main]

use libfuzzer_sys::fuzz_target;
use rps_match_client::LaunchUser;

fuzz_target!(|data: &[u8]| {
    if let Ok(fragment) = std::str::from_utf8(data) {
        if let Ok(Some(user)) = LaunchUser::from_fragment(fragment) {
            let _ = user.handle();
            let _ = user.display_name();
        }
    }
});
