#![no_main]

use herald_telemetry::extract_emoji_references;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let text = String::from_utf8_lossy(data);
    for name in extract_emoji_references(&text) {
        assert!(!name.is_empty());
        assert!(name
            .chars()
            .all(|character| character.is_ascii_alphanumeric()
                || matches!(character, '_' | '+' | '-')));
    }
});
