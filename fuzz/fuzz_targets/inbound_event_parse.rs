#![no_main]

use herald_runtime::InboundChatEvent;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let raw = String::from_utf8_lossy(data);
    if let Ok(event) = serde_json::from_str::<InboundChatEvent>(&raw) {
        let line = serde_json::to_string(&event).expect("parsed event must re-encode");
        let round_tripped: InboundChatEvent =
            serde_json::from_str(&line).expect("encoded event must re-parse");
        assert_eq!(round_tripped, event);
    }
});
