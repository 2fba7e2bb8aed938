#![no_main]

use herald_commands::parse_command_invocation;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let text = String::from_utf8_lossy(data);
    for prefix in ["!", "~", "h!"] {
        if let Some(invocation) = parse_command_invocation(&text, prefix) {
            assert!(!invocation.name.is_empty());
            assert!(!invocation.name.chars().any(char::is_whitespace));
            assert_eq!(invocation.name, invocation.name.to_ascii_lowercase());
            assert_eq!(invocation.raw_args, invocation.raw_args.trim());
        }
    }
});
