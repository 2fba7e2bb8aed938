pub const COMMAND_NAME_MAX_LENGTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
/// One parsed command invocation: the command name plus its raw argument
/// text. Produced per message, never persisted.
pub struct CommandInvocation {
    pub name: String,
    pub raw_args: String,
}

/// Purely lexical parse of message text against the configured command
/// prefix. Returns `None` for anything that is not a command; never fails on
/// well-typed input and knows nothing about which commands exist.
pub fn parse_command_invocation(text: &str, prefix: &str) -> Option<CommandInvocation> {
    if prefix.is_empty() {
        return None;
    }
    let trimmed = text.trim_start();
    let rest = trimmed.strip_prefix(prefix)?;
    let mut parts = rest.splitn(2, char::is_whitespace);
    let name = parts.next().unwrap_or("");
    if name.is_empty() {
        return None;
    }
    let raw_args = parts.next().unwrap_or("").trim();
    Some(CommandInvocation {
        name: name.to_ascii_lowercase(),
        raw_args: raw_args.to_string(),
    })
}

/// Command names are lowercase alphanumerics with interior `-`/`_`, bounded
/// in length; the same rule applies to built-ins and custom definitions.
pub fn is_valid_command_name(name: &str) -> bool {
    if name.is_empty() || name.len() > COMMAND_NAME_MAX_LENGTH {
        return false;
    }
    let mut characters = name.chars();
    let Some(first) = characters.next() else {
        return false;
    };
    if !first.is_ascii_lowercase() && !first.is_ascii_digit() {
        return false;
    }
    characters.all(|character| {
        character.is_ascii_lowercase()
            || character.is_ascii_digit()
            || matches!(character, '-' | '_')
    })
}

#[cfg(test)]
mod tests {
    use super::{is_valid_command_name, parse_command_invocation, CommandInvocation};

    #[test]
    fn unit_parse_recognizes_prefixed_command_with_args() {
        assert_eq!(
            parse_command_invocation("!roll 2d6", "!"),
            Some(CommandInvocation {
                name: "roll".to_string(),
                raw_args: "2d6".to_string(),
            })
        );
    }

    #[test]
    fn unit_parse_rejects_plain_text() {
        assert_eq!(parse_command_invocation("hello there", "!"), None);
        assert_eq!(parse_command_invocation("", "!"), None);
        assert_eq!(parse_command_invocation("!", "!"), None);
        assert_eq!(parse_command_invocation("! ", "!"), None);
    }

    #[test]
    fn unit_parse_normalizes_whitespace_only_args_to_empty() {
        let invocation = parse_command_invocation("!ping   \t  ", "!").expect("parses");
        assert_eq!(invocation.name, "ping");
        assert_eq!(invocation.raw_args, "");
    }

    #[test]
    fn unit_parse_keeps_interior_argument_whitespace() {
        let invocation =
            parse_command_invocation("!command add greet hello   there", "!").expect("parses");
        assert_eq!(invocation.raw_args, "add greet hello   there");
    }

    #[test]
    fn unit_parse_honors_configured_prefix_and_lowercases_names() {
        assert_eq!(parse_command_invocation("!ping", "~"), None);
        let invocation = parse_command_invocation("~PING", "~").expect("parses");
        assert_eq!(invocation.name, "ping");
    }

    #[test]
    fn unit_parse_accepts_multi_character_prefix() {
        let invocation = parse_command_invocation("h!help", "h!").expect("parses");
        assert_eq!(invocation.name, "help");
    }

    #[test]
    fn unit_command_name_validation() {
        assert!(is_valid_command_name("roll"));
        assert!(is_valid_command_name("emoji-usage"));
        assert!(is_valid_command_name("8ball"));
        assert!(!is_valid_command_name(""));
        assert!(!is_valid_command_name("-leading-dash"));
        assert!(!is_valid_command_name("Upper"));
        assert!(!is_valid_command_name("has space"));
        assert!(!is_valid_command_name(&"x".repeat(65)));
    }
}
