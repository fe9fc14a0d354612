use std::sync::LazyLock;

use regex::Regex;

// Literal patterns, compiled on first use.
static BOT_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+:[A-Za-z0-9_-]+$").expect("bot token pattern"));
static NUMERIC_CHAT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^-?\d+$").expect("numeric chat id pattern"));
static USERNAME_CHAT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^@[A-Za-z0-9_]+$").expect("chat username pattern"));

/// Telegram bot tokens look like `<numeric bot id>:<secret>`.
pub fn validate_bot_token(token: &str) -> bool {
    BOT_TOKEN_RE.is_match(token.trim())
}

/// Chat ids are numeric (negative for groups) or a public `@username`.
pub fn validate_chat_id(chat_id: &str) -> bool {
    let chat_id = chat_id.trim();
    if chat_id.starts_with('@') {
        USERNAME_CHAT_RE.is_match(chat_id)
    } else {
        NUMERIC_CHAT_RE.is_match(chat_id)
    }
}

#[cfg(test)]
mod tests {
    use super::{
        BOT_TOKEN_RE, NUMERIC_CHAT_RE, USERNAME_CHAT_RE, validate_bot_token, validate_chat_id,
    };
    use std::sync::LazyLock;

    #[test]
    fn patterns_compile_and_are_anchored() {
        for re in [&BOT_TOKEN_RE, &NUMERIC_CHAT_RE, &USERNAME_CHAT_RE] {
            let re = LazyLock::force(re);
            assert!(re.as_str().starts_with('^') && re.as_str().ends_with('$'));
        }
        assert!(!validate_bot_token(" 1:a\n2:b "), "multi-line input must not match");
    }

    #[test]
    fn bot_token_requires_numeric_id_and_secret() {
        assert!(validate_bot_token("123456:ABC-def_ghi"));
        assert!(!validate_bot_token("abc:def"));
        assert!(!validate_bot_token("123456"));
        assert!(!validate_bot_token("123456:has space"));
    }

    #[test]
    fn chat_id_accepts_numbers_groups_and_usernames() {
        assert!(validate_chat_id("42"));
        assert!(validate_chat_id("-1001234"));
        assert!(validate_chat_id("@feedback_channel"));
        assert!(!validate_chat_id("@bad-name"));
        assert!(!validate_chat_id("12a"));
        assert!(!validate_chat_id(""));
    }
}
