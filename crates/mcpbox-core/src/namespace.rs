//! Tool/resource/prompt namespacing.
//!
//! Prefixes identifiers coming from a managed server with the server name and
//! a double underscore (e.g. `mock__echo`), so that the merged catalogue has
//! globally unique names and the prefix alone routes a request back to its
//! server. Server names themselves may not contain `__`; identifiers may.

/// Separator between the server name and the original identifier.
pub const SEPARATOR: &str = "__";

/// Qualify `name` with `server`: `("mock", "echo")` → `"mock__echo"`.
pub fn encode(server: &str, name: &str) -> String {
    format!("{server}{SEPARATOR}{name}")
}

/// Extract the server name from a qualified identifier.
///
/// Returns `None` when the identifier carries no separator or the prefix is
/// empty (an identifier starting with `__` was never produced by `encode`).
pub fn decode(qualified: &str) -> Option<&str> {
    match qualified.split_once(SEPARATOR) {
        Some(("", _)) => None,
        Some((server, _)) => Some(server),
        None => None,
    }
}

/// Strip the `server__` prefix, recovering the original identifier.
///
/// Splits at the first separator only, so names that themselves contain `__`
/// survive a round trip.
pub fn strip<'a>(server: &str, qualified: &'a str) -> Option<&'a str> {
    qualified.strip_prefix(server)?.strip_prefix(SEPARATOR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode() {
        assert_eq!(encode("mock", "echo"), "mock__echo");
        assert_eq!(encode("gh", "list_repos"), "gh__list_repos");
    }

    #[test]
    fn test_decode() {
        assert_eq!(decode("mock__echo"), Some("mock"));
        assert_eq!(decode("a__b__c"), Some("a"));
    }

    #[test]
    fn test_decode_not_namespaced() {
        assert_eq!(decode("echo"), None);
        assert_eq!(decode("__echo"), None);
        assert_eq!(decode(""), None);
    }

    #[test]
    fn test_strip() {
        assert_eq!(strip("mock", "mock__echo"), Some("echo"));
        assert_eq!(strip("mock", "other__echo"), None);
        assert_eq!(strip("mock", "mockecho"), None);
    }

    #[test]
    fn test_roundtrip_with_separator_in_name() {
        // A tool legitimately named "get__thing" must survive.
        let qualified = encode("srv", "get__thing");
        assert_eq!(qualified, "srv__get__thing");
        assert_eq!(strip("srv", &qualified), Some("get__thing"));
        assert_eq!(decode(&qualified), Some("srv"));
    }

    #[test]
    fn test_roundtrip_empty_name() {
        let qualified = encode("srv", "");
        assert_eq!(strip("srv", &qualified), Some(""));
    }

    #[test]
    fn test_collision_freedom() {
        // Two servers exposing the same tool stay distinct.
        assert_ne!(encode("a", "x"), encode("b", "x"));
    }
}
