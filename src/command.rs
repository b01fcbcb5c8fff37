//! Command-phase parsing for the Zork control channel.
//!
//! Lines are tokenized on runs of non-word characters; only the verb (the
//! first token) is case-insensitive. Once a session selects a mode the
//! parser is never consulted again.

/// Reply to the `version` verb.
pub const VERSION_REPLY: &str = "zork 1.0";

/// Reply to the `xyzzy` verb.
pub const XYZZY_REPLY: &str = "Nothing happens.";

/// Reply to a `transform` line that is neither `with` nor `config`.
pub const TRANSFORM_USAGE: &str = "usage: transform with <name> | transform config <json>";

const CONFIG_MARKER: &str = " config ";

/// A parsed command-phase line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ping,
    Xyzzy,
    Version,
    Quit,
    Getters,
    TransformWith { name: String },
    TransformConfig { raw: String },
    TransformUsage,
    Give,
    Get,
    Unknown { verb: String },
    /// Whitespace-only line; produces no reply.
    Empty,
}

pub fn parse(line: &str) -> Command {
    let tokens: Vec<&str> = line
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|token| !token.is_empty())
        .collect();
    let Some(first) = tokens.first() else {
        return Command::Empty;
    };
    let verb = first.to_lowercase();

    match verb.as_str() {
        "ping" => Command::Ping,
        "xyzzy" => Command::Xyzzy,
        "version" => Command::Version,
        "quit" => Command::Quit,
        "getters" => Command::Getters,
        "give" => Command::Give,
        "get" => Command::Get,
        "transform" => parse_transform(line, &tokens),
        _ => Command::Unknown { verb },
    }
}

fn parse_transform(line: &str, tokens: &[&str]) -> Command {
    if tokens.get(1) == Some(&"with") {
        if let Some(name) = tokens.get(2) {
            return Command::TransformWith {
                name: (*name).to_string(),
            };
        }
    }
    // The config payload is the raw suffix after the literal ` config `
    // marker, not a token, so embedded JSON survives untouched.
    if tokens.get(1) == Some(&"config") {
        if let Some(index) = line.find(CONFIG_MARKER) {
            return Command::TransformConfig {
                raw: line[index + CONFIG_MARKER.len()..].to_string(),
            };
        }
    }
    Command::TransformUsage
}

pub fn unknown_reply(verb: &str) -> String {
    format!("I don't understand that command. ({verb})")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_plain_verbs() {
        assert_eq!(parse("ping"), Command::Ping);
        assert_eq!(parse("xyzzy"), Command::Xyzzy);
        assert_eq!(parse("version"), Command::Version);
        assert_eq!(parse("quit"), Command::Quit);
        assert_eq!(parse("getters"), Command::Getters);
        assert_eq!(parse("give"), Command::Give);
        assert_eq!(parse("get"), Command::Get);
    }

    #[test]
    fn verb_is_case_insensitive() {
        assert_eq!(parse("PING"), Command::Ping);
        assert_eq!(parse("Give"), Command::Give);
    }

    #[test]
    fn unknown_verbs_are_reported_lowercased() {
        assert_eq!(
            parse("Nonsense here"),
            Command::Unknown {
                verb: "nonsense".to_string()
            }
        );
        assert_eq!(
            unknown_reply("nonsense"),
            "I don't understand that command. (nonsense)"
        );
    }

    #[test]
    fn transform_with_records_the_name() {
        assert_eq!(
            parse("transform with caesar"),
            Command::TransformWith {
                name: "caesar".to_string()
            }
        );
    }

    #[test]
    fn transform_config_keeps_the_raw_suffix() {
        assert_eq!(
            parse("transform config {\"k\":1}"),
            Command::TransformConfig {
                raw: "{\"k\":1}".to_string()
            }
        );
    }

    #[test]
    fn transform_subcommands_are_case_sensitive() {
        assert_eq!(parse("transform WITH caesar"), Command::TransformUsage);
    }

    #[test]
    fn bare_transform_gets_usage() {
        assert_eq!(parse("transform"), Command::TransformUsage);
        assert_eq!(parse("transform sideways"), Command::TransformUsage);
    }

    #[test]
    fn whitespace_only_lines_are_empty() {
        assert_eq!(parse("   "), Command::Empty);
    }
}
