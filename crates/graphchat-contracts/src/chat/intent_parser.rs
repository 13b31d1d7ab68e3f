use std::collections::BTreeMap;

use serde_json::Value;

use super::command_registry::{
    CommandSpec, MULTI_PATH_COMMANDS, NO_ARG_COMMANDS, POINT_COUNT_COMMANDS, SECRET_ARG_COMMANDS,
    SELECTOR_COMMANDS,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Intent {
    pub action: String,
    pub raw: String,
    pub prompt: Option<String>,
    pub command_args: BTreeMap<String, Value>,
}

impl Intent {
    fn new(action: &str, raw: &str) -> Self {
        Self {
            action: action.to_string(),
            raw: raw.to_string(),
            prompt: None,
            command_args: BTreeMap::new(),
        }
    }
}

fn find_action(command: &str, specs: &[CommandSpec]) -> Option<&'static str> {
    specs
        .iter()
        .find(|spec| spec.command == command)
        .map(|spec| spec.action)
}

fn parse_path_args(arg: &str) -> Vec<String> {
    if arg.trim().is_empty() {
        return Vec::new();
    }
    match shell_words::split(arg) {
        Ok(parts) => parts
            .into_iter()
            .filter(|value| !value.is_empty())
            .collect(),
        Err(_) => arg
            .split_whitespace()
            .map(str::to_string)
            .filter(|value| !value.is_empty())
            .collect(),
    }
}

/// `None` for an empty argument, `Some(Err)` for anything that is not a
/// whole number.
fn parse_point_count(arg: &str) -> Option<Result<u64, String>> {
    let trimmed = arg.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.parse::<u64>().map_err(|_| trimmed.to_string()))
}

/// Command names are the whole first token; `/key-abc` is not `/key`.
fn is_command_name(token: &str) -> bool {
    token
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

fn unknown_command(raw: &str, command: String, arg: &str) -> Intent {
    let mut intent = Intent::new("unknown", raw);
    intent
        .command_args
        .insert("command".to_string(), Value::String(command));
    intent
        .command_args
        .insert("arg".to_string(), Value::String(arg.to_string()));
    intent
}

pub fn parse_intent(text: &str) -> Intent {
    let raw_trimmed = text.trim();
    if raw_trimmed.is_empty() {
        return Intent::new("noop", text);
    }

    if let Some(slash_tail) = raw_trimmed.strip_prefix('/') {
        let (head, remainder) = slash_tail
            .split_once(char::is_whitespace)
            .unwrap_or((slash_tail, ""));
        if !head.is_empty() {
            let command = head.to_ascii_lowercase();
            let arg = remainder.trim();
            if !is_command_name(&command) {
                return unknown_command(text, command, arg);
            }

            if let Some(action) = find_action(&command, SECRET_ARG_COMMANDS) {
                let mut intent = Intent::new(action, "/key ***");
                intent
                    .command_args
                    .insert("key".to_string(), Value::String(arg.to_string()));
                return intent;
            }

            if let Some(action) = find_action(&command, SELECTOR_COMMANDS) {
                let mut intent = Intent::new(action, text);
                intent
                    .command_args
                    .insert("image".to_string(), Value::String(arg.to_string()));
                return intent;
            }

            if let Some(action) = find_action(&command, POINT_COUNT_COMMANDS) {
                let mut intent = Intent::new(action, text);
                match parse_point_count(arg) {
                    None => {}
                    Some(Ok(count)) => {
                        intent
                            .command_args
                            .insert("points".to_string(), Value::Number(count.into()));
                    }
                    Some(Err(raw)) => {
                        intent
                            .command_args
                            .insert("invalid_points".to_string(), Value::String(raw));
                    }
                }
                return intent;
            }

            if let Some(action) = find_action(&command, MULTI_PATH_COMMANDS) {
                let mut intent = Intent::new(action, text);
                intent.command_args.insert(
                    "paths".to_string(),
                    Value::Array(
                        parse_path_args(arg)
                            .into_iter()
                            .map(Value::String)
                            .collect(),
                    ),
                );
                return intent;
            }

            if let Some(action) = find_action(&command, NO_ARG_COMMANDS) {
                return Intent::new(action, text);
            }

            return unknown_command(text, command, arg);
        }
    }

    let mut intent = Intent::new("ask", text);
    intent.prompt = Some(raw_trimmed.to_string());
    intent
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::parse_intent;

    #[test]
    fn parse_upload_quoted_paths() {
        let intent = parse_intent("/upload \"/tmp/a b.png\" c.jpg");
        assert_eq!(intent.action, "upload");
        assert_eq!(intent.command_args["paths"], json!(["/tmp/a b.png", "c.jpg"]));
    }

    #[test]
    fn parse_key_hides_secret_in_raw() {
        let intent = parse_intent("/key AIza-secret");
        assert_eq!(intent.action, "set_key");
        assert_eq!(intent.command_args["key"], json!("AIza-secret"));
        assert!(!intent.raw.contains("AIza-secret"));
    }

    #[test]
    fn parse_selector_commands() {
        let remove = parse_intent("/remove 2");
        assert_eq!(remove.action, "remove_image");
        assert_eq!(remove.command_args["image"], json!("2"));

        let active = parse_intent("/use 3f2a");
        assert_eq!(active.action, "set_active_image");
        assert_eq!(active.command_args["image"], json!("3f2a"));
    }

    #[test]
    fn parse_point_count_commands() {
        let line = parse_intent("/line 12");
        assert_eq!(line.action, "line_chart");
        assert_eq!(line.command_args["points"], json!(12));

        let scatter = parse_intent("/scatter");
        assert_eq!(scatter.action, "scatter_plot");
        assert!(!scatter.command_args.contains_key("points"));

        let bad = parse_intent("/line lots");
        assert_eq!(bad.command_args["invalid_points"], json!("lots"));
    }

    #[test]
    fn parse_no_arg_commands() {
        assert_eq!(parse_intent("/bar").action, "bar_chart");
        assert_eq!(parse_intent("/images").action, "list_images");
        assert_eq!(parse_intent("/history").action, "show_history");
        assert_eq!(parse_intent("/clear_key").action, "clear_key");
        assert_eq!(parse_intent("/HELP").action, "help");
    }

    #[test]
    fn plain_text_is_a_question() {
        let intent = parse_intent("  What's the peak value?  ");
        assert_eq!(intent.action, "ask");
        assert_eq!(intent.prompt.as_deref(), Some("What's the peak value?"));
        assert_eq!(parse_intent("   ").action, "noop");
    }

    #[test]
    fn parse_unknown_command() {
        let intent = parse_intent("/magic foo bar");
        assert_eq!(intent.action, "unknown");
        assert_eq!(intent.command_args["command"], json!("magic"));
        assert_eq!(intent.command_args["arg"], json!("foo bar"));
    }

    #[test]
    fn command_name_must_be_the_whole_first_token() {
        let intent = parse_intent("/key-abc");
        assert_eq!(intent.action, "unknown");
        assert_eq!(intent.command_args["command"], json!("key-abc"));
        assert_eq!(intent.command_args["arg"], json!(""));

        assert_eq!(parse_intent("/line,5").action, "unknown");
        assert_eq!(parse_intent("/KEY\tsecret").action, "set_key");
        assert_eq!(parse_intent("/scatter   7").command_args["points"], json!(7));
    }
}
