// Parsing of `::command key=value,key=value::data` lines written to a step's stdout.

use std::collections::HashMap;

/// The command delimiter used both as prefix and as separator.
const COMMAND_KEY: &str = "::";

/// (escaped, unescaped) pairs for command data. `%25` must come last.
const DATA_ESCAPES: &[(&str, &str)] = &[("%0D", "\r"), ("%0A", "\n"), ("%25", "%")];

/// (escaped, unescaped) pairs for property values. `%25` must come last.
const PROPERTY_ESCAPES: &[(&str, &str)] = &[
    ("%0D", "\r"),
    ("%0A", "\n"),
    ("%3A", ":"),
    ("%2C", ","),
    ("%25", "%"),
];

/// A recognised workflow command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowCommand {
    SetOutput { name: String, value: String },
    SaveState { name: String, value: String },
    AddMask(String),
    AddPath(String),
    Debug(String),
    Notice(String),
    Warning(String),
    Error(String),
    Group(String),
    EndGroup,
}

impl WorkflowCommand {
    /// Parse a single output line. Returns `None` for ordinary output and
    /// for unknown commands, which are passed through as plain text.
    pub fn parse(line: &str) -> Option<WorkflowCommand> {
        let raw = RawCommand::parse(line)?;
        let name = || raw.properties.get("name").cloned().unwrap_or_default();

        let command = match raw.command.as_str() {
            "set-output" => WorkflowCommand::SetOutput {
                name: name(),
                value: raw.data.clone(),
            },
            "save-state" => WorkflowCommand::SaveState {
                name: name(),
                value: raw.data.clone(),
            },
            "add-mask" => WorkflowCommand::AddMask(raw.data.clone()),
            "add-path" => WorkflowCommand::AddPath(raw.data.clone()),
            "debug" => WorkflowCommand::Debug(raw.data.clone()),
            "notice" => WorkflowCommand::Notice(raw.data.clone()),
            "warning" => WorkflowCommand::Warning(raw.data.clone()),
            "error" => WorkflowCommand::Error(raw.data.clone()),
            "group" => WorkflowCommand::Group(raw.data.clone()),
            "endgroup" => WorkflowCommand::EndGroup,
            _ => return None,
        };
        Some(command)
    }
}

struct RawCommand {
    command: String,
    properties: HashMap<String, String>,
    data: String,
}

impl RawCommand {
    fn parse(line: &str) -> Option<RawCommand> {
        let line = line.trim_start();
        let rest = line.strip_prefix(COMMAND_KEY)?;
        let end = rest.find(COMMAND_KEY)?;
        let info = &rest[..end];

        let (command, props) = match info.split_once(' ') {
            Some((command, props)) => (command, props.trim()),
            None => (info, ""),
        };
        if command.is_empty() {
            return None;
        }

        let mut properties = HashMap::new();
        for entry in props.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            if let Some((key, value)) = entry.split_once('=') {
                if !key.is_empty() && !value.is_empty() {
                    properties.insert(key.to_string(), unescape(value, PROPERTY_ESCAPES));
                }
            }
        }

        let data = unescape(&rest[end + COMMAND_KEY.len()..], DATA_ESCAPES);
        Some(RawCommand {
            command: command.to_string(),
            properties,
            data,
        })
    }
}

fn unescape(escaped: &str, table: &[(&str, &str)]) -> String {
    let mut result = escaped.to_string();
    for (token, replacement) in table {
        result = result.replace(token, replacement);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_set_output() {
        let cmd = WorkflowCommand::parse("::set-output name=result::42");
        assert_eq!(
            cmd,
            Some(WorkflowCommand::SetOutput {
                name: "result".into(),
                value: "42".into()
            })
        );
    }

    #[test]
    fn test_parse_add_mask_with_leading_whitespace() {
        let cmd = WorkflowCommand::parse("   ::add-mask::s3cr3t");
        assert_eq!(cmd, Some(WorkflowCommand::AddMask("s3cr3t".into())));
    }

    #[test]
    fn test_unescape_data_and_properties() {
        let cmd = WorkflowCommand::parse("::save-state name=a%3Ab::one%0Atwo%25");
        assert_eq!(
            cmd,
            Some(WorkflowCommand::SaveState {
                name: "a:b".into(),
                value: "one\ntwo%".into()
            })
        );
    }

    #[test]
    fn test_endgroup_without_data() {
        assert_eq!(WorkflowCommand::parse("::endgroup::"), Some(WorkflowCommand::EndGroup));
    }

    #[test]
    fn test_plain_output_and_unknown_commands() {
        assert_eq!(WorkflowCommand::parse("hello world"), None);
        assert_eq!(WorkflowCommand::parse("::frobnicate::x"), None);
        assert_eq!(WorkflowCommand::parse("::missing-terminator"), None);
    }
}
