// Parsers for the files steps write to communicate back to the runner
// (`GITHUB_ENV`, `GITHUB_OUTPUT`, `GITHUB_STATE`, `GITHUB_PATH`).

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FileCommandError {
    #[error("invalid heredoc line '{0}': name and delimiter are required")]
    InvalidHeredoc(String),
    #[error("heredoc for '{name}' is missing its closing delimiter '{delimiter}'")]
    UnterminatedHeredoc { name: String, delimiter: String },
    #[error("invalid line '{0}': expected NAME=VALUE or NAME<<DELIMITER")]
    InvalidLine(String),
}

/// Parse a `KEY=VALUE` / heredoc file into ordered pairs.
///
/// Supported forms:
/// - `NAME=VALUE`
/// - `NAME<<DELIMITER`, followed by value lines, closed by a line equal to `DELIMITER`
///
/// A later entry with the same name overrides an earlier one once collected into a map.
pub fn parse_key_value_file(content: &str) -> Result<Vec<(String, String)>, FileCommandError> {
    let mut pairs = Vec::new();
    let mut lines = content.lines();

    while let Some(line) = lines.next() {
        if line.trim().is_empty() {
            continue;
        }

        let heredoc = line.find("<<");
        let equals = line.find('=');
        match (heredoc, equals) {
            // `=` before `<<` means the value itself contains `<<`.
            (Some(h), Some(e)) if e < h => pairs.push(split_assignment(line, e)),
            (Some(h), _) => {
                let name = line[..h].trim();
                let delimiter = line[h + 2..].trim();
                if name.is_empty() || delimiter.is_empty() {
                    return Err(FileCommandError::InvalidHeredoc(line.to_string()));
                }

                let mut value = Vec::new();
                let mut closed = false;
                for value_line in lines.by_ref() {
                    if value_line.trim_end_matches('\r') == delimiter {
                        closed = true;
                        break;
                    }
                    value.push(value_line);
                }
                if !closed {
                    return Err(FileCommandError::UnterminatedHeredoc {
                        name: name.to_string(),
                        delimiter: delimiter.to_string(),
                    });
                }
                pairs.push((name.to_string(), value.join("\n")));
            }
            (None, Some(e)) => pairs.push(split_assignment(line, e)),
            (None, None) => return Err(FileCommandError::InvalidLine(line.to_string())),
        }
    }

    Ok(pairs)
}

fn split_assignment(line: &str, at: usize) -> (String, String) {
    (
        line[..at].trim().to_string(),
        line[at + 1..].trim_end_matches('\r').to_string(),
    )
}

/// Parse a `GITHUB_PATH` file: one directory per non-empty line, in file order.
pub fn parse_path_file(content: &str) -> Vec<String> {
    content
        .lines()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_assignments() {
        let pairs = parse_key_value_file("A=1\n\nB=two=2\n").unwrap();
        assert_eq!(
            pairs,
            vec![("A".into(), "1".into()), ("B".into(), "two=2".into())]
        );
    }

    #[test]
    fn test_heredoc_value() {
        let content = "MSG<<EOF\nline one\nline two\nEOF\nNEXT=x\n";
        let pairs = parse_key_value_file(content).unwrap();
        assert_eq!(pairs[0], ("MSG".into(), "line one\nline two".into()));
        assert_eq!(pairs[1], ("NEXT".into(), "x".into()));
    }

    #[test]
    fn test_value_containing_heredoc_marker() {
        let pairs = parse_key_value_file("CMD=cat <<END").unwrap();
        assert_eq!(pairs, vec![("CMD".into(), "cat <<END".into())]);
    }

    #[test]
    fn test_unterminated_heredoc_is_error() {
        let err = parse_key_value_file("MSG<<EOF\nnever closed\n").unwrap_err();
        assert_eq!(
            err,
            FileCommandError::UnterminatedHeredoc {
                name: "MSG".into(),
                delimiter: "EOF".into()
            }
        );
    }

    #[test]
    fn test_line_without_separator_is_error() {
        assert!(matches!(
            parse_key_value_file("garbage"),
            Err(FileCommandError::InvalidLine(_))
        ));
    }

    #[test]
    fn test_parse_path_file() {
        assert_eq!(
            parse_path_file("/opt/bin\n\n  /usr/local/go/bin \n"),
            vec!["/opt/bin".to_string(), "/usr/local/go/bin".to_string()]
        );
    }
}
