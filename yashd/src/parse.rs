//! Command-line parser: single optional pipe, per-side I/O redirection,
//! optional trailing `&`. The first syntax violation wins and parsing stops.

use std::fmt;

use crate::jobs::{CmdSpec, Parsed};

const I_REDIR: &str = "<";
const O_REDIR: &str = ">";
const E_REDIR: &str = "2>";
const PIPE: &str = "|";
const BG: &str = "&";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyntaxError {
    StartsWith(String),
    NearToken(String),
    EndsWith(String),
    BgNotLast,
}

impl fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyntaxError::StartsWith(tok) => {
                write!(f, "syntax error: command should not start with {tok}")
            }
            SyntaxError::NearToken(tok) => write!(f, "syntax error: near token {tok}"),
            SyntaxError::EndsWith(tok) => {
                write!(f, "syntax error: command should not end with {tok}")
            }
            SyntaxError::BgNotLast => {
                write!(f, "syntax error: & should be the last token of the command")
            }
        }
    }
}

fn is_special(tok: &str) -> bool {
    matches!(tok, I_REDIR | O_REDIR | E_REDIR | PIPE | BG)
}

/// Split on single spaces; runs of spaces collapse to nothing.
pub fn tokenize(line: &str) -> Vec<String> {
    line.split(' ')
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Scan the token sequence into a job description. `tokens` must come from
/// [`tokenize`] on the same line.
pub fn parse(tokens: &[String]) -> Result<Parsed, SyntaxError> {
    let mut left = CmdSpec::default();
    let mut right = CmdSpec::default();
    let mut pipe = false;
    let mut background = false;
    // Argument count of the side being filled; resets when `|` is crossed.
    let mut side_argc = 0usize;

    let mut i = 0;
    while i < tokens.len() {
        let tok = tokens[i].as_str();
        match tok {
            I_REDIR | O_REDIR | E_REDIR => {
                if side_argc == 0 {
                    return Err(SyntaxError::StartsWith(tok.to_string()));
                } else if i + 1 >= tokens.len() {
                    return Err(SyntaxError::EndsWith(tok.to_string()));
                } else if is_special(&tokens[i + 1]) {
                    return Err(SyntaxError::NearToken(tok.to_string()));
                }
                i += 1;
                let path = tokens[i].clone();
                let side = if pipe { &mut right } else { &mut left };
                match tok {
                    I_REDIR => side.stdin = Some(path),
                    O_REDIR => side.stdout = Some(path),
                    _ => side.stderr = Some(path),
                }
            }
            PIPE => {
                if side_argc == 0 {
                    return Err(SyntaxError::StartsWith(tok.to_string()));
                } else if i + 1 >= tokens.len() {
                    return Err(SyntaxError::EndsWith(tok.to_string()));
                } else if is_special(&tokens[i + 1]) {
                    return Err(SyntaxError::NearToken(tok.to_string()));
                }
                pipe = true;
                side_argc = 0;
            }
            BG => {
                if i != tokens.len() - 1 {
                    return Err(SyntaxError::BgNotLast);
                }
                background = true;
            }
            _ => {
                let side = if pipe { &mut right } else { &mut left };
                side.argv.push(tok.to_string());
                side_argc += 1;
            }
        }
        i += 1;
    }

    Ok(Parsed {
        left,
        right: if pipe { Some(right) } else { None },
        background,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_line(line: &str) -> Result<Parsed, SyntaxError> {
        parse(&tokenize(line))
    }

    #[test]
    fn simple_command() {
        let p = parse_line("echo hello").unwrap();
        assert_eq!(p.left.argv, vec!["echo", "hello"]);
        assert!(p.right.is_none());
        assert!(!p.background);
    }

    #[test]
    fn whitespace_collapses() {
        let toks = tokenize("  ls   -l  ");
        assert_eq!(toks, vec!["ls", "-l"]);
    }

    #[test]
    fn full_grammar() {
        let p = parse_line("cat < in | grep x > out 2> err &").unwrap();
        assert_eq!(p.left.argv, vec!["cat"]);
        assert_eq!(p.left.stdin.as_deref(), Some("in"));
        let r = p.right.unwrap();
        assert_eq!(r.argv, vec!["grep", "x"]);
        assert_eq!(r.stdout.as_deref(), Some("out"));
        assert_eq!(r.stderr.as_deref(), Some("err"));
        assert!(p.background);
    }

    #[test]
    fn redirection_before_pipe_goes_left() {
        let p = parse_line("sort < data | uniq").unwrap();
        assert_eq!(p.left.stdin.as_deref(), Some("data"));
        assert!(p.right.unwrap().stdin.is_none());
    }

    #[test]
    fn leading_redirection_rejected() {
        assert_eq!(
            parse_line("> out"),
            Err(SyntaxError::StartsWith(">".to_string()))
        );
        assert_eq!(
            parse_line("| grep x"),
            Err(SyntaxError::StartsWith("|".to_string()))
        );
    }

    #[test]
    fn redirection_right_after_pipe_rejected() {
        // The pipe's lookahead fires before the right side ever opens.
        assert_eq!(
            parse_line("ls | < in wc"),
            Err(SyntaxError::NearToken("|".to_string()))
        );
    }

    #[test]
    fn trailing_operator_rejected() {
        assert_eq!(
            parse_line("cat <"),
            Err(SyntaxError::EndsWith("<".to_string()))
        );
        assert_eq!(
            parse_line("ls |"),
            Err(SyntaxError::EndsWith("|".to_string()))
        );
    }

    #[test]
    fn operator_chains_rejected() {
        assert_eq!(
            parse_line("cat < > out"),
            Err(SyntaxError::NearToken("<".to_string()))
        );
        assert_eq!(
            parse_line("ls | | wc"),
            Err(SyntaxError::NearToken("|".to_string()))
        );
    }

    #[test]
    fn background_must_be_last() {
        assert_eq!(parse_line("sleep 1 & echo"), Err(SyntaxError::BgNotLast));
        assert!(parse_line("sleep 1 &").unwrap().background);
    }

    #[test]
    fn error_messages_match_templates() {
        assert_eq!(
            parse_line("> out").unwrap_err().to_string(),
            "syntax error: command should not start with >"
        );
        assert_eq!(
            parse_line("cat <").unwrap_err().to_string(),
            "syntax error: command should not end with <"
        );
        assert_eq!(
            parse_line("cat < > x").unwrap_err().to_string(),
            "syntax error: near token <"
        );
        assert_eq!(
            parse_line("a & b").unwrap_err().to_string(),
            "syntax error: & should be the last token of the command"
        );
    }

    #[test]
    fn argv_reserialization_reproduces_tokens() {
        // Rebuilding the token stream from the parse result reproduces the
        // input sequence modulo collapsed whitespace.
        let line = "cat < in | grep x > out &";
        let toks = tokenize(line);
        let p = parse(&toks).unwrap();
        let mut rebuilt = Vec::new();
        rebuilt.extend(p.left.argv.iter().cloned());
        if let Some(f) = &p.left.stdin {
            rebuilt.push("<".into());
            rebuilt.push(f.clone());
        }
        rebuilt.push("|".into());
        let r = p.right.as_ref().unwrap();
        rebuilt.extend(r.argv.iter().cloned());
        if let Some(f) = &r.stdout {
            rebuilt.push(">".into());
            rebuilt.push(f.clone());
        }
        rebuilt.push("&".into());
        assert_eq!(rebuilt, toks);
    }
}
