//! Command-line parsing for model `cmd`/`cmdStop` strings.
//!
//! Commands are authored as free-form multi-line shell-ish text: backslash
//! line continuations, `#`-prefixed comments, and quoted runs are supported,
//! but the result is never handed to a real shell — it is tokenized directly
//! into an argument vector that `tokio::process::Command` can exec.

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CommandParseError {
    #[error("command is empty")]
    Empty,
    #[error("unterminated quote starting at byte {0}")]
    UnterminatedQuote(usize),
    #[error("dangling escape character at end of input")]
    DanglingEscape,
}

/// Fold `\`-newline continuations into a single space.
///
/// Handles both `cmd \\\ncmd2` and `cmd \\ \ncmd2` (trailing space before the
/// backslash is fine; only the backslash-then-newline pair is collapsed).
fn fold_continuations(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            // Look ahead past the backslash for an optional preceding space
            // already emitted; we only special-case `\` immediately followed
            // by `\n` (optionally `\r\n`).
            match chars.peek() {
                Some('\n') => {
                    chars.next();
                    out.push(' ');
                    continue;
                }
                Some('\r') => {
                    let mut lookahead = chars.clone();
                    lookahead.next();
                    if lookahead.peek() == Some(&'\n') {
                        chars.next();
                        chars.next();
                        out.push(' ');
                        continue;
                    }
                    out.push(c);
                }
                _ => out.push(c),
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Strip a `#`-prefixed comment from one line, respecting quotes.
fn strip_comment(line: &str) -> &str {
    let mut in_single = false;
    let mut in_double = false;
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if !in_single => escaped = true,
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            '#' if !in_single && !in_double => return &line[..i],
            _ => {}
        }
    }
    line
}

/// Tokenize a pre-continuation-folded command string using POSIX-ish shell
/// quoting rules: single quotes are literal, double quotes allow `\`
/// escapes of `"`, `\`, `$`, and backtick, and bare backslash escapes the
/// next character outside quotes.
pub fn tokenize(input: &str) -> Result<Vec<String>, CommandParseError> {
    let folded = fold_continuations(input);

    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut has_current = false;
    let mut in_single = false;
    let mut in_double = false;
    let mut escaped = false;
    let mut quote_start: Option<usize> = None;

    for line in folded.split('\n') {
        let line = if in_single || in_double { line } else { strip_comment(line) };
        for (i, c) in line.char_indices() {
            if escaped {
                current.push(c);
                has_current = true;
                escaped = false;
                continue;
            }
            match c {
                '\\' if !in_single => escaped = true,
                '\'' if !in_double => {
                    in_single = !in_single;
                    has_current = true;
                    quote_start = if in_single { Some(i) } else { None };
                }
                '"' if !in_single => {
                    in_double = !in_double;
                    has_current = true;
                    quote_start = if in_double { Some(i) } else { None };
                }
                c if c.is_whitespace() && !in_single && !in_double => {
                    if has_current {
                        tokens.push(std::mem::take(&mut current));
                        has_current = false;
                    }
                }
                _ => {
                    current.push(c);
                    has_current = true;
                }
            }
        }
        if !in_single && !in_double {
            if has_current {
                tokens.push(std::mem::take(&mut current));
                has_current = false;
            }
        } else {
            // Quoted runs may legitimately span lines (the line split on
            // `\n` rejoins via an implicit newline inside the token).
            current.push('\n');
        }
    }

    if escaped {
        return Err(CommandParseError::DanglingEscape);
    }
    if in_single || in_double {
        return Err(CommandParseError::UnterminatedQuote(quote_start.unwrap_or(0)));
    }
    if has_current {
        tokens.push(current);
    }

    if tokens.is_empty() {
        return Err(CommandParseError::Empty);
    }

    Ok(tokens)
}

/// Replace every occurrence of the literal `${PORT}` token with `port`.
///
/// Substitution is purely textual and happens on the *pre-tokenized*
/// string, per spec: a command like `--port=${PORT}` becomes
/// `--port=8001` before quoting/escaping is ever considered.
pub fn substitute_port(input: &str, port: u16) -> String {
    input.replace("${PORT}", &port.to_string())
}

/// Replace every occurrence of `${PID}` in a `cmdStop` override with the
/// child's process id (spec.md §4.4.4).
pub fn substitute_pid(input: &str, pid: u32) -> String {
    input.replace("${PID}", &pid.to_string())
}
