//! Splits a user supplied command line into an executable path and an
//! argument string.
//!
//! A path containing spaces can be wrapped in single quotes:
//! `'/opt/my app/server' --port 80`.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandLineError {
    #[error("no executable specified")]
    Empty,
    #[error("executable path contains a stray quote")]
    StrayQuote,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitCommand {
    pub executable: String,
    pub arguments: String,
}

impl SplitCommand {
    /// Argument string broken into argv entries with POSIX shell quoting.
    /// Unbalanced quotes are passed through, split on whitespace.
    pub fn argv(&self) -> Vec<String> {
        shell_words::split(&self.arguments).unwrap_or_else(|_| {
            self.arguments
                .split_whitespace()
                .map(str::to_string)
                .collect()
        })
    }
}

#[derive(Debug, Clone)]
pub struct CommandLine {
    raw: String,
    split: Result<SplitCommand, CommandLineError>,
}

impl CommandLine {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim().to_string();
        let split = split(&raw);
        Self { raw, split }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn split(&self) -> Result<&SplitCommand, &CommandLineError> {
        self.split.as_ref()
    }
}

fn split(line: &str) -> Result<SplitCommand, CommandLineError> {
    let quotes = line.find('\'').zip(line.rfind('\''));
    let command = match quotes {
        Some((first, last)) if first != last => {
            let executable = line[first..=last].trim_matches('\'');
            if executable.contains('\'') {
                return Err(CommandLineError::StrayQuote);
            }
            let arguments = format!("{}{}", &line[..first], &line[last + 1..]);
            SplitCommand {
                executable: executable.to_string(),
                arguments: arguments.trim().to_string(),
            }
        }
        _ => {
            let mut tokens = line.split_whitespace();
            let executable = tokens.next().unwrap_or_default().to_string();
            SplitCommand {
                executable,
                arguments: tokens.collect::<Vec<_>>().join(" "),
            }
        }
    };

    if command.executable.is_empty() {
        return Err(CommandLineError::Empty);
    }
    Ok(command)
}
