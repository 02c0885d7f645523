// ========================================================================================
//
//                              Command Construction
//
// ========================================================================================
//
// Commands handed to the job-array dispatcher are plain shell strings. They are
// part of task identity, so rendering must be fully deterministic: arguments keep
// their insertion order and quoting depends only on the argument text.

use serde::Serialize;
use std::fmt;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
enum Arg {
    Word(String),
    Option { key: String, value: String },
    Flag(String),
}

/// One program invocation with its arguments in a fixed order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandLine {
    program: String,
    args: Vec<Arg>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// A positional word such as a subcommand.
    pub fn word(mut self, word: impl Into<String>) -> Self {
        self.args.push(Arg::Word(word.into()));
        self
    }

    /// `--key value`.
    pub fn opt(mut self, key: &str, value: impl fmt::Display) -> Self {
        self.args.push(Arg::Option {
            key: key.to_string(),
            value: value.to_string(),
        });
        self
    }

    pub fn path_opt(self, key: &str, path: &Path) -> Self {
        let value = path.display().to_string();
        self.opt(key, value)
    }

    /// `--key` on its own when `enabled`.
    pub fn flag(mut self, key: &str, enabled: bool) -> Self {
        if enabled {
            self.args.push(Arg::Flag(key.to_string()));
        }
        self
    }

    pub fn render(&self) -> String {
        let mut words = vec![quote(&self.program)];
        for arg in &self.args {
            match arg {
                Arg::Word(word) => words.push(quote(word)),
                Arg::Option { key, value } => {
                    words.push(format!("--{key}"));
                    words.push(quote(value));
                }
                Arg::Flag(key) => words.push(format!("--{key}")),
            }
        }
        words.join(" ")
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Commands joined by `|`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Pipeline {
    stages: Vec<CommandLine>,
}

impl Pipeline {
    pub fn new(first: CommandLine) -> Self {
        Self {
            stages: vec![first],
        }
    }

    pub fn pipe(mut self, next: CommandLine) -> Self {
        self.stages.push(next);
        self
    }

    pub fn pipe_if(self, enabled: bool, next: impl FnOnce() -> CommandLine) -> Self {
        if enabled { self.pipe(next()) } else { self }
    }

    pub fn stages(&self) -> &[CommandLine] {
        &self.stages
    }

    pub fn render(&self) -> String {
        self.stages
            .iter()
            .map(CommandLine::render)
            .collect::<Vec<_>>()
            .join(" | ")
    }
}

impl From<CommandLine> for Pipeline {
    fn from(command: CommandLine) -> Self {
        Pipeline::new(command)
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

fn is_shell_safe(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || b"-_./:=+,@%".contains(&byte)
}

/// Single-quotes `word` for `sh` unless it consists only of safe characters.
pub fn quote(word: &str) -> String {
    if !word.is_empty() && word.bytes().all(is_shell_safe) {
        return word.to_string();
    }
    let mut quoted = String::with_capacity(word.len() + 2);
    quoted.push('\'');
    for c in word.chars() {
        if c == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(c);
        }
    }
    quoted.push('\'');
    quoted
}
