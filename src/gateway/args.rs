//! Module argument strings
//!
//! The sound server reports a loaded module's arguments as a single
//! `key=value key2="quoted value"` string. Parsing follows the server's own
//! tokenizer so that anything it accepted on load can be read back.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArgsError {
    #[error("unexpected '=' at position {0}")]
    UnexpectedEquals(usize),

    #[error("duplicate key `{0}`")]
    DuplicateKey(String),

    #[error("unexpected end of arguments")]
    UnexpectedEnd,
}

/// Ordered key/value module arguments
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleArgs {
    entries: Vec<(String, String)>,
}

impl ModuleArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_u32(&self, key: &str) -> Option<u32> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(parse_bool)
    }

    /// Set a value, replacing any previous one for the same key.
    pub fn set(&mut self, key: impl Into<String>, value: impl ToString) -> &mut Self {
        let key = key.into();
        let value = value.to_string();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
        self
    }

    pub fn set_bool(&mut self, key: impl Into<String>, value: bool) -> &mut Self {
        self.set(key, if value { "y" } else { "n" })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn insert_new(&mut self, key: &str, value: &str) -> Result<(), ArgsError> {
        if self.get(key).is_some() {
            return Err(ArgsError::DuplicateKey(key.to_string()));
        }
        self.entries.push((key.to_string(), value.to_string()));
        Ok(())
    }
}

/// Accepts the server's boolean spellings, case-insensitively.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "t" | "y" | "true" | "yes" | "on" => Some(true),
        "0" | "f" | "n" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse an argument string as printed by `list short modules`.
pub fn parse(input: &str) -> Result<ModuleArgs, ArgsError> {
    enum State {
        Whitespace,
        Key,
        ValueStart,
        Simple,
        DoubleQuoted,
        Ticked,
    }

    let mut args = ModuleArgs::new();
    let mut state = State::Whitespace;
    let mut key_start = 0;
    let mut key_end = 0;
    let mut value_start = 0;

    for (i, c) in input.char_indices() {
        match state {
            State::Whitespace => {
                if c == '=' {
                    return Err(ArgsError::UnexpectedEquals(i));
                }
                if !c.is_whitespace() {
                    key_start = i;
                    state = State::Key;
                }
            }
            State::Key => {
                if c == '=' {
                    key_end = i;
                    state = State::ValueStart;
                }
            }
            State::ValueStart => match c {
                '\'' => {
                    value_start = i + 1;
                    state = State::Ticked;
                }
                '"' => {
                    value_start = i + 1;
                    state = State::DoubleQuoted;
                }
                c if c.is_whitespace() => {
                    args.insert_new(&input[key_start..key_end], "")?;
                    state = State::Whitespace;
                }
                _ => {
                    value_start = i;
                    state = State::Simple;
                }
            },
            State::Simple => {
                if c.is_whitespace() {
                    args.insert_new(&input[key_start..key_end], &input[value_start..i])?;
                    state = State::Whitespace;
                }
            }
            State::DoubleQuoted => {
                if c == '"' {
                    args.insert_new(&input[key_start..key_end], &input[value_start..i])?;
                    state = State::Whitespace;
                }
            }
            State::Ticked => {
                if c == '\'' {
                    args.insert_new(&input[key_start..key_end], &input[value_start..i])?;
                    state = State::Whitespace;
                }
            }
        }
    }

    match state {
        State::Whitespace => {}
        State::ValueStart => args.insert_new(&input[key_start..key_end], "")?,
        State::Simple => args.insert_new(&input[key_start..key_end], &input[value_start..])?,
        State::Key | State::DoubleQuoted | State::Ticked => return Err(ArgsError::UnexpectedEnd),
    }

    Ok(args)
}

/// Render arguments for a load command.
pub fn format(args: &ModuleArgs) -> String {
    args.iter()
        .map(|(key, value)| format!("{}={}", key, quote(value)))
        .collect::<Vec<_>>()
        .join(" ")
}

fn quote(value: &str) -> String {
    if !value.chars().any(char::is_whitespace) {
        value.to_string()
    } else if value.contains('"') {
        format!("'{}'", value)
    } else {
        format!("\"{}\"", value)
    }
}
