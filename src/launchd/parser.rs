//! Parsers for `launchctl list` output
//!
//! `launchctl list` prints a tab-separated table. `launchctl list <label>` prints
//! the job as an old-style (NeXTSTEP) property list:
//!
//! ```text
//! {
//!     "Label" = "org.postgresql.preferences.pg1";
//!     "PID" = 412;
//!     "ProgramArguments" = (
//!         "/usr/local/bin/postgres";
//!         "-D";
//!     );
//! };
//! ```

use std::iter::Peekable;
use std::str::Chars;

use plist::{Dictionary, Value};

/// One row of `launchctl list`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub pid: Option<u32>,
    pub status: Option<i32>,
    pub label: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("Unexpected end of input")]
    UnexpectedEnd,

    #[error("Unexpected character {0:?}")]
    Unexpected(char),

    #[error("Expected a dictionary")]
    NotDictionary,
}

/// Parse the `PID Status Label` table, skipping the header
pub fn parse_list(output: &str) -> Vec<ListEntry> {
    output
        .lines()
        .filter_map(|line| {
            let mut cols = line.split('\t');
            let pid = cols.next()?.trim();
            let status = cols.next()?.trim();
            let label = cols.next()?.trim();
            if label.is_empty() || label == "Label" {
                return None;
            }
            Some(ListEntry {
                pid: pid.parse().ok(),
                status: status.parse().ok(),
                label: label.to_string(),
            })
        })
        .collect()
}

/// Parse the dictionary printed by `launchctl list <label>`
pub fn parse_job(output: &str) -> Result<Dictionary, ParseError> {
    let mut parser = Parser {
        chars: output.chars().peekable(),
    };
    match parser.value()? {
        Value::Dictionary(dict) => Ok(dict),
        _ => Err(ParseError::NotDictionary),
    }
}

struct Parser<'a> {
    chars: Peekable<Chars<'a>>,
}

impl Parser<'_> {
    fn skip_whitespace(&mut self) {
        while self.chars.peek().is_some_and(|c| c.is_whitespace()) {
            self.chars.next();
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.skip_whitespace();
        self.chars.peek().copied()
    }

    fn expect(&mut self, want: char) -> Result<(), ParseError> {
        match self.peek() {
            Some(c) if c == want => {
                self.chars.next();
                Ok(())
            }
            Some(c) => Err(ParseError::Unexpected(c)),
            None => Err(ParseError::UnexpectedEnd),
        }
    }

    fn value(&mut self) -> Result<Value, ParseError> {
        match self.peek().ok_or(ParseError::UnexpectedEnd)? {
            '{' => self.dictionary(),
            '(' => self.array(),
            '"' => self.quoted().map(Value::String),
            _ => self.bare(),
        }
    }

    fn dictionary(&mut self) -> Result<Value, ParseError> {
        self.expect('{')?;
        let mut dict = Dictionary::new();
        loop {
            if self.peek() == Some('}') {
                self.chars.next();
                break;
            }
            let key = match self.value()? {
                Value::String(s) => s,
                Value::Integer(i) => i.to_string(),
                Value::Boolean(b) => b.to_string(),
                _ => return Err(ParseError::NotDictionary),
            };
            self.expect('=')?;
            let value = self.value()?;
            self.expect(';')?;
            dict.insert(key, value);
        }
        Ok(Value::Dictionary(dict))
    }

    fn array(&mut self) -> Result<Value, ParseError> {
        self.expect('(')?;
        let mut items = Vec::new();
        loop {
            if self.peek() == Some(')') {
                self.chars.next();
                break;
            }
            items.push(self.value()?);
            // Separator is ';' in launchctl output, ',' in classic plists
            if matches!(self.peek(), Some(';') | Some(',')) {
                self.chars.next();
            }
        }
        Ok(Value::Array(items))
    }

    fn quoted(&mut self) -> Result<String, ParseError> {
        self.expect('"')?;
        let mut s = String::new();
        loop {
            match self.chars.next().ok_or(ParseError::UnexpectedEnd)? {
                '"' => return Ok(s),
                '\\' => match self.chars.next().ok_or(ParseError::UnexpectedEnd)? {
                    'n' => s.push('\n'),
                    't' => s.push('\t'),
                    other => s.push(other),
                },
                c => s.push(c),
            }
        }
    }

    fn bare(&mut self) -> Result<Value, ParseError> {
        let mut word = String::new();
        while let Some(&c) = self.chars.peek() {
            if c.is_whitespace() || matches!(c, ';' | '=' | ',' | ')' | '}') {
                break;
            }
            word.push(c);
            self.chars.next();
        }
        if word.is_empty() {
            return match self.chars.peek() {
                Some(&c) => Err(ParseError::Unexpected(c)),
                None => Err(ParseError::UnexpectedEnd),
            };
        }
        Ok(match word.as_str() {
            "true" => Value::Boolean(true),
            "false" => Value::Boolean(false),
            _ => match word.parse::<i64>() {
                Ok(i) => Value::Integer(i.into()),
                Err(_) => Value::String(word),
            },
        })
    }
}
