//! Tokenizer for the interactive `OPERATION KEY` command stream.
//!
//! Input is read word by word, ignoring line structure. The operation is the
//! first byte of a word; the key is the rest of that word or, when nothing
//! follows the operation, the next word. So `+ foo`, `+foo` and `+\nfoo` all
//! mean "insert foo". Words are raw bytes: keys need not be UTF-8.

use crate::client::validate_key;
use crate::error::RequestError;
use crate::layout::Operation;
use std::collections::VecDeque;
use std::io::{self, BufRead};

/// One command as typed, before validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub symbol: u8,
    pub key: Vec<u8>,
}

impl Command {
    /// Validates the key, then the operation symbol.
    pub fn parse(&self) -> Result<(Operation, &[u8]), RequestError> {
        validate_key(&self.key)?;
        let operation = Operation::from_symbol(self.symbol as char)?;
        Ok((operation, &self.key))
    }
}

/// Iterator over the commands of a reader. Stops at end of input, dropping a
/// trailing operation without a key.
pub struct Commands<R> {
    lines: io::Split<R>,
    words: VecDeque<Vec<u8>>,
}

impl<R: BufRead> Commands<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.split(b'\n'),
            words: VecDeque::new(),
        }
    }

    fn next_word(&mut self) -> Option<io::Result<Vec<u8>>> {
        loop {
            if let Some(word) = self.words.pop_front() {
                return Some(Ok(word));
            }
            match self.lines.next()? {
                Ok(line) => self.words.extend(
                    line.split(|b| b.is_ascii_whitespace())
                        .filter(|w| !w.is_empty())
                        .map(<[u8]>::to_vec),
                ),
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

impl<R: BufRead> Iterator for Commands<R> {
    type Item = io::Result<Command>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut word = match self.next_word()? {
            Ok(word) => word,
            Err(err) => return Some(Err(err)),
        };

        let symbol = word.remove(0);
        let key = if word.is_empty() {
            match self.next_word()? {
                Ok(word) => word,
                Err(err) => return Some(Err(err)),
            }
        } else {
            word
        };
        Some(Ok(Command { symbol, key }))
    }
}

/// Response line printed for a completed request.
pub fn format_response(key: &[u8], result: bool) -> String {
    format!(
        "[Response] contains({}) == {}",
        String::from_utf8_lossy(key),
        result as u8
    )
}

/// Message shown for a request rejected before submission.
pub fn format_rejection(err: &RequestError) -> String {
    match err {
        RequestError::KeyTooLong { .. } => format!("Sorry, this key is too long ({})", err),
        RequestError::UnknownOperation(_) => "Operation must be + or - or ?".to_owned(),
        other => format!("Sorry, {}", other),
    }
}

pub const USAGE: &str = "The server must be started before the first client\n\n\
Please type one query per line.\n\
A query has the form of 'OP KEY'\n\
There are three type of operations:\n\
* Adding a key: '+ key', e.g. '+ asdf'\n\
* Removing a key: '- key', e.g. '- asdf'\n\
* Check if key is contained: '? key', e.g. '? asdf'\n\
Press Ctrl+D to exit.\n";
