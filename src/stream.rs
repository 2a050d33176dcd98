// SPDX-License-Identifier: GPL-3.0-only

//! Streaming reader for the top-level conversation array.
//!
//! A `conversations.json` export can be far larger than available memory,
//! so the whole document is never materialized. [`RecordStream`] scans the
//! top-level array one element at a time: it buffers the raw bytes of a
//! single element (tracking bracket depth and string escapes), decodes
//! that element with `serde_json`, and discards the buffer before moving
//! on. Peak memory is bounded by the largest single conversation.
//!
//! The stream is forward-only and non-restartable. A document that does
//! not open with an array fails with [`StreamError::MalformedInput`]
//! before any record is yielded; a failure mid-stream ends iteration with
//! the same error.

use serde_json::Value;
use snafu::prelude::*;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

/// Error type for stream decoding failures.
#[derive(Debug, Snafu)]
pub enum StreamError {
    /// The input file could not be opened.
    #[snafu(display("failed to open {}: {source}", path.display()))]
    OpenFile {
        /// The file that could not be opened.
        path: PathBuf,
        /// The underlying I/O error.
        source: io::Error,
    },

    /// Reading from the input failed.
    #[snafu(display("failed to read input: {source}"))]
    ReadInput {
        /// The underlying I/O error.
        source: io::Error,
    },

    /// The top-level document is not a decodable JSON array.
    #[snafu(display("malformed input: {detail}"))]
    MalformedInput {
        /// What was wrong with the document.
        detail: String,
    },
}

/// A lazy, forward-only iterator over top-level array elements.
///
/// Yields each element as a [`serde_json::Value`]; callers turn it into a
/// [`crate::parser::ConversationRecord`] with
/// [`crate::parser::ConversationRecord::from_value`], which treats a
/// non-object element as an empty conversation.
#[derive(Debug)]
pub struct RecordStream<R> {
    reader: R,
    done: bool,
}

impl RecordStream<BufReader<File>> {
    /// Opens a file and positions the stream inside its top-level array.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or does not begin
    /// with a JSON array.
    pub fn open(path: &Path) -> Result<Self, StreamError> {
        let file = File::open(path).context(OpenFileSnafu { path })?;
        Self::new(BufReader::new(file))
    }
}

impl<R: BufRead> RecordStream<R> {
    /// Wraps a reader and consumes the opening `[` of the array.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::MalformedInput`] if the first non-whitespace
    /// byte is not `[`, or the reader is empty.
    pub fn new(reader: R) -> Result<Self, StreamError> {
        let mut stream = Self {
            reader,
            done: false,
        };
        match stream.next_significant()? {
            Some(b'[') => Ok(stream),
            Some(other) => MalformedInputSnafu {
                detail: format!("expected a top-level array, found `{}`", other as char),
            }
            .fail(),
            None => MalformedInputSnafu {
                detail: "empty document".to_owned(),
            }
            .fail(),
        }
    }

    fn read_byte(&mut self) -> Result<Option<u8>, StreamError> {
        let mut byte = [0_u8; 1];
        loop {
            match self.reader.read(&mut byte) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(byte[0])),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(StreamError::ReadInput { source: e }),
            }
        }
    }

    /// Returns the next non-whitespace byte, or `None` at end of input.
    fn next_significant(&mut self) -> Result<Option<u8>, StreamError> {
        loop {
            match self.read_byte()? {
                Some(b) if b.is_ascii_whitespace() => {}
                other => return Ok(other),
            }
        }
    }

    /// Buffers the raw bytes of one array element, given its first byte.
    ///
    /// Returns the bytes and whether the element's trailing separator
    /// (`,` or `]`) was already consumed. Bare scalars have no closing
    /// delimiter of their own, so their separator is consumed here.
    fn read_element(&mut self, first: u8) -> Result<(Vec<u8>, bool), StreamError> {
        let mut buf = vec![first];

        if first == b'{' || first == b'[' {
            let mut depth = 1_usize;
            let mut in_string = false;
            let mut escaped = false;
            while depth > 0 {
                let Some(b) = self.read_byte()? else {
                    return MalformedInputSnafu {
                        detail: "unexpected end of input inside a record".to_owned(),
                    }
                    .fail();
                };
                buf.push(b);
                if in_string {
                    if escaped {
                        escaped = false;
                    } else if b == b'\\' {
                        escaped = true;
                    } else if b == b'"' {
                        in_string = false;
                    }
                } else {
                    match b {
                        b'"' => in_string = true,
                        b'{' | b'[' => depth += 1,
                        b'}' | b']' => depth -= 1,
                        _ => {}
                    }
                }
            }
            return Ok((buf, false));
        }

        if first == b'"' {
            let mut escaped = false;
            loop {
                let Some(b) = self.read_byte()? else {
                    return MalformedInputSnafu {
                        detail: "unexpected end of input inside a string".to_owned(),
                    }
                    .fail();
                };
                buf.push(b);
                if escaped {
                    escaped = false;
                } else if b == b'\\' {
                    escaped = true;
                } else if b == b'"' {
                    return Ok((buf, false));
                }
            }
        }

        // Bare scalar: runs until the element separator or the array end,
        // either of which is consumed here.
        loop {
            match self.read_byte()? {
                Some(b',') => return Ok((buf, true)),
                Some(b']') => {
                    self.done = true;
                    return Ok((buf, true));
                }
                Some(b) if b.is_ascii_whitespace() => {
                    // Whitespace ends the scalar; still need its separator.
                    return match self.next_significant()? {
                        Some(b',') => Ok((buf, true)),
                        Some(b']') => {
                            self.done = true;
                            Ok((buf, true))
                        }
                        _ => MalformedInputSnafu {
                            detail: "expected `,` or `]` after array element".to_owned(),
                        }
                        .fail(),
                    };
                }
                Some(b) => buf.push(b),
                None => {
                    return MalformedInputSnafu {
                        detail: "unexpected end of input inside the array".to_owned(),
                    }
                    .fail();
                }
            }
        }
    }

    /// Consumes the `,` or `]` that follows a buffered element.
    fn read_separator(&mut self) -> Result<(), StreamError> {
        match self.next_significant()? {
            Some(b',') => Ok(()),
            Some(b']') => {
                self.done = true;
                Ok(())
            }
            Some(other) => MalformedInputSnafu {
                detail: format!("expected `,` or `]` after record, found `{}`", other as char),
            }
            .fail(),
            None => MalformedInputSnafu {
                detail: "unexpected end of input after record".to_owned(),
            }
            .fail(),
        }
    }

    fn next_record(&mut self) -> Result<Option<Value>, StreamError> {
        let first = match self.next_significant()? {
            None => {
                return MalformedInputSnafu {
                    detail: "unexpected end of input before `]`".to_owned(),
                }
                .fail();
            }
            Some(b']') => {
                self.done = true;
                return Ok(None);
            }
            Some(b) => b,
        };

        let (raw, separator_consumed) = self.read_element(first)?;
        if !separator_consumed {
            self.read_separator()?;
        }

        let value = serde_json::from_slice(&raw).map_err(|e| StreamError::MalformedInput {
            detail: format!("undecodable record: {e}"),
        })?;
        Ok(Some(value))
    }
}

impl<R: BufRead> Iterator for RecordStream<R> {
    type Item = Result<Value, StreamError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_record() {
            Ok(Some(value)) => Some(Ok(value)),
            Ok(None) => None,
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
