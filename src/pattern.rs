//! # Pattern
//!
//! Byte patterns and the matcher that locates them inside a [`Window`].
//!
//! Compilers are free to emit the same logical instruction sequence with different encodings
//! (for example a different register allocation for the same store). A rewrite therefore lists
//! every encoding it knows about as an ordered set of candidates and the matcher reports which
//! one was found.

use std::fmt::{self, Display};

use thiserror::Error;

use crate::window::Window;

/// Errors while building a pattern
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatternError {
    /// A word in the textual pattern was neither a hex byte nor a wildcard
    #[error("bad pattern word \"{0}\"")]
    BadWord(String),
    /// Patterns must match at least one byte
    #[error("pattern must match at least one byte")]
    Empty,
}

/// A byte sequence where every position is either a fixed byte or a wildcard
#[derive(Clone, PartialEq, Eq)]
pub struct Pattern {
    /// Expected bytes, `0` at wildcard positions
    sig: Vec<u8>,
    /// `0xff` for fixed bytes, `0x00` for wildcards
    mask: Vec<u8>,
}

impl Pattern {
    /// Creates a pattern matching `bytes` exactly
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PatternError> {
        if bytes.is_empty() {
            return Err(PatternError::Empty);
        }
        Ok(Self {
            sig: bytes.to_vec(),
            mask: vec![0xff; bytes.len()],
        })
    }

    /// Parses a pattern written as whitespace separated hex bytes, with `??` (or `?`) as a
    /// wildcard, e.g. `"48 89 DF E8 ?? ?? ?? ??"`
    pub fn parse(s: &str) -> Result<Self, PatternError> {
        let mut sig = vec![];
        let mut mask = vec![];
        for word in s.split_whitespace() {
            match word {
                "??" | "?" => {
                    sig.push(0);
                    mask.push(0);
                }
                _ if word.len() == 2 && word.bytes().all(|b| b.is_ascii_hexdigit()) => {
                    let byte = u8::from_str_radix(word, 16)
                        .map_err(|_| PatternError::BadWord(word.to_string()))?;
                    sig.push(byte);
                    mask.push(0xff);
                }
                _ => return Err(PatternError::BadWord(word.to_string())),
            }
        }
        if sig.is_empty() {
            return Err(PatternError::Empty);
        }
        Ok(Self { sig, mask })
    }

    /// Number of bytes the pattern covers
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.sig.len()
    }

    /// Checks whether the pattern matches `data` at `index`. Out of range positions never match.
    #[inline(always)]
    pub fn is_match(&self, data: &[u8], index: usize) -> bool {
        let Some(candidate) = index
            .checked_add(self.len())
            .and_then(|end| data.get(index..end))
        else {
            return false;
        };
        candidate
            .iter()
            .zip(self.sig.iter().zip(&self.mask))
            .all(|(byte, (sig, mask))| byte & mask == *sig)
    }
}

impl Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (sig, mask)) in self.sig.iter().zip(&self.mask).enumerate() {
            if i != 0 {
                write!(f, " ")?;
            }
            if *mask == 0 {
                write!(f, "??")?;
            } else {
                write!(f, "{sig:02X}")?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pattern(\"{self}\")")
    }
}

/// Location of a matched candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Match {
    /// Offset into the searched window
    pub offset: usize,
    /// Index of the candidate that matched
    pub candidate: usize,
}

impl Match {
    /// Absolute address of the match inside `window`
    pub fn address(&self, window: &Window<'_>) -> usize {
        window.base() + self.offset
    }
}

/// Finds the lowest offset in `window` where any of `candidates` matches.
///
/// When several candidates match at the same offset the one declared first wins.
pub fn find(window: &Window<'_>, candidates: &[Pattern]) -> Option<Match> {
    let data = window.bytes();
    (0..data.len()).find_map(|offset| {
        candidates
            .iter()
            .position(|pattern| pattern.is_match(data, offset))
            .map(|candidate| Match { offset, candidate })
    })
}
