//! One-shot stdin prompts for the interactive selection commands.
//!
//! Unlike a setup wizard there is no retry loop: an answer that does not
//! parse is a validation failure and aborts the command, leaving the
//! machine configuration untouched.

use std::io::{self, BufRead, Write};

use crate::error::{Error, Result};

pub fn line(question: &str) -> Result<String> {
    print!("{} ", question);
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(answer.trim().to_string())
}

/// Ask for a single index into a list of `len` displayed options.
pub fn index(question: &str, len: usize) -> Result<usize> {
    let answer = line(question)?;
    parse_index(&answer, len)
}

pub fn parse_index(answer: &str, len: usize) -> Result<usize> {
    let index: usize = answer
        .trim()
        .parse()
        .map_err(|_| Error::validation(format!("The option {} is not a valid one", answer.trim())))?;
    if index >= len {
        return Err(Error::validation(format!("The option {} is not a valid one", index)));
    }
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_index_accepts_in_range() {
        assert_eq!(parse_index("1", 3).unwrap(), 1);
        assert_eq!(parse_index(" 0 ", 1).unwrap(), 0);
    }

    #[test]
    fn parse_index_rejects_out_of_range_and_garbage() {
        assert!(parse_index("3", 3).is_err());
        assert!(parse_index("-1", 3).is_err());
        assert!(parse_index("abc", 3).is_err());
        assert!(parse_index("", 3).is_err());
    }
}
