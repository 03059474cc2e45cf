//! Building shell command lines that are run on a remote host.
//!
//! Anything handed to `ssh` as a command is re-parsed by the remote login
//! shell, so every value interpolated into it must go through here.

use anyhow::{Context, Result};

/// Quote a single word so that it is parsed as exactly one argument by a
/// POSIX shell. Strings with no shell meta-characters are returned as-is.
pub fn shell_quote(s: &str) -> Result<String> {
    shlex::try_quote(s)
        .map(|v| v.into_owned())
        .with_context(|| format!("Quoting {s:?}"))
}

/// Join words into a single command line, quoting each as needed.
pub fn shell_join<'a>(words: impl IntoIterator<Item = &'a str>) -> Result<String> {
    let words = words.into_iter().collect::<Vec<_>>();
    shlex::try_join(words.iter().copied()).with_context(|| format!("Quoting {words:?}"))
}

/// Split a configured command string into argv using shell word rules.
pub fn shell_split(s: &str) -> Result<Vec<String>> {
    let r = shlex::split(s).ok_or_else(|| anyhow::anyhow!("Invalid command line: {s:?}"))?;
    anyhow::ensure!(!r.is_empty(), "Empty command line");
    Ok(r)
}
