//! Test suite fixture.  Should only be used by this library.
//!
//! A [`Fake`] stands in for both the control host (and the device under
//! test) and the local lab hardware. Every command is recorded as
//! `"<destination>: <command>"`, and replies are scripted by substring.

#![allow(missing_docs)]

use std::collections::VecDeque;
use std::io::Read;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use labflash_utils::CommandError;
use tokio::io::AsyncReadExt;

use crate::remote::{RemoteError, RemoteShell};
use crate::task::{Task, TaskRunner};

/// Destination string recorded for local tasks.
pub(crate) const LOCAL: &str = "local";

/// A scripted outcome for one command.
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Ok(String),
    /// Succeeds after the given delay
    Slow(Duration, String),
    Fail,
    Timeout,
}

impl Reply {
    pub(crate) fn ok(s: &str) -> Self {
        Self::Ok(s.to_owned())
    }
}

#[derive(Debug)]
struct Rule {
    pattern: String,
    replies: VecDeque<Reply>,
}

#[derive(Debug, Default)]
struct FakeState {
    calls: Vec<String>,
    inputs: Vec<(String, Vec<u8>)>,
    rules: Vec<Rule>,
    transfer: bool,
    written: Vec<u8>,
}

impl FakeState {
    fn reply(&mut self, call: &str) -> Reply {
        let Some(rule) = self.rules.iter_mut().find(|r| call.contains(&r.pattern)) else {
            return Reply::Ok(String::new());
        };
        // The last scripted reply sticks
        if rule.replies.len() > 1 {
            rule.replies.pop_front().unwrap()
        } else {
            rule.replies.front().cloned().unwrap()
        }
    }
}

#[derive(Debug, Default, Clone)]
pub(crate) struct Fake(Arc<Mutex<FakeState>>);

impl Fake {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Script replies for calls containing `pattern`. Earlier rules win.
    pub(crate) fn on(&self, pattern: &str, replies: impl IntoIterator<Item = Reply>) -> &Self {
        let replies: VecDeque<_> = replies.into_iter().collect();
        assert!(!replies.is_empty());
        self.0.lock().unwrap().rules.push(Rule {
            pattern: pattern.to_owned(),
            replies,
        });
        self
    }

    /// Make the `nc.traditional` pipeline actually pull from the image
    /// server and keep the decompressed bytes.
    pub(crate) fn with_transfer(self) -> Self {
        self.0.lock().unwrap().transfer = true;
        self
    }

    pub(crate) fn shell(&self, destination: &str) -> FakeShell {
        FakeShell {
            destination: destination.to_owned(),
            fake: self.clone(),
        }
    }

    pub(crate) fn runner(&self) -> FakeRunner {
        FakeRunner { fake: self.clone() }
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.0.lock().unwrap().calls.clone()
    }

    pub(crate) fn count(&self, pattern: &str) -> usize {
        self.calls().iter().filter(|c| c.contains(pattern)).count()
    }

    /// Index of the first call containing `pattern`.
    pub(crate) fn position(&self, pattern: &str) -> Option<usize> {
        self.calls().iter().position(|c| c.contains(pattern))
    }

    pub(crate) fn inputs(&self) -> Vec<(String, Vec<u8>)> {
        self.0.lock().unwrap().inputs.clone()
    }

    pub(crate) fn written(&self) -> Vec<u8> {
        self.0.lock().unwrap().written.clone()
    }

    fn record(&self, call: String, input: Option<&[u8]>) -> (Reply, bool) {
        let mut state = self.0.lock().unwrap();
        if let Some(input) = input {
            state.inputs.push((call.clone(), input.to_vec()));
        }
        let reply = state.reply(&call);
        state.calls.push(call);
        (reply, state.transfer)
    }

    async fn pull_image(&self, command: &str) -> String {
        let argv = labflash_utils::shell_split(command).unwrap();
        let pipeline = argv.last().unwrap();
        let mut words = pipeline.split_whitespace().skip_while(|w| *w != "nc.traditional");
        words.next();
        let host = words.next().unwrap().to_owned();
        let port: u16 = words.next().unwrap().parse().unwrap();
        let mut stream = tokio::net::TcpStream::connect((host.as_str(), port))
            .await
            .unwrap();
        let mut compressed = Vec::new();
        stream.read_to_end(&mut compressed).await.unwrap();
        let mut plain = Vec::new();
        flate2::read::GzDecoder::new(compressed.as_slice())
            .read_to_end(&mut plain)
            .unwrap();
        self.0.lock().unwrap().written = plain;
        String::new()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct FakeShell {
    destination: String,
    fake: Fake,
}

impl RemoteShell for FakeShell {
    fn destination(&self) -> String {
        self.destination.clone()
    }

    async fn run_with_input(
        &self,
        command: &str,
        input: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<String, RemoteError> {
        let call = format!("{}: {command}", self.destination);
        let (reply, transfer) = self.fake.record(call, input);
        match reply {
            Reply::Ok(_) if transfer && command.contains("nc.traditional") => {
                Ok(self.fake.pull_image(command).await)
            }
            Reply::Ok(s) => Ok(s),
            Reply::Slow(delay, s) => {
                tokio::time::sleep(delay).await;
                Ok(s)
            }
            Reply::Fail => Err(RemoteError::Command {
                destination: self.destination.clone(),
                command: command.to_owned(),
                code: Some(1),
                output: "scripted failure".into(),
            }),
            Reply::Timeout => Err(RemoteError::Timeout {
                destination: self.destination.clone(),
                command: command.to_owned(),
                timeout,
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct FakeRunner {
    fake: Fake,
}

impl TaskRunner for FakeRunner {
    async fn run(&self, task: &Task) -> Result<String, CommandError> {
        let mut call = format!("{LOCAL}: {}", task.argv.join(" "));
        for (k, v) in &task.env {
            call.push_str(&format!(" [{k}={v}]"));
        }
        let (reply, _) = self.fake.record(call, None);
        let program = task.program().to_owned();
        match reply {
            Reply::Ok(s) => Ok(s),
            Reply::Slow(delay, s) => {
                tokio::time::sleep(delay).await;
                Ok(s)
            }
            Reply::Fail => Err(CommandError::Failed {
                program,
                code: Some(1),
                output: "scripted failure".into(),
            }),
            Reply::Timeout => Err(CommandError::Timeout {
                program,
                timeout: task.timeout,
            }),
        }
    }
}
