//! Fragment scripts and their deterministic replay.
//!
//! A script lists fragment submissions one per line:
//!
//! ```text
//! # frame mode   src          dst          id  pos more payload
//! 1       offset 10.0.0.1     10.0.0.2     7   5   last text:WORLD
//! 2       offset 10.0.0.1     10.0.0.2     7   0   more text:HELLO
//! ```
//!
//! `mode` is one of `offset`, `seq`, `next`, `check` or `seq-check` and
//! selects the table operation. Addresses may carry a port
//! (`10.0.0.1:53`, `[2001:db8::1]:53`). Payloads are `hex:<digits>`,
//! `text:<utf-8>` or `empty`.
//!
//! [`replay`] feeds a script through one [`SessionContext`] several times
//! without resetting it, the way a second analysis pass revisits a capture,
//! and checks that every pass yields the same completed messages.

use std::{
    fmt,
    fs,
    net::{IpAddr, SocketAddr},
    path::Path,
    str::FromStr,
    sync::Arc,
};

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    config::ReassemblyConfig,
    fragment::{Anomalies, FragmentDescriptor, ReassemblyError, Reassembled},
    key::{FlowKey, FrameNumber, KeyInput, MessageId},
    session::SessionContext,
};

/// Table name used for replayed submissions.
pub const REPLAY_TABLE: &str = "replay";

/// Errors raised while loading or replaying a script.
#[derive(Debug, Error)]
pub enum ScriptError {
    /// The script file could not be read.
    #[error("failed to read script: {0}")]
    Io(#[from] std::io::Error),

    /// A line does not have the expected number of fields.
    #[error("line {line}: expected 8 fields, found {found}")]
    FieldCount {
        /// One-based line number.
        line: usize,
        /// Number of fields found.
        found: usize,
    },

    /// A field could not be parsed.
    #[error("line {line}: invalid {field} `{value}`")]
    InvalidField {
        /// One-based line number.
        line: usize,
        /// Name of the offending field.
        field: &'static str,
        /// Raw field text.
        value: String,
    },

    /// A fatal reassembly error stopped the replay.
    #[error("line {line}: replay aborted: {source}")]
    Aborted {
        /// One-based line number.
        line: usize,
        /// Error reported by the table.
        source: ReassemblyError,
    },
}

/// Table operation a script line exercises.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// [`ReassemblyTable::add`](crate::ReassemblyTable::add).
    Offset,
    /// [`ReassemblyTable::add_seq`](crate::ReassemblyTable::add_seq).
    Seq,
    /// [`ReassemblyTable::add_seq_next`](crate::ReassemblyTable::add_seq_next).
    Next,
    /// [`ReassemblyTable::add_check`](crate::ReassemblyTable::add_check).
    Check,
    /// [`ReassemblyTable::add_seq_check`](crate::ReassemblyTable::add_seq_check).
    SeqCheck,
}

impl FromStr for Mode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "offset" => Ok(Self::Offset),
            "seq" => Ok(Self::Seq),
            "next" => Ok(Self::Next),
            "check" => Ok(Self::Check),
            "seq-check" => Ok(Self::SeqCheck),
            _ => Err(()),
        }
    }
}

/// One parsed script line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Submission {
    /// One-based line number.
    pub line: usize,
    /// Packet carrying the fragment.
    pub frame: FrameNumber,
    /// Table operation to call.
    pub mode: Mode,
    /// Flow the fragment travels on.
    pub flow: FlowKey,
    /// Message identifier.
    pub id: MessageId,
    /// Byte offset or block number.
    pub position: u32,
    /// Whether more fragments follow.
    pub more_fragments: bool,
    /// Fragment payload.
    pub payload: Bytes,
}

impl Submission {
    /// Identity the submission targets.
    #[must_use]
    pub fn key(&self) -> KeyInput<'_> { KeyInput::new(&self.flow, self.id) }

    /// Fragment the submission hands over.
    #[must_use]
    pub fn descriptor(&self) -> FragmentDescriptor<'_> {
        FragmentDescriptor::new(self.frame, self.position, &self.payload)
            .with_more_fragments(self.more_fragments)
    }

    fn parse(line: usize, text: &str) -> Result<Self, ScriptError> {
        let fields: Vec<&str> = text.split_whitespace().collect();
        let [frame, mode, src, dst, id, position, more, payload] = fields[..] else {
            return Err(ScriptError::FieldCount {
                line,
                found: fields.len(),
            });
        };
        let invalid = |field: &'static str, value: &str| ScriptError::InvalidField {
            line,
            field,
            value: value.to_owned(),
        };

        let (src_addr, src_port) = parse_endpoint(src).ok_or_else(|| invalid("source", src))?;
        let (dst_addr, dst_port) = parse_endpoint(dst).ok_or_else(|| invalid("destination", dst))?;
        Ok(Self {
            line,
            frame: frame
                .parse::<u32>()
                .map(FrameNumber::new)
                .map_err(|_| invalid("frame", frame))?,
            mode: mode.parse().map_err(|()| invalid("mode", mode))?,
            flow: FlowKey::new(src_addr, dst_addr).with_ports(src_port.into(), dst_port.into()),
            id: id
                .parse::<u32>()
                .map(MessageId::new)
                .map_err(|_| invalid("id", id))?,
            position: position.parse().map_err(|_| invalid("position", position))?,
            more_fragments: match more {
                "more" => true,
                "last" => false,
                _ => return Err(invalid("more flag", more)),
            },
            payload: parse_payload(payload).ok_or_else(|| invalid("payload", payload))?,
        })
    }
}

fn parse_endpoint(text: &str) -> Option<(IpAddr, u16)> {
    if let Ok(socket) = text.parse::<SocketAddr>() {
        return Some((socket.ip(), socket.port()));
    }
    text.parse::<IpAddr>().ok().map(|ip| (ip, 0))
}

fn parse_payload(text: &str) -> Option<Bytes> {
    if text == "empty" {
        return Some(Bytes::new());
    }
    if let Some(digits) = text.strip_prefix("hex:") {
        return hex::decode(digits).ok().map(Bytes::from);
    }
    text.strip_prefix("text:")
        .map(|body| Bytes::copy_from_slice(body.as_bytes()))
}

/// Parsed fragment script.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Script {
    submissions: Vec<Submission>,
}

impl Script {
    /// Parse script text.
    ///
    /// # Errors
    ///
    /// Returns [`ScriptError::FieldCount`] or [`ScriptError::InvalidField`]
    /// for the first malformed line.
    pub fn parse(text: &str) -> Result<Self, ScriptError> {
        let submissions = text
            .lines()
            .enumerate()
            .filter_map(|(index, raw)| {
                let content = raw.split('#').next().unwrap_or_default().trim();
                (!content.is_empty()).then_some((index + 1, content))
            })
            .map(|(line, content)| Submission::parse(line, content))
            .collect::<Result<_, _>>()?;
        Ok(Self { submissions })
    }

    /// Read and parse the script at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ScriptError::Io`] when the file cannot be read, otherwise as
    /// for [`Script::parse`].
    pub fn load(path: &Path) -> Result<Self, ScriptError> { Self::parse(&fs::read_to_string(path)?) }

    /// Submissions in script order.
    #[must_use]
    pub fn submissions(&self) -> &[Submission] { &self.submissions }
}

impl FromStr for Script {
    type Err = ScriptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> { Self::parse(s) }
}

/// A message completed while replaying.
#[derive(Clone, Debug)]
pub struct Completion {
    /// Line of the submission that returned the message.
    pub line: usize,
    /// Packet of that submission.
    pub frame: FrameNumber,
    /// Flow of the message.
    pub flow: FlowKey,
    /// Identifier of the message.
    pub id: MessageId,
    /// Shared result returned by the table.
    pub message: Arc<Reassembled>,
}

/// A submission the table rejected.
#[derive(Clone, Debug)]
pub struct Rejection {
    /// Line of the rejected submission.
    pub line: usize,
    /// Error returned by the table.
    pub error: ReassemblyError,
}

/// Everything one pass over a script produced.
#[derive(Clone, Debug, Default)]
pub struct PassReport {
    /// Completed messages in submission order.
    pub completions: Vec<Completion>,
    /// Rejected submissions in submission order.
    pub rejections: Vec<Rejection>,
}

impl PassReport {
    /// Distinct completed messages, ordered by completion frame and identity.
    ///
    /// Result-table operations return a cached message for every later
    /// fragment of the same identity; those repeats collapse into one entry.
    #[must_use]
    pub fn digest(&self) -> Vec<MessageDigest> {
        let mut digest: Vec<MessageDigest> = self
            .completions
            .iter()
            .map(|completion| MessageDigest {
                reassembled_in: completion.message.reassembled_in(),
                identity: format!("{} id {}", completion.flow, completion.id),
                payload: completion.message.bytes(),
                anomalies: completion.message.anomalies(),
            })
            .collect();
        digest.sort_by(|a, b| {
            (a.reassembled_in, &a.identity).cmp(&(b.reassembled_in, &b.identity))
        });
        digest.dedup();
        digest
    }
}

/// Comparable summary of one completed message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageDigest {
    /// Packet the message completed in.
    pub reassembled_in: FrameNumber,
    /// Flow and identifier.
    pub identity: String,
    /// Reassembled payload.
    pub payload: Bytes,
    /// Anomalies recorded at completion.
    pub anomalies: Anomalies,
}

impl fmt::Display for MessageDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "frame {}: {} ({} bytes, anomalies: {})",
            self.reassembled_in,
            self.identity,
            self.payload.len(),
            self.anomalies
        )
    }
}

/// Outcome of replaying a script over several passes.
#[derive(Clone, Debug, Default)]
pub struct ReplayReport {
    /// One report per pass.
    pub passes: Vec<PassReport>,
}

impl ReplayReport {
    /// One-based numbers of passes whose digest differs from the first pass.
    #[must_use]
    pub fn divergent_passes(&self) -> Vec<usize> {
        let Some(first) = self.passes.first().map(PassReport::digest) else {
            return Vec::new();
        };
        self.passes
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(_, pass)| pass.digest() != first)
            .map(|(index, _)| index + 1)
            .collect()
    }

    /// Whether every pass produced the same completed messages.
    #[must_use]
    pub fn is_consistent(&self) -> bool { self.divergent_passes().is_empty() }
}

/// Replay `script` `passes` times through a fresh session.
///
/// # Errors
///
/// Returns [`ScriptError::Aborted`] when the table reports a fatal error.
pub fn replay(script: &Script, config: ReassemblyConfig, passes: usize) -> Result<ReplayReport, ScriptError> {
    let session = SessionContext::new();
    session.register(REPLAY_TABLE, config);

    let mut report = ReplayReport::default();
    for pass in 1..=passes {
        let outcome = run_pass(&session, script)?;
        info!(
            pass,
            completions = outcome.completions.len(),
            rejections = outcome.rejections.len(),
            "replay pass finished"
        );
        report.passes.push(outcome);
    }
    for pass in report.divergent_passes() {
        warn!(pass, "replay pass diverged from the first pass");
    }
    Ok(report)
}

fn run_pass(session: &SessionContext, script: &Script) -> Result<PassReport, ScriptError> {
    let mut report = PassReport::default();
    let mut current_frame = None;

    for submission in script.submissions() {
        if current_frame.is_some_and(|frame| frame != submission.frame) {
            session.end_packet();
        }
        current_frame = Some(submission.frame);

        let Some(outcome) = session.with_table(REPLAY_TABLE, |table| {
            let key = submission.key();
            let fragment = submission.descriptor();
            match submission.mode {
                Mode::Offset => table.add(&key, fragment),
                Mode::Seq => table.add_seq(&key, fragment),
                Mode::Next => table.add_seq_next(&key, fragment),
                Mode::Check => table.add_check(&key, fragment),
                Mode::SeqCheck => table.add_seq_check(&key, fragment),
            }
        }) else {
            break;
        };

        match outcome {
            Ok(Some(message)) => {
                debug!(
                    line = submission.line,
                    frame = %submission.frame,
                    len = message.payload().len(),
                    "message reassembled"
                );
                report.completions.push(Completion {
                    line: submission.line,
                    frame: submission.frame,
                    flow: submission.flow.clone(),
                    id: submission.id,
                    message,
                });
            }
            Ok(None) => {}
            Err(error) if error.is_fatal() => {
                return Err(ScriptError::Aborted {
                    line: submission.line,
                    source: error,
                });
            }
            Err(error) => {
                warn!(line = submission.line, error = %error, "submission rejected");
                report.rejections.push(Rejection {
                    line: submission.line,
                    error,
                });
            }
        }
    }
    session.end_packet();
    Ok(report)
}

/// Short printable form of a payload: text when it is printable ASCII,
/// otherwise hex, cut at `limit` bytes.
#[must_use]
pub fn preview(payload: &[u8], limit: usize) -> String {
    let shown = &payload[..payload.len().min(limit)];
    let ellipsis = if payload.len() > limit { "..." } else { "" };
    if shown.iter().all(|byte| byte.is_ascii_graphic() || *byte == b' ') {
        format!("\"{}\"{ellipsis}", String::from_utf8_lossy(shown))
    } else {
        format!("{}{ellipsis}", hex::encode(shown))
    }
}
