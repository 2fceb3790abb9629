//! Rendering watch events onto a text sink.

use std::io;
use std::path::Path;
use std::time::SystemTime;

use chrono::{DateTime, Local};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::watch::WatchEvent;
use crate::{Error, WatchTarget};

const RULE_WIDTH: usize = 60;

/// What to do with byte sequences in a followed file that are not valid
/// UTF-8.
///
/// Streaming is never interrupted by bad bytes; the policy only decides
/// whether they leave a visible trace.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum InvalidUtf8 {
    /// Silently remove invalid sequences.
    #[default]
    Drop,
    /// Substitute each invalid sequence with U+FFFD.
    Replace,
}

/// Incremental UTF-8 decoder applying an [`InvalidUtf8`] policy.
///
/// A multi-byte character split across two chunks is held back until the
/// rest arrives, so chunk boundaries never count as invalid input.
#[derive(Debug, Default)]
pub struct TextDecoder {
    policy: InvalidUtf8,
    carry: Vec<u8>,
}

impl TextDecoder {
    pub fn new(policy: InvalidUtf8) -> Self {
        TextDecoder {
            policy,
            carry: Vec::new(),
        }
    }

    pub fn policy(&self) -> InvalidUtf8 {
        self.policy
    }

    pub fn decode(&mut self, bytes: &[u8]) -> String {
        let mut buf = std::mem::take(&mut self.carry);
        buf.extend_from_slice(bytes);

        let mut text = String::with_capacity(buf.len());
        let mut rest = buf.as_slice();

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    text.push_str(&String::from_utf8_lossy(valid));

                    match e.error_len() {
                        Some(bad) => {
                            if self.policy == InvalidUtf8::Replace {
                                text.push(char::REPLACEMENT_CHARACTER);
                            }
                            rest = &after[bad..];
                        }
                        None => {
                            // Incomplete sequence at the end; wait for more.
                            self.carry = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }

        text
    }

    /// Forgets any held-back partial character.
    pub fn reset(&mut self) {
        self.carry.clear();
    }
}

/// Writes banners, status lines and followed content to `W`.
///
/// Every call writes its whole output and flushes before returning.
#[derive(Debug)]
pub struct Printer<W> {
    out: W,
    decoder: TextDecoder,
}

impl<W: AsyncWrite + Unpin> Printer<W> {
    pub fn new(out: W, policy: InvalidUtf8) -> Self {
        Printer {
            out,
            decoder: TextDecoder::new(policy),
        }
    }

    pub fn get_ref(&self) -> &W {
        &self.out
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    /// Startup banner.
    pub async fn title(&mut self) -> io::Result<()> {
        let rule = rule();
        let text = format!(
            "{rule}\nRPT log monitor\nPress Ctrl+C to stop\n{rule}\n",
            rule = rule
        );
        self.write(&text).await
    }

    pub async fn watching(&mut self, target: &WatchTarget) -> io::Result<()> {
        let text = format!(
            "Watching directory: {}\nLooking for the newest *{} file...\n",
            target.directory().display(),
            target.suffix()
        );
        self.write(&text).await
    }

    pub async fn fatal(&mut self, error: &Error) -> io::Result<()> {
        self.write(&format!("Error: {}\n", error)).await
    }

    pub async fn event(&mut self, event: &WatchEvent) -> io::Result<()> {
        match event {
            WatchEvent::Waiting { .. } => {
                self.write("No matching file found, waiting...\n").await
            }
            WatchEvent::Switched { path, modified } => {
                self.decoder.reset();
                let text = switch_banner(path, *modified);
                self.write(&text).await
            }
            WatchEvent::Data(chunk) => {
                let text = self.decoder.decode(chunk.bytes());
                if text.is_empty() {
                    return Ok(());
                }
                self.write(&text).await
            }
            WatchEvent::Lost { .. } | WatchEvent::Truncated { .. } => {
                self.decoder.reset();
                Ok(())
            }
        }
    }

    /// Closing banner.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        let rule = rule();
        let text = format!("\n\n{rule}\nMonitoring stopped\n{rule}\n", rule = rule);
        self.write(&text).await
    }

    async fn write(&mut self, text: &str) -> io::Result<()> {
        self.out.write_all(text.as_bytes()).await?;
        self.out.flush().await
    }
}

fn rule() -> String {
    "=".repeat(RULE_WIDTH)
}

fn switch_banner(path: &Path, modified: SystemTime) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy())
        .unwrap_or_else(|| path.to_string_lossy());
    let modified: DateTime<Local> = modified.into();
    let rule = rule();

    format!(
        "\n{rule}\nNow following: {name}\nLast modified: {modified}\n{rule}\n\n",
        rule = rule,
        name = name,
        modified = modified.format("%Y-%m-%d %H:%M:%S%.6f"),
    )
}
