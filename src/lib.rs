//! Follows the newest `.rpt` log in a directory, like `tail -f` that keeps
//! switching to whichever file was modified last.
//!
//! The pieces are usable on their own: [`locate()`] finds the newest matching
//! file, [`read_new()`] returns what was appended past an offset, and [`Watch`]
//! ties both into a [`Stream`](futures_util::stream::Stream) of
//! [`WatchEvent`]s. [`run`] drives a `Watch` onto a text sink until a
//! cancellation token fires.
//!
//! ## Example
//!
//! ```no_run
//! use futures_util::stream::StreamExt;
//! use rpttail::{Watch, WatchEvent, WatchTarget};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let watch = Watch::new(WatchTarget::new("/var/log/game", ".rpt"));
//!     futures_util::pin_mut!(watch);
//!
//!     while let Some(event) = watch.next().await {
//!         match event {
//!             WatchEvent::Switched { path, .. } => println!("now on {}", path.display()),
//!             WatchEvent::Data(chunk) => print!("{}", String::from_utf8_lossy(chunk.bytes())),
//!             _ => {}
//!         }
//!     }
//! }
//! ```
//!
//! ## Caveats
//!
//! Offsets are kept only in memory; a restart tails the newest file from its
//! first byte again. A hung filesystem call stalls the whole watch, as no
//! per-call timeouts are applied.

mod config;
mod error;
mod locate;
mod output;
mod reader;
mod watch;

pub use config::{WatchTarget, BASE_DIR_ENV, IDLE_INTERVAL, SUBDIRECTORY, SUFFIX, TAIL_INTERVAL};
pub use error::Error;
pub use locate::{locate, Fs, LatestFile, Locate};
pub use output::{InvalidUtf8, Printer, TextDecoder};
pub use reader::{read_new, Chunk, ReadNew};
pub use watch::{run, run_with, ActiveFile, Watch, WatchEvent, WatchState};

#[cfg(doctest)]
doc_comment::doctest!("../README.md");
