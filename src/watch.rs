//! The polling loop: locate the newest file, read what was appended, sleep,
//! repeat.

use std::fmt;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task;
use std::time::{Duration, SystemTime};

use futures_util::pin_mut;
use futures_util::ready;
use futures_util::stream::{Stream as FuturesStream, StreamExt};
use pin_project_lite::pin_project;
use tokio::io::AsyncWrite;
use tokio::time::{self, Instant, Sleep};
use tokio_util::sync::CancellationToken;

use crate::config::{IDLE_INTERVAL, TAIL_INTERVAL};
use crate::locate::{Fs, LatestFile, Locate};
use crate::output::Printer;
use crate::reader::{Chunk, ReadNew};
use crate::{Error, WatchTarget};

/// The file currently being followed and how far into it we have read.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ActiveFile {
    path: PathBuf,
    /// Captured when the file was selected; not refreshed while following.
    modified: SystemTime,
    offset: u64,
}

impl ActiveFile {
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    pub fn modified(&self) -> SystemTime {
        self.modified
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }
}

impl From<LatestFile> for ActiveFile {
    fn from(latest: LatestFile) -> Self {
        let (path, modified) = latest.into_inner();
        ActiveFile {
            path,
            modified,
            offset: 0,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum WatchState {
    /// No file located yet, or the last one went away.
    Idle,
    Tailing(ActiveFile),
    /// Terminal; the stream yields nothing further.
    Stopped,
}

impl WatchState {
    pub fn active(&self) -> Option<&ActiveFile> {
        match self {
            WatchState::Tailing(active) => Some(active),
            _ => None,
        }
    }
}

/// What happened during one step of the watch.
#[derive(Debug)]
pub enum WatchEvent {
    /// The directory holds no matching file (or could not be listed).
    Waiting { directory: PathBuf },
    /// A different file is now followed, starting from its first byte.
    Switched { path: PathBuf, modified: SystemTime },
    /// Bytes appended to the followed file.
    Data(Chunk),
    /// The followed file disappeared.
    Lost { path: PathBuf },
    /// The followed file shrank below the read offset.
    Truncated { path: PathBuf },
}

type LocateFuture = Pin<Box<dyn Future<Output = Result<Option<LatestFile>, Error>> + Send>>;
type ReadFuture = Pin<Box<dyn Future<Output = Result<Chunk, Error>> + Send>>;

enum Step {
    Begin,
    Locate(LocateFuture),
    Read(ReadFuture),
    Delay,
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        match self {
            Step::Begin => write!(f, "Begin"),
            Step::Locate(_) => write!(f, "Locate(<elided>)"),
            Step::Read(_) => write!(f, "Read(<elided>)"),
            Step::Delay => write!(f, "Delay"),
        }
    }
}

impl Default for Step {
    fn default() -> Self {
        Step::Begin
    }
}

pin_project! {
/// Follows the newest file in a directory, and can be polled to receive
/// [`WatchEvent`]s.
///
/// ## Streaming events
///
/// `Watch` implements [`futures::Stream`] which internally, per cycle:
///   1. Locates the newest matching file through its [`Locate`] collaborator.
///   2. Resets the cursor to 0 if that file differs from the followed one,
///      yielding `Switched`.
///   3. Reads what was appended through its [`ReadNew`] collaborator,
///      yielding `Data` and advancing the cursor.
///   4. Sleeps [`TAIL_INTERVAL`] while following, [`IDLE_INTERVAL`] while
///      nothing matches.
///
/// A lost or truncated file skips the sleep and relocates at once.
///
/// [`futures::Stream`]: https://docs.rs/futures/0.3/futures/stream/trait.Stream.html
pub struct Watch<L, R> {
    locator: Arc<L>,
    reader: Arc<R>,
    target: WatchTarget,
    state: WatchState,
    step: Step,
    #[pin]
    delay: Sleep,
}
}

impl Watch<Fs, Fs> {
    /// Watches the real filesystem.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn new(target: WatchTarget) -> Self {
        Watch::with_collaborators(target, Arc::new(Fs), Arc::new(Fs))
    }
}

impl<L, R> Watch<L, R>
where
    L: Locate + 'static,
    R: ReadNew + 'static,
{
    /// Watches through the given locator and reader.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn with_collaborators(target: WatchTarget, locator: Arc<L>, reader: Arc<R>) -> Self {
        Watch {
            locator,
            reader,
            target,
            state: WatchState::Idle,
            step: Step::default(),
            delay: time::sleep(Duration::ZERO),
        }
    }

    pub fn target(&self) -> &WatchTarget {
        &self.target
    }

    pub fn state(&self) -> &WatchState {
        &self.state
    }

    /// Moves to `Stopped`, abandoning any locate, read or sleep in flight.
    pub fn stop(self: Pin<&mut Self>) {
        let this = self.project();
        *this.state = WatchState::Stopped;
        *this.step = Step::Begin;
    }
}

impl<L, R> fmt::Debug for Watch<L, R> {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        f.debug_struct("Watch")
            .field("target", &self.target)
            .field("state", &self.state)
            .field("step", &self.step)
            .finish()
    }
}

fn start_locate<L: Locate + 'static>(locator: &Arc<L>, target: &WatchTarget) -> LocateFuture {
    let locator = Arc::clone(locator);
    let target = target.clone();
    Box::pin(async move { locator.locate(target.directory(), target.suffix()).await })
}

fn start_read<R: ReadNew + 'static>(reader: &Arc<R>, path: PathBuf, offset: u64) -> ReadFuture {
    let reader = Arc::clone(reader);
    Box::pin(async move { reader.read_new(&path, offset).await })
}

impl<L, R> FuturesStream for Watch<L, R>
where
    L: Locate + 'static,
    R: ReadNew + 'static,
{
    type Item = WatchEvent;

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Option<Self::Item>> {
        let this = self.project();

        let mut delay = this.delay;
        let state = this.state;
        let step = this.step;

        loop {
            if *state == WatchState::Stopped {
                return task::Poll::Ready(None);
            }

            let (next_step, maybe_event) = match step {
                Step::Begin => (
                    Step::Locate(start_locate(this.locator, this.target)),
                    None,
                ),
                Step::Locate(ref mut fut) => match ready!(fut.as_mut().poll(cx)) {
                    Ok(Some(latest)) => {
                        // Same file keeps its offset; anything else starts at 0.
                        let offset = match &*state {
                            WatchState::Tailing(active) if active.path() == latest.path() => {
                                Some(active.offset)
                            }
                            _ => None,
                        };

                        let read = start_read(
                            this.reader,
                            latest.path().to_path_buf(),
                            offset.unwrap_or(0),
                        );

                        let event = match offset {
                            Some(_) => None,
                            None => {
                                tracing::info!(path = %latest.path().display(), "following file");
                                let event = WatchEvent::Switched {
                                    path: latest.path().to_path_buf(),
                                    modified: latest.modified(),
                                };
                                *state = WatchState::Tailing(latest.into());
                                Some(event)
                            }
                        };

                        (Step::Read(read), event)
                    }
                    Ok(None) => {
                        if let WatchState::Tailing(active) = &*state {
                            tracing::info!(
                                path = %active.path().display(),
                                "no matching file left"
                            );
                        }
                        *state = WatchState::Idle;
                        delay.as_mut().reset(Instant::now() + IDLE_INTERVAL);

                        let event = WatchEvent::Waiting {
                            directory: this.target.directory().to_path_buf(),
                        };
                        (Step::Delay, Some(event))
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "directory scan failed");
                        delay.as_mut().reset(Instant::now() + IDLE_INTERVAL);

                        let event = WatchEvent::Waiting {
                            directory: this.target.directory().to_path_buf(),
                        };
                        (Step::Delay, Some(event))
                    }
                },
                Step::Read(ref mut fut) => match ready!(fut.as_mut().poll(cx)) {
                    Ok(chunk) => {
                        delay.as_mut().reset(Instant::now() + TAIL_INTERVAL);

                        if chunk.is_empty() {
                            (Step::Delay, None)
                        } else {
                            if let WatchState::Tailing(active) = &mut *state {
                                active.offset = chunk.end();
                            }
                            (Step::Delay, Some(WatchEvent::Data(chunk)))
                        }
                    }
                    Err(Error::FileNotFound(path)) => {
                        tracing::warn!(path = %path.display(), "followed file no longer exists");
                        *state = WatchState::Idle;
                        (Step::Begin, Some(WatchEvent::Lost { path }))
                    }
                    Err(Error::Truncated { path, offset, len }) => {
                        tracing::warn!(
                            path = %path.display(),
                            offset,
                            len,
                            "followed file was truncated, starting over"
                        );
                        *state = WatchState::Idle;
                        (Step::Begin, Some(WatchEvent::Truncated { path }))
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "read failed, retrying");
                        delay.as_mut().reset(Instant::now() + TAIL_INTERVAL);
                        (Step::Delay, None)
                    }
                },
                Step::Delay => {
                    ready!(delay.as_mut().poll(cx));
                    (Step::Begin, None)
                }
            };

            *step = next_step;

            if let Some(event) = maybe_event {
                return task::Poll::Ready(Some(event));
            }
        }
    }
}

/// Follows `target` on the real filesystem, writing to `printer` until
/// `shutdown` is cancelled.
pub async fn run<W>(
    target: &WatchTarget,
    printer: &mut Printer<W>,
    shutdown: &CancellationToken,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    printer.watching(target).await?;
    run_with(Watch::new(target.clone()), printer, shutdown).await
}

/// Drives `watch`, forwarding each event to `printer`, until `shutdown` is
/// cancelled; then writes the closing banner.
///
/// Cancellation is checked before every poll of the watch and interrupts a
/// pending locate, read or sleep. A write to the printer is never cut short.
pub async fn run_with<L, R, W>(
    watch: Watch<L, R>,
    printer: &mut Printer<W>,
    shutdown: &CancellationToken,
) -> io::Result<()>
where
    L: Locate + 'static,
    R: ReadNew + 'static,
    W: AsyncWrite + Unpin,
{
    pin_mut!(watch);

    loop {
        let event = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            event = watch.next() => event,
        };

        match event {
            Some(event) => printer.event(&event).await?,
            None => break,
        }
    }

    watch.as_mut().stop();
    tracing::debug!("watch stopped");

    printer.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::InvalidUtf8;
    use async_trait::async_trait;
    use std::collections::{BTreeMap, HashSet};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    const DIR: &str = "/logs";

    /// In-memory directory standing in for both collaborators.
    #[derive(Default)]
    struct FakeDir {
        files: Mutex<BTreeMap<PathBuf, (SystemTime, Vec<u8>)>>,
        /// Listed by the next locate, gone by the following read.
        doomed: Mutex<HashSet<PathBuf>>,
        unavailable: AtomicBool,
        failing_reads: AtomicUsize,
    }

    impl FakeDir {
        fn path(name: &str) -> PathBuf {
            Path::new(DIR).join(name)
        }

        fn put(&self, name: &str, secs: u64, bytes: &[u8]) -> PathBuf {
            let path = Self::path(name);
            let modified = SystemTime::UNIX_EPOCH + Duration::from_secs(secs);
            self.files
                .lock()
                .unwrap()
                .insert(path.clone(), (modified, bytes.to_vec()));
            path
        }

        fn append(&self, name: &str, bytes: &[u8]) {
            let mut files = self.files.lock().unwrap();
            let (_, content) = files.get_mut(&Self::path(name)).unwrap();
            content.extend_from_slice(bytes);
        }

        fn rewrite(&self, name: &str, bytes: &[u8]) {
            let mut files = self.files.lock().unwrap();
            let (_, content) = files.get_mut(&Self::path(name)).unwrap();
            *content = bytes.to_vec();
        }

        fn remove(&self, name: &str) {
            self.files.lock().unwrap().remove(&Self::path(name));
        }

        fn doom(&self, name: &str) {
            self.doomed.lock().unwrap().insert(Self::path(name));
        }
    }

    #[async_trait]
    impl Locate for FakeDir {
        async fn locate(
            &self,
            directory: &Path,
            suffix: &str,
        ) -> Result<Option<LatestFile>, Error> {
            if self.unavailable.load(Ordering::SeqCst) {
                return Err(Error::DirectoryUnavailable {
                    path: directory.to_path_buf(),
                    source: io::Error::new(io::ErrorKind::Other, "unplugged"),
                });
            }

            let files = self.files.lock().unwrap();
            let latest = files
                .iter()
                .filter(|(path, _)| path.to_string_lossy().ends_with(suffix))
                .map(|(path, (modified, _))| LatestFile::new(path.clone(), *modified))
                .fold(None, |best: Option<LatestFile>, candidate| match best {
                    Some(best) if !candidate.supersedes(&best) => Some(best),
                    _ => Some(candidate),
                });
            Ok(latest)
        }
    }

    #[async_trait]
    impl ReadNew for FakeDir {
        async fn read_new(&self, path: &Path, offset: u64) -> Result<Chunk, Error> {
            if self.doomed.lock().unwrap().remove(path) {
                self.files.lock().unwrap().remove(path);
            }

            let failing = self.failing_reads.load(Ordering::SeqCst);
            if failing > 0 {
                self.failing_reads.store(failing - 1, Ordering::SeqCst);
                return Err(Error::ReadFailure {
                    path: path.to_path_buf(),
                    source: io::Error::new(io::ErrorKind::PermissionDenied, "locked"),
                });
            }

            let files = self.files.lock().unwrap();
            let (_, content) = files
                .get(path)
                .ok_or_else(|| Error::FileNotFound(path.to_path_buf()))?;
            let len = content.len() as u64;
            if len < offset {
                return Err(Error::Truncated {
                    path: path.to_path_buf(),
                    offset,
                    len,
                });
            }
            Ok(Chunk::new(path, offset, content[offset as usize..].to_vec()))
        }
    }

    fn watch_fake(fake: &Arc<FakeDir>) -> Watch<FakeDir, FakeDir> {
        Watch::with_collaborators(
            WatchTarget::new(DIR, ".rpt"),
            Arc::clone(fake),
            Arc::clone(fake),
        )
    }

    async fn expect_switch<S>(watch: &mut Pin<&mut S>, expected: &Path)
    where
        S: FuturesStream<Item = WatchEvent>,
    {
        match watch.next().await {
            Some(WatchEvent::Switched { path, .. }) => assert_eq!(path, expected),
            other => panic!("expected switch to {:?}, got {:?}", expected, other),
        }
    }

    async fn expect_data<S>(watch: &mut Pin<&mut S>, start: u64, bytes: &[u8])
    where
        S: FuturesStream<Item = WatchEvent>,
    {
        match watch.next().await {
            Some(WatchEvent::Data(chunk)) => {
                assert_eq!(chunk.start(), start);
                assert_eq!(chunk.bytes(), bytes);
            }
            other => panic!("expected data {:?}, got {:?}", bytes, other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_until_a_file_appears() {
        let fake = Arc::new(FakeDir::default());
        let watch = watch_fake(&fake);
        pin_mut!(watch);

        let started = Instant::now();
        assert!(matches!(
            watch.next().await,
            Some(WatchEvent::Waiting { .. })
        ));
        assert!(matches!(
            watch.next().await,
            Some(WatchEvent::Waiting { .. })
        ));
        assert!(started.elapsed() >= IDLE_INTERVAL);
        assert_eq!(*watch.state(), WatchState::Idle);

        let a = fake.put("a.rpt", 10, b"hello\n");
        expect_switch(&mut watch, &a).await;
        expect_data(&mut watch, 0, b"hello\n").await;

        let active = watch.state().active().unwrap();
        assert_eq!(active.path(), a);
        assert_eq!(active.offset(), 6);
        assert_eq!(
            active.modified(),
            SystemTime::UNIX_EPOCH + Duration::from_secs(10)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_to_newer_file_resets_offset() {
        let fake = Arc::new(FakeDir::default());
        fake.put("a.rpt", 1, b"old\n");
        let b = fake.put("b.rpt", 2, b"");
        let watch = watch_fake(&fake);
        pin_mut!(watch);

        expect_switch(&mut watch, &b).await;
        fake.append("b.rpt", b"line1\n");
        expect_data(&mut watch, 0, b"line1\n").await;

        let before = Instant::now();
        fake.append("b.rpt", b"line2\n");
        expect_data(&mut watch, 6, b"line2\n").await;
        assert!(before.elapsed() >= TAIL_INTERVAL);

        let c = fake.put("c.rpt", 3, b"preexisting\n");
        expect_switch(&mut watch, &c).await;
        expect_data(&mut watch, 0, b"preexisting\n").await;
        assert_eq!(watch.state().active().unwrap().offset(), 12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_file_returns_to_idle() {
        let fake = Arc::new(FakeDir::default());
        let a = fake.put("a.rpt", 1, b"abc");
        let watch = watch_fake(&fake);
        pin_mut!(watch);

        expect_switch(&mut watch, &a).await;
        expect_data(&mut watch, 0, b"abc").await;

        fake.doom("a.rpt");
        match watch.next().await {
            Some(WatchEvent::Lost { path }) => assert_eq!(path, a),
            other => panic!("expected lost, got {:?}", other),
        }
        assert_eq!(*watch.state(), WatchState::Idle);

        assert!(matches!(
            watch.next().await,
            Some(WatchEvent::Waiting { .. })
        ));

        let b = fake.put("b.rpt", 5, b"new\n");
        expect_switch(&mut watch, &b).await;
        expect_data(&mut watch, 0, b"new\n").await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_removed_file_goes_idle() {
        let fake = Arc::new(FakeDir::default());
        let a = fake.put("a.rpt", 1, b"abc");
        let watch = watch_fake(&fake);
        pin_mut!(watch);

        expect_switch(&mut watch, &a).await;
        expect_data(&mut watch, 0, b"abc").await;

        fake.remove("a.rpt");
        assert!(matches!(
            watch.next().await,
            Some(WatchEvent::Waiting { .. })
        ));
        assert_eq!(*watch.state(), WatchState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_failure_keeps_target() {
        let fake = Arc::new(FakeDir::default());
        let a = fake.put("a.rpt", 1, b"x");
        let watch = watch_fake(&fake);
        pin_mut!(watch);

        expect_switch(&mut watch, &a).await;
        expect_data(&mut watch, 0, b"x").await;

        fake.failing_reads.store(2, Ordering::SeqCst);
        fake.append("a.rpt", b"y");
        expect_data(&mut watch, 1, b"y").await;

        assert_eq!(fake.failing_reads.load(Ordering::SeqCst), 0);
        assert_eq!(watch.state().active().unwrap().offset(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_directory_keeps_target() {
        let fake = Arc::new(FakeDir::default());
        let a = fake.put("a.rpt", 1, b"x");
        let watch = watch_fake(&fake);
        pin_mut!(watch);

        expect_switch(&mut watch, &a).await;
        expect_data(&mut watch, 0, b"x").await;

        fake.unavailable.store(true, Ordering::SeqCst);
        match watch.next().await {
            Some(WatchEvent::Waiting { directory }) => assert_eq!(directory, Path::new(DIR)),
            other => panic!("expected waiting, got {:?}", other),
        }
        assert_eq!(watch.state().active().unwrap().offset(), 1);

        fake.unavailable.store(false, Ordering::SeqCst);
        fake.append("a.rpt", b"z");
        expect_data(&mut watch, 1, b"z").await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_truncated_file_starts_over() {
        let fake = Arc::new(FakeDir::default());
        let a = fake.put("a.rpt", 1, b"long first line\n");
        let watch = watch_fake(&fake);
        pin_mut!(watch);

        expect_switch(&mut watch, &a).await;
        expect_data(&mut watch, 0, b"long first line\n").await;

        fake.rewrite("a.rpt", b"short\n");
        assert!(matches!(
            watch.next().await,
            Some(WatchEvent::Truncated { .. })
        ));
        expect_switch(&mut watch, &a).await;
        expect_data(&mut watch, 0, b"short\n").await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_stream() {
        let fake = Arc::new(FakeDir::default());
        fake.put("a.rpt", 1, b"x");
        let watch = watch_fake(&fake);
        pin_mut!(watch);

        assert!(watch.next().await.is_some());
        watch.as_mut().stop();

        assert_eq!(*watch.state(), WatchState::Stopped);
        assert!(watch.next().await.is_none());
        assert!(watch.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_with_until_cancelled() {
        let fake = Arc::new(FakeDir::default());
        fake.put("a.rpt", 1, b"line1\n");
        let shutdown = CancellationToken::new();
        let mut printer = Printer::new(Vec::new(), InvalidUtf8::Drop);

        let canceller = async {
            time::sleep(Duration::from_secs(3)).await;
            shutdown.cancel();
        };
        let (res, ()) = tokio::join!(
            run_with(watch_fake(&fake), &mut printer, &shutdown),
            canceller
        );
        res.unwrap();

        let text = String::from_utf8(printer.into_inner()).unwrap();
        assert!(text.contains("Now following: a.rpt\n"));
        assert_eq!(text.matches("line1\n").count(), 1);
        let rule = "=".repeat(60);
        assert!(text.ends_with(&format!("Monitoring stopped\n{}\n", rule)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_with_already_cancelled() {
        let fake = Arc::new(FakeDir::default());
        fake.put("a.rpt", 1, b"line1\n");
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let mut printer = Printer::new(Vec::new(), InvalidUtf8::Drop);

        run_with(watch_fake(&fake), &mut printer, &shutdown)
            .await
            .unwrap();

        let text = String::from_utf8(printer.into_inner()).unwrap();
        assert!(!text.contains("line1"));
        assert!(text.contains("Monitoring stopped"));
    }
}
