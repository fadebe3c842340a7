use std::{
    fs,
    os::unix::fs::FileTypeExt,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use chrono::Utc;
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{UnixListener, UnixStream},
    signal::unix::{signal, SignalKind},
    task::JoinHandle,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

use txrelay_base::{
    db::{QueueResult, QueueStore},
    settings::SessionConf,
    RelayMetrics,
};
use txrelay_core::{serialize::decode_hex, ChainInterface, QueuedTransaction, TxHash};

use crate::{protocol::Response, Dispatcher, RelayError, Retrier};

/// Where the controller is in its loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for a client or the accept timeout
    Listening,
    /// Serving a connected client
    ClientConnected,
    /// Socket closed, loop exited
    ShuttingDown,
}

/// Closes the session exactly once, no matter how many signals or callers
/// ask for it.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    socket_path: PathBuf,
    done: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl ShutdownHandle {
    /// A handle for the socket at `socket_path`, cancelling `cancel` on
    /// shutdown
    pub fn new(socket_path: PathBuf, cancel: CancellationToken) -> Self {
        Self {
            socket_path,
            done: Default::default(),
            cancel,
        }
    }

    /// Stop the controller and unlink its socket. Later calls do nothing.
    pub fn shutdown(&self) {
        if self.done.swap(true, Ordering::SeqCst) {
            debug!("Shutdown already in progress");
            return;
        }
        info!(path = ?self.socket_path, "Shutting down session");
        self.cancel.cancel();
        // never unlink something we did not create
        match fs::symlink_metadata(&self.socket_path) {
            Ok(meta) if meta.file_type().is_socket() => {
                if let Err(err) = fs::remove_file(&self.socket_path) {
                    warn!(?err, path = ?self.socket_path, "Failed to unlink socket");
                }
            }
            Ok(_) => warn!(path = ?self.socket_path, "Not unlinking, path is not a socket"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(?err, path = ?self.socket_path, "Failed to inspect socket"),
        }
    }

    /// Whether shutdown has been requested
    pub fn is_shut_down(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// Resolves once shutdown has been requested
    pub async fn wait(&self) {
        self.cancel.cancelled().await
    }
}

/// Call [`ShutdownHandle::shutdown`] on every SIGINT and SIGTERM.
pub fn spawn_signal_handler(handle: ShutdownHandle) -> std::io::Result<JoinHandle<()>> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    Ok(tokio::spawn(async move {
        loop {
            let name = tokio::select! {
                Some(()) = interrupt.recv() => "SIGINT",
                Some(()) = terminate.recv() => "SIGTERM",
                else => break,
            };
            info!(signal = name, "Received signal");
            handle.shutdown();
        }
    }))
}

/// How long to wait for a client before running a dispatch pass.
#[derive(Debug, Clone, Copy)]
pub struct AcceptDelay {
    current: Duration,
    busy: Duration,
    max: Duration,
}

impl AcceptDelay {
    /// Start at `initial`
    pub fn new(initial: Duration, busy: Duration, max: Duration) -> Self {
        Self {
            current: initial,
            busy,
            max,
        }
    }

    /// The wait before the next pass
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Shorten the wait after a pass that did work, back off after an idle
    /// one.
    pub fn after_pass(&mut self, work: usize) {
        self.current = if work > 0 {
            self.busy
        } else {
            self.current.saturating_mul(2).max(self.busy).min(self.max)
        };
    }
}

enum ReadError {
    Timeout,
    Oversized,
    Io(std::io::Error),
}

/// Read one newline or EOF terminated request of at most `max` bytes.
/// `None` when the client closed without sending anything.
async fn read_request<R>(
    reader: &mut R,
    max: usize,
    wait: Duration,
) -> Result<Option<Vec<u8>>, ReadError>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let limit = u64::try_from(max).unwrap_or(u64::MAX).saturating_add(1);
    let read = timeout(wait, reader.take(limit).read_until(b'\n', &mut buf))
        .await
        .map_err(|_| ReadError::Timeout)?
        .map_err(ReadError::Io)?;
    if read == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
    } else if buf.len() > max {
        return Err(ReadError::Oversized);
    }
    Ok(Some(buf))
}

/// The daemon's front door: admits transactions from clients of a unix
/// socket and runs dispatch passes whenever no client shows up for a while.
#[derive(Debug)]
pub struct SessionController {
    conf: SessionConf,
    socket_path: PathBuf,
    chain: Arc<dyn ChainInterface>,
    store: Arc<dyn QueueStore>,
    dispatcher: Dispatcher,
    retrier: Option<Retrier>,
    metrics: Arc<RelayMetrics>,
    shutdown: ShutdownHandle,
    state: SessionState,
}

impl SessionController {
    /// A controller listening on `conf.socket_path()`
    pub fn new(
        conf: SessionConf,
        chain: Arc<dyn ChainInterface>,
        store: Arc<dyn QueueStore>,
        dispatcher: Dispatcher,
        retrier: Option<Retrier>,
        metrics: Arc<RelayMetrics>,
        cancel: CancellationToken,
    ) -> Self {
        let socket_path = conf.socket_path();
        Self {
            shutdown: ShutdownHandle::new(socket_path.clone(), cancel),
            conf,
            socket_path,
            chain,
            store,
            dispatcher,
            retrier,
            metrics,
            state: SessionState::Listening,
        }
    }

    /// A handle that stops this controller
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// The socket clients connect to
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Current loop state
    pub fn state(&self) -> SessionState {
        self.state
    }

    fn bind(&self) -> Result<UnixListener, RelayError> {
        if let Some(parent) = self.socket_path.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::symlink_metadata(&self.socket_path) {
            Ok(meta) if meta.file_type().is_socket() => {
                warn!(path = ?self.socket_path, "Removing stale socket");
                fs::remove_file(&self.socket_path)?;
            }
            Ok(_) => {
                return Err(RelayError::SocketState(format!(
                    "{:?} exists and is not a socket",
                    self.socket_path
                )))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        Ok(UnixListener::bind(&self.socket_path)?)
    }

    fn check_socket(&self) -> Result<(), RelayError> {
        match fs::symlink_metadata(&self.socket_path) {
            Ok(meta) if meta.file_type().is_socket() => Ok(()),
            Ok(_) => Err(RelayError::SocketState(format!(
                "{:?} was replaced by something that is not a socket",
                self.socket_path
            ))),
            Err(err) => Err(RelayError::SocketState(format!(
                "{:?} vanished: {err}",
                self.socket_path
            ))),
        }
    }

    /// Serve until shutdown is requested or a fatal error occurs. The socket
    /// is unlinked on the way out either way.
    pub async fn run(&mut self) -> Result<(), RelayError> {
        let result = self.serve().await;
        if let Err(err) = &result {
            error!(?err, "Session controller stopped");
        }
        self.state = SessionState::ShuttingDown;
        self.shutdown.shutdown();
        result
    }

    async fn serve(&mut self) -> Result<(), RelayError> {
        let listener = self.bind()?;
        info!(path = ?self.socket_path, "Listening for transactions");

        let released = self.store.release_reservations(Utc::now()).await?;
        if !released.is_empty() {
            warn!(count = released.len(), "Released reservations of an interrupted pass");
        }

        let cancel = self.shutdown.cancel.clone();
        let mut delay = AcceptDelay::new(
            self.conf.dispatch_delay(),
            self.conf.busy_delay(),
            self.conf.max_dispatch_delay(),
        );
        loop {
            self.state = SessionState::Listening;
            if cancel.is_cancelled() {
                return Ok(());
            }
            self.check_socket()?;

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                accepted = timeout(delay.current(), listener.accept()) => match accepted {
                    Ok(Ok((stream, _))) => {
                        self.state = SessionState::ClientConnected;
                        self.serve_client(stream)
                            .instrument(info_span!("client"))
                            .await?;
                    }
                    Ok(Err(err)) => warn!(?err, "Failed to accept client"),
                    Err(_) => {
                        let work = self.run_pass().await?;
                        delay.after_pass(work);
                        debug!(work, next = ?delay.current(), "Pass done");
                    }
                },
            }
        }
    }

    /// One dispatch pass plus retries. A backend integrity failure is tried
    /// once more before it stops the controller.
    async fn run_pass(&self) -> Result<usize, RelayError> {
        match self.pass_once().await {
            Err(err) if err.is_integrity() => {
                warn!(?err, "Storage integrity error during pass, retrying once");
                Ok(self.pass_once().await?)
            }
            result => Ok(result?),
        }
    }

    #[instrument(skip_all)]
    async fn pass_once(&self) -> QueueResult<usize> {
        let started = Instant::now();
        let now = Utc::now();
        let mut work = self.dispatcher.process(now).await?;
        if let Some(retrier) = &self.retrier {
            work += retrier.process(now).await?;
        }
        self.metrics
            .dispatch_pass_duration_ms
            .set(started.elapsed().as_millis().try_into().unwrap_or(i64::MAX));
        Ok(work)
    }

    /// Answer requests on one connection. After a rejection the client may
    /// send one more request, an acceptance ends the connection.
    async fn serve_client(&self, mut stream: UnixStream) -> Result<(), RelayError> {
        let (read, mut write) = stream.split();
        let mut reader = BufReader::new(read);
        let mut retry_used = false;
        loop {
            let request = match read_request(
                &mut reader,
                self.conf.max_message_size,
                self.conf.client_timeout(),
            )
            .await
            {
                Ok(Some(request)) => request,
                Ok(None) => {
                    debug!("Client closed the connection");
                    return Ok(());
                }
                Err(ReadError::Timeout) => {
                    debug!("Client sent nothing in time");
                    return Ok(());
                }
                Err(ReadError::Io(err)) => {
                    warn!(?err, "Failed to read request");
                    return Ok(());
                }
                Err(ReadError::Oversized) => {
                    warn!(max = self.conf.max_message_size, "Request too large");
                    self.metrics
                        .transactions_rejected
                        .with_label_values(&["oversized"])
                        .inc();
                    if let Err(err) = write.write_all(&Response::rejected().encode()).await {
                        warn!(?err, "Failed to answer client");
                    }
                    return Ok(());
                }
            };

            let (response, fatal) = match self.admit(&request).await {
                Ok(hash) => (Response::Accepted(hash), None),
                Err(err) => {
                    warn!(error = %err, "Rejected request");
                    self.metrics
                        .transactions_rejected
                        .with_label_values(&[err.reason()])
                        .inc();
                    let fatal = err.is_fatal().then_some(err);
                    (Response::rejected(), fatal)
                }
            };
            if let Err(err) = write.write_all(&response.encode()).await {
                warn!(?err, "Failed to answer client");
                return fatal.map_or(Ok(()), Err);
            }
            if let Some(err) = fatal {
                return Err(err);
            }
            if matches!(response, Response::Accepted(_)) || retry_used {
                return Ok(());
            }
            retry_used = true;
        }
    }

    /// Decode a request and queue the transaction it carries.
    async fn admit(&self, request: &[u8]) -> Result<TxHash, RelayError> {
        let text = std::str::from_utf8(request)
            .map_err(|err| RelayError::InvalidInput(format!("request is not text: {err}")))?;
        let raw = decode_hex(text)
            .map_err(|err| RelayError::InvalidInput(format!("request is not hex: {err}")))?;
        if raw.is_empty() {
            return Err(RelayError::InvalidInput("empty request".to_owned()));
        }
        let decoded = self
            .chain
            .decode_transaction(&raw)
            .map_err(|err| RelayError::InvalidInput(err.to_string()))?;

        let tx = QueuedTransaction::new(decoded, Utc::now());
        self.store.create(&tx).await?;
        self.metrics.transactions_admitted.inc();
        info!(tx_hash = ?tx.hash, sender = ?tx.sender, nonce = tx.nonce, "Queued transaction");
        Ok(tx.hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_shrinks_when_busy_and_backs_off_when_idle() {
        let mut delay = AcceptDelay::new(
            Duration::from_secs(4),
            Duration::from_millis(100),
            Duration::from_secs(4),
        );
        delay.after_pass(3);
        assert_eq!(delay.current(), Duration::from_millis(100));
        delay.after_pass(0);
        assert_eq!(delay.current(), Duration::from_millis(200));
        for _ in 0..10 {
            delay.after_pass(0);
        }
        assert_eq!(delay.current(), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn request_reading_stops_at_newline_and_limit() {
        let mut input: &[u8] = b"abcd\nef";
        let first = read_request(&mut input, 16, Duration::from_secs(1)).await;
        assert!(matches!(first, Ok(Some(ref bytes)) if bytes == b"abcd"));
        let second = read_request(&mut input, 16, Duration::from_secs(1)).await;
        assert!(matches!(second, Ok(Some(ref bytes)) if bytes == b"ef"));
        let done = read_request(&mut input, 16, Duration::from_secs(1)).await;
        assert!(matches!(done, Ok(None)));

        let mut big: &[u8] = b"0123456789";
        assert!(matches!(
            read_request(&mut big, 4, Duration::from_secs(1)).await,
            Err(ReadError::Oversized)
        ));
    }

    #[test]
    fn shutdown_runs_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relayd.sock");
        let _listener = std::os::unix::net::UnixListener::bind(&path).unwrap();
        let cancel = CancellationToken::new();
        let handle = ShutdownHandle::new(path.clone(), cancel.clone());

        handle.shutdown();
        assert!(cancel.is_cancelled());
        assert!(!path.exists());

        // a new socket at the path is left alone by the second call
        let _rebound = std::os::unix::net::UnixListener::bind(&path).unwrap();
        handle.clone().shutdown();
        assert!(path.exists());
        assert!(handle.is_shut_down());
    }

    #[test]
    fn shutdown_leaves_regular_files_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relayd.sock");
        fs::write(&path, b"not a socket").unwrap();
        ShutdownHandle::new(path.clone(), CancellationToken::new()).shutdown();
        assert!(path.exists());
    }
}
