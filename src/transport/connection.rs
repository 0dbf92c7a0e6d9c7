//! Device connection and event loop.
//!
//! A [`Connection`] owns one link (serial device or TCP stream) and one
//! spawned tokio task, the *event loop*, which:
//!
//! - reads inbound lines, classifies them, and dispatches [`Event`]s to
//!   subscribers in arrival order
//! - writes outbound commands from the API
//! - resolves the pending request of the [`RequestTracker`]
//! - runs the close sequence when the link fails or is closed
//!
//! Dispatch and writes happen on the same task, so a command is never
//! written while an inbound line is half dispatched and two commands never
//! interleave their bytes. A subscriber that wants to react to an event with
//! a command calls [`Connection::send`]; the command is written once the
//! current line has been fully dispatched.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::SubscriptionId;
use crate::protocol::{self, ConnectionState, Event, ReturnKind};

use super::{Address, ConnectionOptions, ReadyPolicy, RequestTracker};

// ============================================================================
// Types
// ============================================================================

/// Event handler callback type.
///
/// Called on the event loop for each event, in subscription order.
pub type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Registered handlers in subscription order.
type HandlerList = Vec<(SubscriptionId, EventHandler)>;

/// Acknowledgement channel for a queued command.
type Ack = oneshot::Sender<Result<()>>;

// ============================================================================
// ConnectionCommand
// ============================================================================

/// Internal commands for the event loop.
enum ConnectionCommand {
    /// Write one command line.
    Write { line: String, ack: Option<Ack> },
    /// Mark a request pending, then write it.
    BeginRequest {
        command: String,
        returns: ReturnKind,
        ack: Ack,
    },
    /// Release the link.
    Shutdown,
}

impl ConnectionCommand {
    /// Fails the command without running it.
    fn reject(self) {
        match self {
            Self::Write { ack: Some(ack), .. } | Self::BeginRequest { ack, .. } => {
                let _ = ack.send(Err(Error::NotConnected));
            }
            Self::Write { ack: None, line } => {
                debug!(%line, "Dropped queued command on close");
            }
            Self::Shutdown => {}
        }
    }
}

// ============================================================================
// Shared
// ============================================================================

/// State shared between the API handles and the event loop.
struct Shared {
    handlers: Mutex<HandlerList>,
    tracker: Mutex<RequestTracker>,
    state: watch::Sender<ConnectionState>,
    /// Set once the close sequence, including its events, has finished.
    finished: watch::Sender<bool>,
}

impl Shared {
    /// Delivers an event to every subscriber.
    ///
    /// Handlers are cloned out of the lock so they may subscribe or
    /// unsubscribe while running.
    fn emit(&self, event: &Event) {
        let handlers: Vec<EventHandler> = self
            .handlers
            .lock()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        for handler in handlers {
            handler(event);
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Updates the state, raising `StateChanged` on a transition.
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Connection state changed");
            self.emit(&Event::StateChanged(state));
        }
    }
}

// ============================================================================
// Connection
// ============================================================================

/// Connection to a task device.
///
/// Cheap to clone; all clones drive the same event loop.
///
/// # Thread Safety
///
/// `Connection` is `Send + Sync`. Every method may be called from any task,
/// and none of them block the runtime.
#[derive(Clone)]
pub struct Connection {
    /// Channel for sending commands to the event loop.
    command_tx: mpsc::UnboundedSender<ConnectionCommand>,
    /// State shared with the event loop.
    shared: Arc<Shared>,
}

// ============================================================================
// Connection - Lifecycle
// ============================================================================

impl Connection {
    /// Opens the link at `address` and starts the event loop.
    ///
    /// See [`Address`] for accepted forms. If
    /// [`ConnectionOptions::ready_timeout`] is set, waits for the device to
    /// become ready.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the options or address are invalid
    /// - [`Error::Connection`] if the link cannot be opened
    /// - [`Error::ConnectionTimeout`] if the device is not ready in time
    pub async fn open(address: &str, options: ConnectionOptions) -> Result<Self> {
        options.validate()?;
        let address = Address::parse(address)?;
        let link = address.open(&options).await?;
        let ready_timeout = options.ready_timeout;

        let connection = Self::connect(link, options)?;
        info!(%address, "Connection opened");

        if let Some(ready_timeout) = ready_timeout {
            match timeout(ready_timeout, connection.wait_open()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    warn!(%address, "Device not ready in time");
                    connection.close().await;
                    return Err(Error::connection_timeout(
                        ready_timeout.as_millis() as u64
                    ));
                }
            }
        }

        Ok(connection)
    }

    /// Starts a connection over an already opened link.
    ///
    /// Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the options are invalid.
    pub fn connect<L>(link: L, options: ConnectionOptions) -> Result<Self>
    where
        L: AsyncRead + AsyncWrite + Send + 'static,
    {
        options.validate()?;

        let initial = match options.ready {
            ReadyPolicy::FirstLine => ConnectionState::Opening,
            ReadyPolicy::Immediate | ReadyPolicy::Handshake(_) => ConnectionState::Open,
        };

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(initial);
        let (finished, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            handlers: Mutex::new(Vec::new()),
            tracker: Mutex::new(RequestTracker::new()),
            state,
            finished,
        });

        // Queued before the loop starts, so it is always the first write.
        if let ReadyPolicy::Handshake(command) = &options.ready {
            let _ = command_tx.send(ConnectionCommand::Write {
                line: command.clone(),
                ack: None,
            });
        }

        tokio::spawn(Self::run_event_loop(
            link,
            command_rx,
            Arc::clone(&shared),
            options,
        ));

        Ok(Self { command_tx, shared })
    }

    /// Closes the connection and waits until the close sequence has run.
    ///
    /// Idempotent. A pending request is abandoned before the state becomes
    /// [`ConnectionState::Closed`].
    pub async fn close(&self) {
        self.shutdown();
        let mut finished = self.shared.finished.subscribe();
        let _ = finished.wait_for(|done| *done).await;
    }

    /// Requests the connection to close without waiting.
    pub fn shutdown(&self) {
        let _ = self.command_tx.send(ConnectionCommand::Shutdown);
    }

    /// Waits until the connection is open.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] if it closes first.
    pub async fn wait_open(&self) -> Result<()> {
        let mut state = self.shared.state.subscribe();
        let reached = state
            .wait_for(|state| *state != ConnectionState::Opening)
            .await
            .map(|state| state.is_open())
            .unwrap_or(false);

        if reached {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }
}

// ============================================================================
// Connection - State
// ============================================================================

impl Connection {
    /// Returns the current state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Returns `true` if writes are accepted.
    #[inline]
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state().is_open()
    }

    /// Returns a receiver observing state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Returns `true` if a request is awaiting its response.
    #[inline]
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.shared.tracker.lock().is_pending()
    }
}

// ============================================================================
// Connection - Subscriptions
// ============================================================================

impl Connection {
    /// Registers an event handler.
    ///
    /// Handlers run on the event loop and must not block. To answer an
    /// event with a command, use [`send`](Self::send).
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = SubscriptionId::generate();
        self.shared.handlers.lock().push((id, Arc::new(handler)));
        trace!(%id, "Subscribed");
        id
    }

    /// Removes an event handler.
    ///
    /// Returns `false` if `id` was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.shared.handlers.lock();
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }
}

// ============================================================================
// Connection - Writes
// ============================================================================

impl Connection {
    /// Writes `command` followed by the line terminator and waits for the
    /// flush.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if `command` is empty, not ASCII, or
    ///   contains a line break
    /// - [`Error::NotConnected`] if the connection is not open
    /// - [`Error::Io`] if the link write fails
    pub async fn write(&self, command: &str) -> Result<()> {
        self.ensure_writable(command)?;

        let (ack, ack_rx) = oneshot::channel();
        self.command_tx
            .send(ConnectionCommand::Write {
                line: command.to_string(),
                ack: Some(ack),
            })
            .map_err(|_| Error::NotConnected)?;

        ack_rx.await.map_err(|_| Error::NotConnected)?
    }

    /// Queues `command` without waiting.
    ///
    /// Safe to call from an event handler: the command is written after
    /// the current line has been dispatched. Link failures are logged.
    ///
    /// # Errors
    ///
    /// Same argument and state checks as [`write`](Self::write).
    pub fn send(&self, command: &str) -> Result<()> {
        self.ensure_writable(command)?;
        self.command_tx
            .send(ConnectionCommand::Write {
                line: command.to_string(),
                ack: None,
            })
            .map_err(|_| Error::NotConnected)
    }

    /// Writes a repeatable-action command and marks it pending until a
    /// message of kind `returns` arrives.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyPending`] if a request is outstanding
    /// - any error of [`write`](Self::write)
    pub async fn begin_request(&self, command: &str, returns: ReturnKind) -> Result<()> {
        self.ensure_writable(command)?;

        let (ack, ack_rx) = oneshot::channel();
        self.command_tx
            .send(ConnectionCommand::BeginRequest {
                command: command.to_string(),
                returns,
                ack,
            })
            .map_err(|_| Error::NotConnected)?;

        ack_rx.await.map_err(|_| Error::NotConnected)?
    }

    fn ensure_writable(&self, command: &str) -> Result<()> {
        validate_command(command)?;
        if !self.is_open() {
            return Err(Error::NotConnected);
        }
        Ok(())
    }
}

/// Checks that `command` fits on one ASCII line.
fn validate_command(command: &str) -> Result<()> {
    if command.is_empty() {
        return Err(Error::invalid_argument("command must not be empty"));
    }
    if !command.is_ascii() {
        return Err(Error::invalid_argument(format!(
            "command must be ASCII: {command:?}"
        )));
    }
    if command.contains(['\n', '\r']) {
        return Err(Error::invalid_argument(format!(
            "command must not contain line breaks: {command:?}"
        )));
    }
    Ok(())
}

// ============================================================================
// Connection - Event Loop
// ============================================================================

impl Connection {
    /// Event loop that owns the link.
    async fn run_event_loop<L>(
        link: L,
        mut command_rx: mpsc::UnboundedReceiver<ConnectionCommand>,
        shared: Arc<Shared>,
        options: ConnectionOptions,
    ) where
        L: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, mut writer) = tokio::io::split(link);
        let mut reader = BufReader::new(read_half);
        let mut buf = Vec::new();
        let mut discarding = false;
        let terminator = options.line_terminator.as_str();
        let max_line = options.max_line_length;

        let reason = loop {
            // At most one byte past the limit, so an overlong line shows up
            // as a full buffer without a newline.
            let limit = (max_line + 1).saturating_sub(buf.len()) as u64;
            let mut bounded = (&mut reader).take(limit);

            tokio::select! {
                // Inbound lines from the device
                read = timeout(options.read_timeout, bounded.read_until(b'\n', &mut buf)) => {
                    match read {
                        Err(_) => {
                            trace!("Read timed out, retrying");
                        }

                        Ok(Ok(0)) => {
                            debug!("Link closed by device");
                            break Some("link closed by device".to_string());
                        }

                        Ok(Ok(_)) if buf.last() != Some(&b'\n') && buf.len() > max_line => {
                            if !discarding {
                                warn!(max_line, "Inbound line too long, discarding");
                                discarding = true;
                            }
                            buf.clear();
                        }

                        Ok(Ok(_)) if discarding => {
                            trace!("End of discarded line");
                            discarding = false;
                            buf.clear();
                        }

                        Ok(Ok(_)) => {
                            let line = String::from_utf8_lossy(&buf).trim().to_string();
                            buf.clear();
                            if line.is_empty() {
                                continue;
                            }
                            if shared.state() == ConnectionState::Opening {
                                shared.set_state(ConnectionState::Open);
                            }
                            Self::dispatch_line(&line, &shared);
                        }

                        Ok(Err(e)) => {
                            error!(error = %e, "Link read failed");
                            break Some(format!("read failed: {e}"));
                        }
                    }
                }

                // Commands from the API
                command = command_rx.recv() => {
                    match command {
                        Some(ConnectionCommand::Write { line, ack }) => {
                            if let Err(reason) =
                                Self::handle_write(&line, ack, &mut writer, terminator, &shared).await
                            {
                                break Some(reason);
                            }
                        }

                        Some(ConnectionCommand::BeginRequest { command, returns, ack }) => {
                            if let Err(reason) = Self::handle_begin_request(
                                command,
                                returns,
                                ack,
                                &mut writer,
                                terminator,
                                &shared,
                            )
                            .await
                            {
                                break Some(reason);
                            }
                        }

                        Some(ConnectionCommand::Shutdown) => {
                            debug!("Shutdown command received");
                            break None;
                        }

                        None => {
                            debug!("Command channel closed");
                            break None;
                        }
                    }
                }
            }
        };

        // Release the link
        command_rx.close();
        let _ = writer.shutdown().await;
        drop(writer);
        drop(reader);

        if shared.tracker.lock().abandon() {
            debug!("Pending request abandoned on close");
            shared.emit(&Event::RequestAbandoned);
        }

        while let Ok(command) = command_rx.try_recv() {
            command.reject();
        }

        shared.set_state(ConnectionState::Closed);
        shared.emit(&Event::Closed {
            reason: reason.clone(),
        });
        shared.finished.send_replace(true);

        info!(reason = reason.as_deref().unwrap_or("requested"), "Connection closed");
    }

    /// Classifies one inbound line and raises its events.
    fn dispatch_line(line: &str, shared: &Shared) {
        trace!(line, "Line received");
        shared.emit(&Event::LineReceived(line.to_string()));

        let (kind, body) = protocol::classify(line);
        let Some(event) = Event::for_message(kind, body) else {
            warn!(line, "Unhandled line");
            return;
        };
        shared.emit(&event);

        if kind.has_elements() {
            for element in protocol::split_elements(body) {
                if let Some(event) = Event::for_element(kind, element) {
                    shared.emit(&event);
                }
            }
        }

        let resolved = shared.tracker.lock().resolve(kind);
        if resolved {
            trace!(%kind, "Request resolved");
            shared.emit(&Event::RequestIdle);
        }
    }

    /// Handles a write command.
    ///
    /// Returns `Err(reason)` if the link failed and the loop must end.
    async fn handle_write<W>(
        line: &str,
        ack: Option<Ack>,
        writer: &mut W,
        terminator: &str,
        shared: &Shared,
    ) -> std::result::Result<(), String>
    where
        W: AsyncWrite + Unpin,
    {
        if !shared.state().is_open() {
            match ack {
                Some(ack) => {
                    let _ = ack.send(Err(Error::NotConnected));
                }
                None => warn!(line, "Dropped command, connection not open"),
            }
            return Ok(());
        }

        let result = write_line(writer, line, terminator).await;
        match (result, ack) {
            (Ok(()), ack) => {
                trace!(line, "Command written");
                if let Some(ack) = ack {
                    let _ = ack.send(Ok(()));
                }
                Ok(())
            }
            (Err(e), ack) => {
                error!(error = %e, line, "Link write failed");
                let reason = format!("write failed: {e}");
                if let Some(ack) = ack {
                    let _ = ack.send(Err(Error::Io(e)));
                }
                Err(reason)
            }
        }
    }

    /// Handles a begin-request command.
    ///
    /// Returns `Err(reason)` if the link failed and the loop must end.
    async fn handle_begin_request<W>(
        command: String,
        returns: ReturnKind,
        ack: Ack,
        writer: &mut W,
        terminator: &str,
        shared: &Shared,
    ) -> std::result::Result<(), String>
    where
        W: AsyncWrite + Unpin,
    {
        if !shared.state().is_open() {
            let _ = ack.send(Err(Error::NotConnected));
            return Ok(());
        }

        let begun = shared.tracker.lock().begin(&command, returns);
        if let Err(e) = begun {
            let _ = ack.send(Err(e));
            return Ok(());
        }
        shared.emit(&Event::RequestPending {
            command: command.clone(),
        });

        Self::handle_write(&command, Some(ack), writer, terminator, shared).await
    }
}

/// Writes one terminated line with a single write and flushes.
async fn write_line<W>(writer: &mut W, line: &str, terminator: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut bytes = Vec::with_capacity(line.len() + terminator.len());
    bytes.extend_from_slice(line.as_bytes());
    bytes.extend_from_slice(terminator.as_bytes());
    writer.write_all(&bytes).await?;
    writer.flush().await
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::io;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::task::{Context, Poll};
    use std::time::Duration;

    use tokio::io::{DuplexStream, ReadBuf, duplex};
    use tokio::net::TcpListener;
    use tokio_test::{assert_err, assert_ok};

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    const WAIT: Duration = Duration::from_secs(2);

    fn options() -> ConnectionOptions {
        ConnectionOptions::new().with_read_timeout(Duration::from_millis(50))
    }

    fn connected() -> (Connection, BufReader<DuplexStream>) {
        connected_with(options())
    }

    fn connected_with(options: ConnectionOptions) -> (Connection, BufReader<DuplexStream>) {
        let (client, device) = duplex(4096);
        let connection = Connection::connect(client, options).expect("valid options");
        (connection, BufReader::new(device))
    }

    fn record_events(connection: &Connection) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        connection.subscribe(move |event| {
            let _ = tx.send(event.clone());
        });
        rx
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
        timeout(WAIT, rx.recv())
            .await
            .expect("event in time")
            .expect("connection alive")
    }

    async fn device_line(device: &mut BufReader<DuplexStream>) -> String {
        let mut line = String::new();
        timeout(WAIT, device.read_line(&mut line))
            .await
            .expect("line in time")
            .expect("device readable");
        line
    }

    async fn device_send(device: &mut BufReader<DuplexStream>, line: &str) {
        device
            .get_mut()
            .write_all(line.as_bytes())
            .await
            .expect("device writable");
    }

    /// Link that records every write chunk into a shared journal.
    ///
    /// Once `fail_reads` is set, the next woken read fails.
    struct RecordingLink {
        inner: DuplexStream,
        journal: Arc<Mutex<Vec<String>>>,
        fail_reads: Arc<AtomicBool>,
    }

    impl AsyncRead for RecordingLink {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "device unplugged",
                )));
            }
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for RecordingLink {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            let chunk = String::from_utf8_lossy(buf).into_owned();
            self.journal.lock().push(format!("write:{chunk}"));
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn recording() -> (Connection, DuplexStream, Arc<Mutex<Vec<String>>>) {
        let (connection, device, journal, _) = recording_link();
        (connection, device, journal)
    }

    fn recording_link() -> (
        Connection,
        DuplexStream,
        Arc<Mutex<Vec<String>>>,
        Arc<AtomicBool>,
    ) {
        let (client, device) = duplex(4096);
        let journal = Arc::new(Mutex::new(Vec::new()));
        let fail_reads = Arc::new(AtomicBool::new(false));
        let link = RecordingLink {
            inner: client,
            journal: Arc::clone(&journal),
            fail_reads: Arc::clone(&fail_reads),
        };
        let connection = Connection::connect(link, options()).expect("valid options");
        (connection, device, journal, fail_reads)
    }

    // ------------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_result_line_dispatch_order() {
        let (connection, mut device) = connected();
        let mut events = record_events(&connection);

        device_send(&mut device, "+hit; wait250\n").await;

        assert_eq!(next_event(&mut events).await, Event::LineReceived("+hit; wait250".into()));
        assert_eq!(next_event(&mut events).await, Event::Result("hit; wait250".into()));
        assert_eq!(next_event(&mut events).await, Event::ResultElement("hit".into()));
        assert_eq!(next_event(&mut events).await, Event::ResultElement("wait250".into()));
    }

    #[tokio::test]
    async fn test_each_kind_raises_its_event() {
        let (connection, mut device) = connected();
        let mut events = record_events(&connection);

        device_send(&mut device, ".dbg\n>info\n*err\n<out\n@d500\n").await;

        let expected = [
            Event::Debug("dbg".into()),
            Event::Info("info".into()),
            Event::Error("err".into()),
            Event::Output("out".into()),
            Event::Config("d500".into()),
            Event::ConfigElement("d500".into()),
        ];
        for want in expected {
            loop {
                let event = next_event(&mut events).await;
                if !matches!(event, Event::LineReceived(_)) {
                    assert_eq!(event, want);
                    break;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_plain_line_only_line_received() {
        let (connection, mut device) = connected();
        let mut events = record_events(&connection);

        device_send(&mut device, "hello\n+hit\n").await;

        assert_eq!(next_event(&mut events).await, Event::LineReceived("hello".into()));
        assert_eq!(next_event(&mut events).await, Event::LineReceived("+hit".into()));
        assert_eq!(next_event(&mut events).await, Event::Result("hit".into()));
    }

    #[tokio::test]
    async fn test_crlf_empty_and_invalid_utf8() {
        let (connection, mut device) = connected();
        let mut events = record_events(&connection);

        device
            .get_mut()
            .write_all(b"\r\n\n+h\xffit\r\n")
            .await
            .expect("device writable");

        assert_eq!(
            next_event(&mut events).await,
            Event::LineReceived("+h\u{fffd}it".into())
        );
    }

    #[tokio::test]
    async fn test_overlong_line_is_discarded() {
        let (connection, mut device) = connected_with(options().with_max_line_length(8));
        let mut events = record_events(&connection);

        device_send(&mut device, "+1234567\n").await;
        device_send(&mut device, &format!("+{}\n", "a".repeat(30))).await;
        device_send(&mut device, "+hit\n").await;

        assert_eq!(next_event(&mut events).await, Event::LineReceived("+1234567".into()));
        assert_eq!(next_event(&mut events).await, Event::Result("1234567".into()));
        assert_eq!(next_event(&mut events).await, Event::ResultElement("1234567".into()));
        assert_eq!(next_event(&mut events).await, Event::LineReceived("+hit".into()));
        assert!(connection.is_open());
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let (connection, mut device) = connected();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = connection.subscribe(move |event| {
            let _ = tx.send(event.clone());
        });
        let mut events = record_events(&connection);

        assert!(connection.unsubscribe(id));
        assert!(!connection.unsubscribe(id));

        device_send(&mut device, "+hit\n").await;
        next_event(&mut events).await;
        assert!(rx.try_recv().is_err());
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_write_appends_terminator() {
        let (connection, mut device) = connected();

        assert_ok!(connection.write("X").await);
        assert_eq!(device_line(&mut device).await, "X\n");
    }

    #[tokio::test]
    async fn test_custom_terminator() {
        let (connection, mut device) = connected_with(options().with_line_terminator("\r\n"));

        assert_ok!(connection.write("d500").await);
        assert_eq!(device_line(&mut device).await, "d500\r\n");
    }

    #[tokio::test]
    async fn test_write_rejects_invalid_commands() {
        let (connection, _device) = connected();

        for command in ["", "a\nb", "a\r", "caf\u{e9}"] {
            let err = connection.write(command).await.unwrap_err();
            assert!(matches!(err, Error::InvalidArgument { .. }), "{command:?}");
        }
    }

    #[tokio::test]
    async fn test_concurrent_writers_do_not_interleave() {
        let (connection, _device, journal) = recording();

        let mut tasks = Vec::new();
        for i in 0..16 {
            let connection = connection.clone();
            tasks.push(tokio::spawn(async move {
                connection.write(&format!("command-{i}")).await
            }));
        }
        for task in tasks {
            assert_ok!(task.await.expect("task finished"));
        }

        let journal = journal.lock();
        assert_eq!(journal.len(), 16);
        for chunk in journal.iter() {
            let line = chunk.strip_prefix("write:command-").expect("whole command");
            let number = line.strip_suffix('\n').expect("terminated");
            assert!(number.parse::<u32>().is_ok(), "{chunk:?}");
        }
    }

    #[tokio::test]
    async fn test_write_from_handler_waits_for_dispatch() {
        let (connection, mut device, journal) = recording();

        let responder = connection.clone();
        let handler_journal = Arc::clone(&journal);
        connection.subscribe(move |event| match event {
            Event::ResultElement(element) => {
                handler_journal.lock().push(format!("element:{element}"));
                if element == "a" {
                    assert_ok!(responder.send("Y"));
                }
            }
            Event::RequestIdle => handler_journal.lock().push("idle".into()),
            _ => {}
        });

        assert_ok!(connection.begin_request("X", ReturnKind::Result).await);
        device.write_all(b"+a;b;c\n").await.expect("device writable");

        timeout(WAIT, async {
            while journal.lock().len() < 6 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("dispatch and write in time");

        assert_eq!(
            *journal.lock(),
            vec![
                "write:X\n".to_string(),
                "element:a".into(),
                "element:b".into(),
                "element:c".into(),
                "idle".into(),
                "write:Y\n".into(),
            ]
        );
    }

    // ------------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_begin_request_resolves_on_result() {
        let (connection, mut device) = connected();
        let mut events = record_events(&connection);

        assert_ok!(connection.begin_request("X", ReturnKind::Result).await);
        assert!(connection.is_pending());
        assert_eq!(
            next_event(&mut events).await,
            Event::RequestPending {
                command: "X".into()
            }
        );
        assert_eq!(device_line(&mut device).await, "X\n");

        device_send(&mut device, ">busy\n+hit\n").await;
        loop {
            if next_event(&mut events).await == Event::RequestIdle {
                break;
            }
        }
        assert!(!connection.is_pending());
    }

    #[tokio::test]
    async fn test_begin_request_config_return_kind() {
        let (connection, mut device) = connected();
        let mut events = record_events(&connection);

        assert_ok!(connection.begin_request("?", ReturnKind::Config).await);
        device_send(&mut device, "+hit\n@d500\n").await;

        let mut saw_config = false;
        loop {
            match next_event(&mut events).await {
                Event::Config(_) => saw_config = true,
                Event::RequestIdle => break,
                _ => {}
            }
        }
        assert!(saw_config);
    }

    #[tokio::test]
    async fn test_begin_request_already_pending() {
        let (connection, mut device) = connected();

        assert_ok!(connection.begin_request("X", ReturnKind::Result).await);
        let err = connection.begin_request("Y", ReturnKind::Result).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyPending { ref command } if command == "X"));

        assert_eq!(device_line(&mut device).await, "X\n");
    }

    #[tokio::test]
    async fn test_close_abandons_pending_request_once() {
        let (connection, _device) = connected();
        let mut events = record_events(&connection);

        assert_ok!(connection.begin_request("X", ReturnKind::Result).await);
        connection.close().await;
        connection.close().await;

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        let abandoned = seen.iter().filter(|e| **e == Event::RequestAbandoned).count();
        assert_eq!(abandoned, 1);

        let abandoned_at = seen.iter().position(|e| *e == Event::RequestAbandoned);
        let closed_at = seen
            .iter()
            .position(|e| *e == Event::StateChanged(ConnectionState::Closed));
        assert!(abandoned_at < closed_at);
        assert_eq!(seen.last(), Some(&Event::Closed { reason: None }));

        assert!(!connection.is_pending());
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_write_after_close_not_connected() {
        let (connection, _device) = connected();
        connection.close().await;

        assert!(!connection.is_open());
        assert!(matches!(connection.write("X").await, Err(Error::NotConnected)));
        assert!(matches!(connection.send("X"), Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn test_device_eof_closes_with_reason() {
        let (connection, device) = connected();
        let mut events = record_events(&connection);
        let mut state = connection.watch_state();

        drop(device);

        let closed = timeout(WAIT, state.wait_for(|s| *s == ConnectionState::Closed)).await;
        assert!(closed.is_ok());
        loop {
            if let Event::Closed { reason } = next_event(&mut events).await {
                assert!(reason.is_some());
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_read_failure_abandons_pending_request() {
        let (connection, mut device, _journal, fail_reads) = recording_link();
        let mut events = record_events(&connection);

        assert_ok!(connection.begin_request("X", ReturnKind::Result).await);
        fail_reads.store(true, Ordering::SeqCst);
        // Wake the pending read so it observes the failure.
        device.write_all(b"+").await.expect("device writable");

        let mut seen = Vec::new();
        loop {
            let event = next_event(&mut events).await;
            let closed = matches!(event, Event::Closed { .. });
            seen.push(event);
            if closed {
                break;
            }
        }

        let abandoned_at = seen.iter().position(|e| *e == Event::RequestAbandoned);
        assert!(abandoned_at.is_some(), "{seen:?}");
        assert!(abandoned_at < Some(seen.len() - 1));
        match seen.last() {
            Some(Event::Closed { reason: Some(reason) }) => {
                assert!(reason.contains("device unplugged"), "{reason}");
            }
            other => panic!("expected a closing reason, got {other:?}"),
        }
        assert!(!connection.is_pending());
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_first_line_policy() {
        let (connection, mut device) = connected_with(options().with_ready(ReadyPolicy::FirstLine));
        let mut events = record_events(&connection);

        assert_eq!(connection.state(), ConnectionState::Opening);
        assert!(matches!(connection.write("X").await, Err(Error::NotConnected)));

        device_send(&mut device, ">ready\n").await;
        assert_eq!(
            next_event(&mut events).await,
            Event::StateChanged(ConnectionState::Open)
        );
        assert_ok!(connection.wait_open().await);
        assert_ok!(connection.write("X").await);
        assert_eq!(device_line(&mut device).await, "X\n");
    }

    #[tokio::test]
    async fn test_handshake_is_first_write() {
        let (connection, mut device) =
            connected_with(options().with_ready(ReadyPolicy::handshake("?")));

        assert_ok!(connection.write("X").await);
        assert_eq!(device_line(&mut device).await, "?\n");
        assert_eq!(device_line(&mut device).await, "X\n");
    }

    #[tokio::test]
    async fn test_wait_open_fails_after_close() {
        let (connection, _device) = connected_with(options().with_ready(ReadyPolicy::FirstLine));
        connection.close().await;
        assert_err!(connection.wait_open().await);
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_options() {
        let (client, _device) = duplex(64);
        let result = Connection::connect(client, ConnectionOptions::new().with_baud_rate(0));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_open_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = format!("tcp://{}", listener.local_addr().expect("addr"));

        let device = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            stream.write_all(b"+hit\n").await.expect("write");
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            reader.read_line(&mut line).await.expect("read");
            line
        });

        let connection = Connection::open(&address, options().with_ready(ReadyPolicy::FirstLine))
            .await
            .expect("open");
        let mut events = record_events(&connection);
        assert_ok!(connection.wait_open().await);
        assert_ok!(connection.write("X").await);

        assert_eq!(device.await.expect("device task"), "X\n");
        connection.close().await;
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, Event::RequestAbandoned));
        }
    }

    #[tokio::test]
    async fn test_open_ready_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = format!("tcp://{}", listener.local_addr().expect("addr"));
        let _device = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let options = options()
            .with_ready(ReadyPolicy::FirstLine)
            .with_ready_timeout(Duration::from_millis(100));
        let err = Connection::open(&address, options).await.err().expect("timeout");
        assert!(matches!(err, Error::ConnectionTimeout { timeout_ms: 100 }));
    }
}
