//! Protocol session: owns the serial link and the background receive
//! loop.
//!
//! The receive loop runs on a dedicated OS thread, is the sole producer
//! onto the event channel and the sole writer of the boot flags. Command
//! writes go out through an independently cloned port handle from the
//! consumer thread, so the two directions never share a buffer.

use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::app::DeviceSession;
use crate::reading::Reading;
use crate::sentence::{self, Parsed, RawLine};
use crate::transport::{LineBuffer, Transport, TransportError};

/// Event channel capacity. The producer never blocks: events past this
/// bound are dropped with a warning.
pub const EVENT_CHANNEL_BUFFER_SIZE: usize = 100;

/// Which lines the session surfaces to the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RawMode {
    /// Parsed readings only.
    #[default]
    Off,
    /// Raw lines alongside parsed readings.
    Alongside,
    /// Raw lines only; parsing is skipped.
    Only,
}

impl RawMode {
    fn raw_enabled(self) -> bool {
        !matches!(self, RawMode::Off)
    }

    fn parse_enabled(self) -> bool {
        !matches!(self, RawMode::Only)
    }
}

/// One unit of instrument output handed to the consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Reading(Reading),
    Raw(RawLine),
}

/// Set-once observations made by the receive loop. Monotonic for the
/// lifetime of the session.
#[derive(Debug, Default)]
pub struct SessionFlags {
    power_on: AtomicBool,
    sentence: AtomicBool,
}

impl SessionFlags {
    pub fn power_on(&self) -> bool {
        self.power_on.load(Ordering::Relaxed)
    }

    pub fn sentence(&self) -> bool {
        self.sentence.load(Ordering::Relaxed)
    }
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Serial device path (`/dev/ttyUSB0`, `COM3`, ...).
    pub device: String,
    pub raw_mode: RawMode,
}

/// The device communication object: transport + parser + receive loop.
pub struct Session {
    transport: Option<Transport>,
    events: Option<mpsc::Receiver<Event>>,
    flags: Arc<SessionFlags>,
    shutdown: Arc<AtomicBool>,
    receiver: Option<JoinHandle<()>>,
}

impl Session {
    /// Open the device and start the receive loop.
    ///
    /// Transport-open failure is fatal and propagates to the caller;
    /// everything after a successful open degrades locally instead of
    /// tearing the session down.
    pub fn begin(config: &SessionConfig) -> Result<Self, TransportError> {
        let transport = Transport::open(&config.device)?;
        let reader = transport.reader()?;
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_BUFFER_SIZE);
        let flags = Arc::new(SessionFlags::default());
        let shutdown = Arc::new(AtomicBool::new(false));
        let raw_mode = config.raw_mode;

        let handle = {
            let flags = Arc::clone(&flags);
            let shutdown = Arc::clone(&shutdown);
            std::thread::Builder::new()
                .name("adm300-recv".into())
                .spawn(move || receive_loop(reader, &tx, &flags, &shutdown, raw_mode))
                .map_err(TransportError::Io)?
        };
        debug!(device = %config.device, "session started");

        Ok(Self {
            transport: Some(transport),
            events: Some(rx),
            flags,
            shutdown,
            receiver: Some(handle),
        })
    }

    fn write(&mut self, cmd: &[u8]) -> Result<(), TransportError> {
        match self.transport.as_mut() {
            Some(transport) => {
                debug!(cmd = %String::from_utf8_lossy(cmd).trim_end(), "command");
                transport.write_command(cmd)
            }
            None => Err(TransportError::Closed),
        }
    }

    /// Stop the receive loop and release the port.
    ///
    /// Idempotent by construction: the thread handle and the transport
    /// are taken on the first call, repeats are no-ops.
    pub fn kill(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.receiver.take() {
            if handle.join().is_err() {
                warn!("receive loop panicked during shutdown");
            }
        }
        self.transport = None;
    }
}

impl DeviceSession for Session {
    fn start_reports(&mut self) -> Result<(), TransportError> {
        self.write(sentence::CMD_START_REPORTS)
    }

    fn stop_reports(&mut self) -> Result<(), TransportError> {
        self.write(sentence::CMD_STOP_REPORTS)
    }

    fn clear_dose(&mut self) -> Result<(), TransportError> {
        self.write(sentence::CMD_CLEAR_DOSE)
    }

    fn clear_alarm(&mut self) -> Result<(), TransportError> {
        self.write(sentence::CMD_CLEAR_ALARM)
    }

    fn got_power_on(&self) -> bool {
        self.flags.power_on()
    }

    fn got_sentence(&self) -> bool {
        self.flags.sentence()
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<Event>> {
        self.events.take()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.kill();
    }
}

/// The receive loop. Runs until shutdown is flagged or the stream ends;
/// a single bad read or bad line never ends it.
fn receive_loop(
    mut reader: impl Read,
    tx: &mpsc::Sender<Event>,
    flags: &SessionFlags,
    shutdown: &AtomicBool,
    raw_mode: RawMode,
) {
    let mut lines = LineBuffer::new();
    let mut chunk = [0u8; 256];
    while !shutdown.load(Ordering::Relaxed) {
        match reader.read(&mut chunk) {
            // End of stream: dropping the sender tells the consumer the
            // instrument went away.
            Ok(0) => break,
            Ok(n) => {
                lines.push(&chunk[..n]);
                while let Some(line) = lines.next_line() {
                    handle_line(&line, tx, flags, raw_mode);
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::TimedOut
                        | std::io::ErrorKind::WouldBlock
                        | std::io::ErrorKind::Interrupted
                ) => {}
            Err(e) => {
                warn!(error = %e, "serial read failed, continuing");
            }
        }
    }
    debug!("receive loop finished");
}

fn handle_line(line: &str, tx: &mpsc::Sender<Event>, flags: &SessionFlags, raw_mode: RawMode) {
    flags.sentence.store(true, Ordering::Relaxed);
    if sentence::is_power_on(line) {
        flags.power_on.store(true, Ordering::Relaxed);
    }
    if raw_mode.raw_enabled() {
        dispatch(tx, Event::Raw(RawLine::new(line)));
    }
    if !raw_mode.parse_enabled() {
        return;
    }
    match sentence::parse(line) {
        Parsed::Reading(reading) => dispatch(tx, Event::Reading(reading)),
        Parsed::Raw(raw) => {
            if !raw_mode.raw_enabled() {
                debug!(line = %raw.text, "unparseable line");
            }
        }
    }
}

/// Push one event without ever blocking the receive loop. Overflow is
/// reported and the event dropped.
fn dispatch(tx: &mpsc::Sender<Event>, event: Event) {
    if let Err(e) = tx.try_send(event) {
        warn!(error = %e, "event queue full, dropping");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::seal;
    use std::io::Cursor;

    const RATE_BODY: &str = "ADR,GM01,N,1.23E-04,1.20E-04,4.56E-02,R,000";

    fn run_loop(input: &str, capacity: usize, raw_mode: RawMode) -> (mpsc::Receiver<Event>, SessionFlags) {
        let (tx, rx) = mpsc::channel(capacity);
        let flags = SessionFlags::default();
        let shutdown = AtomicBool::new(false);
        receive_loop(Cursor::new(input.as_bytes().to_vec()), &tx, &flags, &shutdown, raw_mode);
        (rx, flags)
    }

    #[test]
    fn test_readings_arrive_in_order() {
        let input = format!("{}\r\n{}\r\n", seal(RATE_BODY), seal("ADR,GM01,N,5.00E-01,5.10E-01,2.00E-03,R,000"));
        let (mut rx, flags) = run_loop(&input, 10, RawMode::Off);

        let Some(Event::Reading(first)) = rx.try_recv().ok() else {
            panic!("expected a reading");
        };
        assert!((first.dose_rt - 1.23e-4).abs() < 1e-12);
        let Some(Event::Reading(second)) = rx.try_recv().ok() else {
            panic!("expected a reading");
        };
        assert!((second.dose_rt - 0.5).abs() < 1e-12);
        assert!(rx.try_recv().is_err());

        assert!(flags.sentence());
        assert!(!flags.power_on());
    }

    #[test]
    fn test_power_on_flag_from_banner_and_sentence() {
        let (_rx, flags) = run_loop("ADM-300 v1.9\r\n", 10, RawMode::Off);
        assert!(flags.power_on());
        assert!(flags.sentence());

        let (_rx, flags) = run_loop("$ADP,PWR*2C\r\n", 10, RawMode::Off);
        assert!(flags.power_on());
    }

    #[test]
    fn test_garbage_produces_no_reading_but_sets_sentence_flag() {
        let (mut rx, flags) = run_loop("complete garbage\r\n", 10, RawMode::Off);
        assert!(rx.try_recv().is_err());
        assert!(flags.sentence());
    }

    #[test]
    fn test_raw_alongside_emits_both() {
        let input = format!("{}\r\n", seal(RATE_BODY));
        let (mut rx, _flags) = run_loop(&input, 10, RawMode::Alongside);

        assert!(matches!(rx.try_recv(), Ok(Event::Raw(_))));
        assert!(matches!(rx.try_recv(), Ok(Event::Reading(_))));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_raw_only_skips_parsing() {
        let input = format!("{}\r\n", seal(RATE_BODY));
        let (mut rx, _flags) = run_loop(&input, 10, RawMode::Only);

        assert!(matches!(rx.try_recv(), Ok(Event::Raw(_))));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_full_queue_drops_instead_of_blocking() {
        // Three sentences into a capacity-1 channel with no consumer:
        // the loop must still run to completion.
        let line = seal(RATE_BODY);
        let input = format!("{line}\r\n{line}\r\n{line}\r\n");
        let (mut rx, _flags) = run_loop(&input, 1, RawMode::Off);

        assert!(matches!(rx.try_recv(), Ok(Event::Reading(_))));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_shutdown_flag_stops_loop() {
        struct NeverReady;
        impl Read for NeverReady {
            fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
                Err(std::io::ErrorKind::TimedOut.into())
            }
        }

        let (tx, _rx) = mpsc::channel(1);
        let flags = SessionFlags::default();
        let shutdown = AtomicBool::new(true);
        // Returns immediately instead of spinning on timeouts forever
        receive_loop(NeverReady, &tx, &flags, &shutdown, RawMode::Off);
    }
}
