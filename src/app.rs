//! Command orchestrator (business logic) for `adm300-ctl`.
//!
//! This module is intentionally decoupled from CLI parsing, signal wiring
//! and process exit codes. The session is injected behind
//! [`DeviceSession`], interruption behind a watch channel and output
//! behind `Write`, so every code path can be tested deterministically
//! without hardware.

use std::io::{self, Write};
use std::time::Duration;

use clap::Parser;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};
use tracing::debug;

use crate::alarm::{self, DeviceStatus};
use crate::metric;
use crate::reading::Reading;
use crate::sentence::RawLine;
use crate::session::{Event, RawMode};
use crate::transport::TransportError;

/// How long one pop from the event queue may wait before the running
/// operation gives up.
pub const POP_TIMEOUT: Duration = Duration::from_secs(4);

/// Poll interval for the boot-wait flags.
pub const BOOT_POLL: Duration = Duration::from_millis(100);

/// Settle time after a power-on marker; the banner means the instrument
/// is mid-boot and not yet stable.
pub const POWER_ON_SETTLE: Duration = Duration::from_secs(3);

/// Default serial device the instrument is attached to.
#[cfg(windows)]
pub const DEFAULT_DEVICE: &str = "COM1";
/// Default serial device the instrument is attached to.
#[cfg(not(windows))]
pub const DEFAULT_DEVICE: &str = "/dev/ttyUSB0";

#[derive(Parser, Debug, Clone)]
#[command(author, about, version)]
pub struct Options {
    /// Silence the audible alarm and exit.
    #[arg(short = 'a', long = "clralarm")]
    pub clear_alarm: bool,

    /// Zero the accumulated dose and exit.
    #[arg(short = 'c', long = "clrdose")]
    pub clear_dose: bool,

    /// Report the accumulated dose once.
    #[arg(short = 'd', long = "dose")]
    pub get_dose: bool,

    /// Report device parameters (not implemented by the firmware).
    #[arg(short = 'g', long = "params")]
    pub get_params: bool,

    /// Print readings continuously (default).
    #[arg(short = 'r', long = "readings")]
    pub readings: bool,

    /// Report the accumulated dose, then zero it.
    #[arg(long)]
    pub gclr: bool,

    /// Automatically silence the audible alarm once readings fall back
    /// under the known thresholds. Only meaningful with -r.
    #[arg(long = "autoalarm")]
    pub auto_alarm: bool,

    /// Serial device the instrument is attached to.
    #[arg(long, default_value = DEFAULT_DEVICE)]
    pub dev: String,

    /// Echo raw sentences alongside parsed output.
    #[arg(long)]
    pub raw: bool,

    /// Echo raw sentences only; suppress parsed output.
    #[arg(long = "rawonly")]
    pub raw_only: bool,

    /// One-shot: tell the instrument to start reporting, then exit.
    #[arg(long = "startrep")]
    pub start_reports: bool,

    /// One-shot: tell the instrument to stop reporting, then exit.
    #[arg(long = "stoprep")]
    pub stop_reports: bool,

    /// Wait for the instrument to boot before running the command.
    #[arg(long)]
    pub wait: bool,

    /// Verbose tracing.
    #[arg(long)]
    pub debug: bool,
}

/// The operation a set of flags resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    ClearAlarm,
    ClearDose,
    GetDose { clear: bool },
    GetParams,
    StartReports,
    StopReports,
    Readings,
}

impl Options {
    /// Resolve the flag soup into one command. First match wins, the
    /// continuous readings mode is the default.
    pub fn command(&self) -> Command {
        if self.clear_alarm {
            Command::ClearAlarm
        } else if self.clear_dose {
            Command::ClearDose
        } else if self.get_dose || self.gclr {
            Command::GetDose { clear: self.gclr }
        } else if self.get_params {
            Command::GetParams
        } else if self.start_reports {
            Command::StartReports
        } else if self.stop_reports {
            Command::StopReports
        } else {
            Command::Readings
        }
    }

    pub fn raw_mode(&self) -> RawMode {
        if self.raw_only {
            RawMode::Only
        } else if self.raw {
            RawMode::Alongside
        } else {
            RawMode::Off
        }
    }
}

/// Errors returned by the orchestrator.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Io(#[from] io::Error),
    /// The session's event stream was already taken by another consumer.
    #[error("event stream already taken")]
    EventsTaken,
}

/// Session abstraction so orchestrator logic can run against a fake
/// instrument in tests.
pub trait DeviceSession {
    fn start_reports(&mut self) -> Result<(), TransportError>;
    fn stop_reports(&mut self) -> Result<(), TransportError>;
    fn clear_dose(&mut self) -> Result<(), TransportError>;
    fn clear_alarm(&mut self) -> Result<(), TransportError>;
    fn got_power_on(&self) -> bool;
    fn got_sentence(&self) -> bool;
    fn take_events(&mut self) -> Option<mpsc::Receiver<Event>>;
}

/// Why a queue wait ended without an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    /// No event within [`POP_TIMEOUT`].
    TimedOut,
    /// User interrupt. Normal termination, not an error.
    Interrupted,
    /// The receive loop ended; the instrument or port went away.
    Disconnected,
}

impl Stop {
    fn describe(self) -> &'static str {
        match self {
            Stop::TimedOut => "timed out waiting for a reading",
            Stop::Interrupted => "interrupted",
            Stop::Disconnected => "connection closed",
        }
    }
}

/// Pop the next event, bounded by the pop timeout and the interrupt
/// channel.
async fn next_event(
    events: &mut mpsc::Receiver<Event>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<Event, Stop> {
    tokio::select! {
        _ = shutdown.changed() => Err(Stop::Interrupted),
        popped = timeout(POP_TIMEOUT, events.recv()) => match popped {
            Err(_) => Err(Stop::TimedOut),
            Ok(None) => Err(Stop::Disconnected),
            Ok(Some(event)) => Ok(event),
        },
    }
}

fn print_raw(raw: &RawLine, out: &mut dyn Write) -> io::Result<()> {
    if raw.unexpected_length() {
        writeln!(out, "raw [len {}]: {}", raw.text.len(), raw.text)
    } else {
        writeln!(out, "raw: {}", raw.text)
    }
}

fn print_reading(reading: &Reading, out: &mut dyn Write) -> io::Result<()> {
    let unit = &reading.dose_unit;
    writeln!(
        out,
        "{}/{} rate: {}{unit}/hr  dose: {}{unit}  unfiltered: {}{unit}/hr",
        reading.probe,
        reading.probe_flag,
        metric::format_value(reading.dose_rt),
        metric::format_value(reading.dose_acc),
        metric::format_value(reading.dose_rt_unf),
    )
}

fn triggered_alarms(reading: &Reading) -> Vec<&'static str> {
    let mut alarms = Vec::new();
    if reading.batt_alarm {
        alarms.push("battery");
    }
    if reading.dose_alarm {
        alarms.push("dose");
    }
    if reading.rate_alarm {
        alarms.push("rate");
    }
    alarms
}

/// Single-shot dose query: wait for the first valid reading, report its
/// accumulated dose and optionally zero the register.
async fn get_dose(
    session: &mut dyn DeviceSession,
    events: &mut mpsc::Receiver<Event>,
    shutdown: &mut watch::Receiver<bool>,
    clear: bool,
    out: &mut dyn Write,
    err: &mut dyn Write,
) -> Result<(), RunError> {
    loop {
        match next_event(events, shutdown).await {
            Ok(Event::Reading(reading)) => {
                if !reading.valid {
                    continue;
                }
                writeln!(
                    out,
                    "accumulated dose: {}{}",
                    metric::format_value(reading.dose_acc),
                    reading.dose_unit
                )?;
                if clear {
                    session.clear_dose()?;
                }
                return Ok(());
            }
            Ok(Event::Raw(raw)) => print_raw(&raw, out)?,
            Err(stop) => {
                writeln!(err, "{}", stop.describe())?;
                return Ok(());
            }
        }
    }
}

/// Continuous readings mode. Loops until timeout, interrupt or
/// disconnect, reporting which one ended it.
async fn run_readings(
    session: &mut dyn DeviceSession,
    events: &mut mpsc::Receiver<Event>,
    shutdown: &mut watch::Receiver<bool>,
    auto_alarm: bool,
    out: &mut dyn Write,
    err: &mut dyn Write,
) -> Result<(), RunError> {
    let mut status = DeviceStatus::new();
    loop {
        match next_event(events, shutdown).await {
            Ok(Event::Reading(reading)) => {
                if !reading.valid {
                    debug!("skipping invalid reading");
                    continue;
                }
                status.absorb(&reading);
                print_reading(&reading, out)?;
                let alarms = triggered_alarms(&reading);
                if !alarms.is_empty() {
                    writeln!(out, "ALARM: {}", alarms.join(", "))?;
                    if auto_alarm && alarm::should_clear_alarm(&status, &reading) {
                        session.clear_alarm()?;
                        writeln!(err, "audible alarm cleared")?;
                    }
                }
            }
            Ok(Event::Raw(raw)) => print_raw(&raw, out)?,
            Err(stop) => {
                writeln!(err, "{}", stop.describe())?;
                return Ok(());
            }
        }
    }
}

/// Busy-poll the boot flags until the instrument shows life. A power-on
/// marker means the instrument is mid-boot, so a settle sleep follows
/// before proceeding. Returns false when interrupted.
async fn boot_wait(
    session: &dyn DeviceSession,
    shutdown: &mut watch::Receiver<bool>,
    err: &mut dyn Write,
) -> Result<bool, RunError> {
    writeln!(err, "waiting for instrument...")?;
    loop {
        if session.got_power_on() {
            sleep(POWER_ON_SETTLE).await;
            return Ok(true);
        }
        if session.got_sentence() {
            return Ok(true);
        }
        tokio::select! {
            _ = shutdown.changed() => return Ok(false),
            _ = sleep(BOOT_POLL) => {}
        }
    }
}

/// Teardown half of the report start/stop bracket. Runs on every exit
/// path; its own failure is only traced.
fn stop_reports_best_effort(session: &mut dyn DeviceSession) {
    if let Err(e) = session.stop_reports() {
        debug!(error = %e, "stop_reports during teardown failed");
    }
}

/// Run the resolved command against the session, writing reports to
/// `out` and diagnostics to `err`.
///
/// Flipping `shutdown` unblocks every timed wait and is treated as
/// normal termination, not an error.
pub async fn run_with_io(
    options: &Options,
    session: &mut dyn DeviceSession,
    mut shutdown: watch::Receiver<bool>,
    out: &mut dyn Write,
    err: &mut dyn Write,
) -> Result<(), RunError> {
    if options.wait && !boot_wait(session, &mut shutdown, err).await? {
        return Ok(());
    }

    match options.command() {
        Command::ClearAlarm => Ok(session.clear_alarm()?),
        Command::ClearDose => Ok(session.clear_dose()?),
        Command::StartReports => Ok(session.start_reports()?),
        Command::StopReports => Ok(session.stop_reports()?),
        Command::GetParams => {
            writeln!(err, "device parameter query is not implemented")?;
            Ok(())
        }
        Command::GetDose { clear } => {
            let mut events = session.take_events().ok_or(RunError::EventsTaken)?;
            let result = match session.start_reports() {
                Ok(()) => get_dose(session, &mut events, &mut shutdown, clear, out, err).await,
                Err(e) => Err(e.into()),
            };
            stop_reports_best_effort(session);
            result
        }
        Command::Readings => {
            let mut events = session.take_events().ok_or(RunError::EventsTaken)?;
            let result = match session.start_reports() {
                Ok(()) => {
                    run_readings(
                        session,
                        &mut events,
                        &mut shutdown,
                        options.auto_alarm,
                        out,
                        err,
                    )
                    .await
                }
                Err(e) => Err(e.into()),
            };
            stop_reports_best_effort(session);
            result
        }
    }
}
