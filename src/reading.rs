//! Structured instrument reading.

/// One parsed report from the instrument.
///
/// All fields come from a single sentence and a `Reading` is never
/// mutated after parse. The threshold fields only appear on status
/// sentences; [`crate::alarm::DeviceStatus`] carries the last reported
/// values forward across sentences that omit them.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    /// Whether the sentence passed checksum and field validation.
    pub valid: bool,
    /// Active probe identity (e.g. `GM01`).
    pub probe: String,
    /// Probe status flag (`N` normal, `O` overload).
    pub probe_flag: String,
    /// Filtered dose rate, in `dose_unit` per hour.
    pub dose_rt: f64,
    /// Unfiltered dose rate, in `dose_unit` per hour.
    pub dose_rt_unf: f64,
    /// Accumulated dose, in `dose_unit`.
    pub dose_acc: f64,
    /// Unit label for the dose fields (`R` for roentgen).
    pub dose_unit: String,
    /// Low-battery alarm flag.
    pub batt_alarm: bool,
    /// Accumulated-dose alarm flag.
    pub dose_alarm: bool,
    /// Dose-rate alarm flag.
    pub rate_alarm: bool,
    /// Dose-rate alarm threshold. `None` when the sentence did not carry
    /// it, which is distinct from a reported zero.
    pub rate_alarm_thresh: Option<f64>,
    /// Accumulated-dose alarm threshold. Same presence rules as
    /// `rate_alarm_thresh`.
    pub dose_alarm_thresh: Option<f64>,
}
