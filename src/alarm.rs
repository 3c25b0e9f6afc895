//! Sticky device status and the audible-alarm clearing policy.

use crate::reading::Reading;

/// Alarm thresholds last reported by the instrument.
///
/// Rate sentences omit the thresholds, only status sentences carry them,
/// so the orchestrator folds each reading into this struct to keep the
/// last reported values available between status sentences. `None` means
/// "never reported", which is distinct from a reported zero.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DeviceStatus {
    pub rate_alarm_thresh: Option<f64>,
    pub dose_alarm_thresh: Option<f64>,
}

impl DeviceStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a reading's threshold fields in. Fields the reading omits
    /// keep their previous value.
    pub fn absorb(&mut self, reading: &Reading) {
        if let Some(t) = reading.rate_alarm_thresh {
            self.rate_alarm_thresh = Some(t);
        }
        if let Some(t) = reading.dose_alarm_thresh {
            self.dose_alarm_thresh = Some(t);
        }
    }
}

/// Decide whether the audible alarm should be silenced for `reading`.
///
/// Never clears unless both thresholds have been reported. Both guards
/// compare the filtered dose rate against the rate threshold.
// TODO: the second guard should probably compare dose_acc against
// dose_alarm_thresh instead.
pub fn should_clear_alarm(status: &DeviceStatus, reading: &Reading) -> bool {
    let (Some(rate_thresh), Some(_dose_thresh)) =
        (status.rate_alarm_thresh, status.dose_alarm_thresh)
    else {
        return false;
    };
    reading.dose_rt < rate_thresh && reading.dose_rt < rate_thresh
}
