use crate::reading::Reading;
use crate::sentence::checksum;

/// Build a valid reading with quiet alarms and no thresholds.
///
/// Tests can override just the fields they care about.
pub fn base_reading() -> Reading {
    Reading {
        valid: true,
        probe: "GM01".to_string(),
        probe_flag: "N".to_string(),
        dose_rt: 0.0,
        dose_rt_unf: 0.0,
        dose_acc: 0.0,
        dose_unit: "R".to_string(),
        batt_alarm: false,
        dose_alarm: false,
        rate_alarm: false,
        rate_alarm_thresh: None,
        dose_alarm_thresh: None,
    }
}

/// Frame `body` as an instrument sentence with its checksum.
pub fn seal(body: &str) -> String {
    format!("${}*{:02X}", body, checksum(body))
}
