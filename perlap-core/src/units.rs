//! Human-readable lap time formatting
//!
//! Times are kept as integer milliseconds everywhere; these helpers only
//! shape them for logs and displays.

/// Format a duration in milliseconds.
///
/// `0` means "no time yet" and renders as `-`. Anything under a minute is
/// shown as seconds (`12.345s`), longer times as `m:ss.sss`.
pub fn format_lap_time(ms: u64) -> String {
    if ms == 0 {
        return "-".to_string();
    }
    let secs = ms / 1000;
    let millis = ms % 1000;
    if secs < 60 {
        format!("{}.{:03}s", secs, millis)
    } else {
        format!("{}:{:02}.{:03}", secs / 60, secs % 60, millis)
    }
}

/// Signed difference, e.g. `+0.250s` against a reference lap
pub fn format_delta(ms: i64) -> String {
    let sign = if ms < 0 { '-' } else { '+' };
    let abs = ms.unsigned_abs();
    format!("{}{}.{:03}s", sign, abs / 1000, abs % 1000)
}
