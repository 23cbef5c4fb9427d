use std::time::Duration;

pub mod job;
pub mod sql_type;

///
/// Consistent formatting for durations and throughput in log output. Truncates to millisecond
/// precision - humantime's micro/nano digits are noise for a run that processes thousands of rows.
///
pub fn formatted_duration_rate(amount: usize, elapsed: Duration) -> (String, String) {
    let duration = Duration::new(elapsed.as_secs(), elapsed.subsec_millis() * 1_000_000);
    let rate = elapsed.as_millis() as f64 / amount.max(1) as f64;
    (
        humantime::format_duration(duration).to_string(),
        format!("{:.3}ms/row", rate),
    )
}
