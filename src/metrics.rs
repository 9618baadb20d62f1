use metrics::{counter, describe_counter, describe_histogram, histogram};
use std::time::Duration;

/// Register metric descriptions (can be called multiple times safely)
pub fn describe_metrics() {
    describe_counter!(
        "access_log_writes_total",
        "Total number of access log inserts, by outcome"
    );
    describe_histogram!(
        "access_log_write_duration_seconds",
        "Access log insert duration in seconds"
    );
    describe_counter!(
        "access_log_schema_changes_total",
        "Total number of DDL statements issued by schema reconciliation"
    );
    describe_counter!(
        "access_log_skipped_total",
        "Total number of requests the skip predicate excluded"
    );
}

/// Record an insert attempt
pub fn record_write(table: &str, outcome: &'static str, duration: Duration) {
    counter!(
        "access_log_writes_total",
        "table" => table.to_string(),
        "outcome" => outcome,
    )
    .increment(1);

    histogram!(
        "access_log_write_duration_seconds",
        "table" => table.to_string(),
    )
    .record(duration.as_secs_f64());
}

/// Record DDL issued by reconciliation
pub fn record_schema_changes(table: &str, count: usize) {
    counter!(
        "access_log_schema_changes_total",
        "table" => table.to_string(),
    )
    .increment(count as u64);
}

/// Record a request excluded by the skip predicate
pub fn record_skipped(table: &str) {
    counter!(
        "access_log_skipped_total",
        "table" => table.to_string(),
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_metrics() {
        describe_metrics();

        record_write("logs", "ok", Duration::from_millis(3));
        record_write("logs", "error", Duration::from_millis(1));
        record_schema_changes("logs", 2);
        record_skipped("logs");

        // No recorder installed: calls must simply not panic
    }
}
