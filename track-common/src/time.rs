use time::format_description::well_known::Rfc3339;

pub trait TimeSource {
    // Return an ISO 8601 timestamp
    fn current_time(&self) -> String;

    /// Milliseconds since the Unix epoch, `None` when `current_time` is not RFC 3339.
    fn current_millis(&self) -> Option<u64> {
        let time = time::OffsetDateTime::parse(&self.current_time(), &Rfc3339).ok()?;
        u64::try_from(time.unix_timestamp_nanos() / 1_000_000).ok()
    }
}

#[derive(Clone, Default)]
pub struct SystemTime {}

impl TimeSource for SystemTime {
    fn current_time(&self) -> String {
        let time = time::OffsetDateTime::now_utc();

        time.format(&Rfc3339)
            .expect("failed to rfc3339 format timestamp")
    }
}

/// Always returns the same timestamp, for deterministic tests and replays.
#[derive(Clone)]
pub struct FixedTime {
    pub time: String,
}

impl TimeSource for FixedTime {
    fn current_time(&self) -> String {
        self.time.to_string()
    }
}
