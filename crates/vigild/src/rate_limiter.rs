use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Denied attempts tolerated inside one window.
const MAX_DENIALS: u32 = 5;
/// Window over which denials are counted.
const WINDOW: Duration = Duration::from_secs(60);
/// How long a caller stays locked out after reaching MAX_DENIALS.
const LOCKOUT: Duration = Duration::from_secs(300);

#[derive(Debug)]
struct CallerRecord {
    denials: u32,
    /// Attempts admitted but not yet settled.
    in_flight: u32,
    window_start: Instant,
    locked_until: Option<Instant>,
}

impl CallerRecord {
    fn fresh(now: Instant) -> Self {
        Self {
            denials: 0,
            in_flight: 0,
            window_start: now,
            locked_until: None,
        }
    }

    /// Start a new window, keeping attempts that are still running.
    fn reset(&mut self, now: Instant) {
        let in_flight = self.in_flight;
        *self = Self::fresh(now);
        self.in_flight = in_flight;
    }

    fn settle_one(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    fn is_idle(&self) -> bool {
        self.in_flight == 0 && self.denials == 0 && self.locked_until.is_none()
    }
}

/// Per-caller throttle for authentication attempts.
///
/// Only decided denials (liveness failed, no face, unknown person) count.
/// Capture errors, cancellations and timeouts never do, so a flaky camera
/// cannot lock anyone out. Attempts still running count against the same
/// budget, so concurrent calls cannot overshoot it.
#[derive(Debug, Default)]
pub struct RateLimiter {
    records: HashMap<String, CallerRecord>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit one attempt for `caller`, or `Err(message)` when locked out or
    /// when running attempts would exhaust the remaining denial budget.
    ///
    /// Every admitted attempt must be settled with exactly one of
    /// [`record_denial`](Self::record_denial),
    /// [`record_success`](Self::record_success) or
    /// [`record_abandoned`](Self::record_abandoned).
    pub fn begin_attempt(&mut self, caller: &str) -> Result<(), String> {
        self.begin_attempt_at(caller, Instant::now())
    }

    pub fn record_denial(&mut self, caller: &str) {
        self.record_denial_at(caller, Instant::now());
    }

    /// A granted attempt clears the caller's denial history.
    pub fn record_success(&mut self, caller: &str) {
        if let Some(record) = self.records.get_mut(caller) {
            record.settle_one();
            record.reset(Instant::now());
        }
        self.forget_if_idle(caller);
    }

    /// An attempt that ended without a decision (cancelled, capture failure,
    /// timeout). Frees its slot without counting a denial.
    pub fn record_abandoned(&mut self, caller: &str) {
        if let Some(record) = self.records.get_mut(caller) {
            record.settle_one();
        }
        self.forget_if_idle(caller);
    }

    fn forget_if_idle(&mut self, caller: &str) {
        if self.records.get(caller).is_some_and(CallerRecord::is_idle) {
            self.records.remove(caller);
        }
    }

    fn begin_attempt_at(&mut self, caller: &str, now: Instant) -> Result<(), String> {
        self.check_at(caller, now)?;
        let record = self
            .records
            .entry(caller.to_string())
            .or_insert_with(|| CallerRecord::fresh(now));

        if record.denials + record.in_flight >= MAX_DENIALS {
            tracing::warn!(
                caller,
                denials = record.denials,
                in_flight = record.in_flight,
                "attempt refused, too many in progress"
            );
            return Err(format!(
                "{} attempts already in progress; wait for them to finish",
                record.in_flight
            ));
        }
        record.in_flight += 1;
        Ok(())
    }

    /// `Err(message)` while `caller` is locked out.
    fn check_at(&mut self, caller: &str, now: Instant) -> Result<(), String> {
        let Some(record) = self.records.get_mut(caller) else {
            return Ok(());
        };

        match record.locked_until {
            Some(until) if now < until => {
                let remaining = until.duration_since(now).as_secs().max(1);
                Err(format!("too many denied attempts; try again in {remaining}s"))
            }
            Some(_) => {
                record.reset(now);
                Ok(())
            }
            None => {
                if now.duration_since(record.window_start) >= WINDOW {
                    record.reset(now);
                }
                Ok(())
            }
        }
    }

    fn record_denial_at(&mut self, caller: &str, now: Instant) {
        let record = self
            .records
            .entry(caller.to_string())
            .or_insert_with(|| CallerRecord::fresh(now));
        record.settle_one();

        if now.duration_since(record.window_start) >= WINDOW {
            record.reset(now);
        }

        record.denials += 1;
        if record.denials >= MAX_DENIALS {
            record.locked_until = Some(now + LOCKOUT);
            tracing::warn!(
                caller,
                denials = record.denials,
                lockout_secs = LOCKOUT.as_secs(),
                "caller locked out"
            );
        } else {
            tracing::debug!(caller, denials = record.denials, max = MAX_DENIALS, "attempt denied");
        }
    }
}
