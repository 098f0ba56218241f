use std::path::PathBuf;

use vigil_core::liveness::{
    LivenessConfig, DEFAULT_EAR_THRESHOLD, DEFAULT_FRAME_LIMIT, DEFAULT_HEAD_MOVEMENT_THRESHOLD,
    DEFAULT_REQUIRED_BLINKS,
};
use vigil_core::matcher::DEFAULT_DISTANCE_THRESHOLD;
use vigil_core::AuthConfig;

const DEFAULT_ENCODING_DIM: usize = 128;
const DEFAULT_ATTEMPT_TIMEOUT_SECS: u64 = 20;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Annotated capture directory backing the frame source and analyzer.
    pub capture_dir: PathBuf,
    /// Path to the SQLite identity database.
    pub db_path: PathBuf,
    /// Directory for evidence images, `alerts.jsonl` and `audit.jsonl`.
    pub alert_dir: PathBuf,
    /// Frames observed per liveness session.
    pub frame_limit: u32,
    /// Blink edges required to pass liveness.
    pub required_blinks: u32,
    /// Eye aspect ratio below which eyes count as closed.
    pub ear_threshold: f32,
    /// Whether liveness additionally requires head movement.
    pub head_movement_required: bool,
    /// Mean landmark displacement (pixels) counted as head movement.
    pub head_movement_threshold: f32,
    /// Maximum encoding distance for a positive match.
    pub distance_threshold: f64,
    /// Encoding length accepted by the identity store.
    pub encoding_dim: usize,
    /// Wall-clock cap per attempt; the attempt is cancelled on expiry.
    pub attempt_timeout_secs: u64,
    /// Frames discarded when the engine starts (exposure stabilization).
    pub warmup_frames: usize,
    /// Whether the daemon is running on the session bus (development mode).
    /// Caller UID checks are skipped on the session bus.
    pub session_bus: bool,
}

impl Config {
    /// Load configuration from `VIGIL_*` environment variables with defaults.
    ///
    /// Unparseable or out-of-range values are logged and replaced by their
    /// defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("vigil");

        let config = Self {
            capture_dir: env_path("VIGIL_CAPTURE_DIR").unwrap_or_else(|| data_dir.join("capture")),
            db_path: env_path("VIGIL_DB_PATH").unwrap_or_else(|| data_dir.join("identities.db")),
            alert_dir: env_path("VIGIL_ALERT_DIR").unwrap_or_else(|| data_dir.join("alerts")),
            frame_limit: env_parse("VIGIL_FRAME_LIMIT", DEFAULT_FRAME_LIMIT),
            required_blinks: env_parse("VIGIL_REQUIRED_BLINKS", DEFAULT_REQUIRED_BLINKS),
            ear_threshold: env_parse("VIGIL_EAR_THRESHOLD", DEFAULT_EAR_THRESHOLD),
            head_movement_required: env_flag("VIGIL_HEAD_MOVEMENT_REQUIRED", false),
            head_movement_threshold: env_parse(
                "VIGIL_HEAD_MOVEMENT_THRESHOLD",
                DEFAULT_HEAD_MOVEMENT_THRESHOLD,
            ),
            distance_threshold: env_parse("VIGIL_DISTANCE_THRESHOLD", DEFAULT_DISTANCE_THRESHOLD),
            encoding_dim: env_parse("VIGIL_ENCODING_DIM", DEFAULT_ENCODING_DIM),
            attempt_timeout_secs: env_parse(
                "VIGIL_ATTEMPT_TIMEOUT_SECS",
                DEFAULT_ATTEMPT_TIMEOUT_SECS,
            ),
            warmup_frames: env_parse("VIGIL_WARMUP_FRAMES", 0),
            session_bus: std::env::var("VIGIL_SESSION_BUS").is_ok(),
        };
        config.sanitized()
    }

    /// Replace values the decision engine cannot work with by their defaults.
    ///
    /// Counts must be at least one and thresholds must be finite and
    /// positive. A zero blink requirement would grant liveness to a photo.
    pub fn sanitized(mut self) -> Self {
        self.frame_limit = at_least_one("frame_limit", self.frame_limit, DEFAULT_FRAME_LIMIT);
        self.required_blinks =
            at_least_one("required_blinks", self.required_blinks, DEFAULT_REQUIRED_BLINKS);
        self.encoding_dim = at_least_one("encoding_dim", self.encoding_dim, DEFAULT_ENCODING_DIM);
        self.attempt_timeout_secs = at_least_one(
            "attempt_timeout_secs",
            self.attempt_timeout_secs,
            DEFAULT_ATTEMPT_TIMEOUT_SECS,
        );
        self.ear_threshold = positive_finite(
            "ear_threshold",
            self.ear_threshold.into(),
            DEFAULT_EAR_THRESHOLD.into(),
        ) as f32;
        self.head_movement_threshold = positive_finite(
            "head_movement_threshold",
            self.head_movement_threshold.into(),
            DEFAULT_HEAD_MOVEMENT_THRESHOLD.into(),
        ) as f32;
        self.distance_threshold = positive_finite(
            "distance_threshold",
            self.distance_threshold,
            DEFAULT_DISTANCE_THRESHOLD,
        );
        self
    }

    /// Decision tunables handed to the authenticator.
    pub fn auth_config(&self) -> AuthConfig {
        AuthConfig {
            liveness: LivenessConfig {
                frame_limit: self.frame_limit,
                required_blinks: self.required_blinks,
                ear_threshold: self.ear_threshold,
                require_head_movement: self.head_movement_required,
                head_movement_threshold: self.head_movement_threshold,
            },
            distance_threshold: self.distance_threshold,
        }
    }

    /// Path of the append-only audit log.
    pub fn audit_log_path(&self) -> PathBuf {
        self.alert_dir.join("audit.jsonl")
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key).ok().map(PathBuf::from)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    let Ok(raw) = std::env::var(key) else {
        return default;
    };
    match raw.trim().parse() {
        Ok(value) => value,
        Err(_) => {
            tracing::warn!(key, value = %raw, "unparseable setting, using default");
            default
        }
    }
}

fn at_least_one<T>(name: &str, value: T, default: T) -> T
where
    T: PartialOrd + From<u8> + std::fmt::Display,
{
    if value >= T::from(1) {
        return value;
    }
    tracing::warn!(setting = name, %value, %default, "setting must be at least 1, using default");
    default
}

fn positive_finite(name: &str, value: f64, default: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        return value;
    }
    tracing::warn!(setting = name, value, default, "setting must be finite and positive, using default");
    default
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key).map(|v| v != "0").unwrap_or(default)
}
