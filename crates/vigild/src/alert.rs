//! Filesystem alert channel and audit log.
//!
//! Denied attempts leave a PNG of the evidence frame plus one JSON line in
//! `alerts.jsonl`. Every attempt, granted or not, leaves one pixel-free line
//! in `audit.jsonl`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use vigil_core::{AlertChannel, AuditRecord, DeliveryError, Frame};

pub const ALERTS_FILE: &str = "alerts.jsonl";

/// One line of `alerts.jsonl`.
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct AlertRecord {
    pub id: uuid::Uuid,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    /// Evidence image file name, relative to the alert directory.
    pub evidence: String,
    /// SHA-256 of the evidence file as written.
    pub sha256: String,
}

/// Writes evidence images and alert records under one directory.
pub struct FsAlertChannel {
    dir: PathBuf,
}

impl FsAlertChannel {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Up to `limit` alert records, newest first. `0` means no limit.
    ///
    /// A missing `alerts.jsonl` is an empty history. Lines that fail to
    /// parse are skipped with a warning.
    pub fn recent(&self, limit: usize) -> std::io::Result<Vec<AlertRecord>> {
        let path = self.dir.join(ALERTS_FILE);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let take = if limit == 0 { usize::MAX } else { limit };
        Ok(contents
            .lines()
            .rev()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str::<AlertRecord>(line) {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping malformed alert line");
                    None
                }
            })
            .take(take)
            .collect())
    }
}

impl AlertChannel for FsAlertChannel {
    fn notify(
        &self,
        evidence: &Frame,
        reason: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<(), DeliveryError> {
        fs::create_dir_all(&self.dir)?;

        let id = uuid::Uuid::new_v4();
        let file_name = format!("alert_{}_{}.png", timestamp.format("%Y%m%d_%H%M%S"), id);
        let path = self.dir.join(&file_name);

        let image = image::RgbImage::from_raw(evidence.width, evidence.height, evidence.data.clone())
            .ok_or_else(|| {
                DeliveryError::Failed(format!(
                    "evidence frame {} has {} bytes for {}x{}",
                    evidence.seq,
                    evidence.data.len(),
                    evidence.width,
                    evidence.height
                ))
            })?;
        image
            .save(&path)
            .map_err(|e| DeliveryError::Failed(format!("{}: {e}", path.display())))?;

        let digest = format!("{:x}", Sha256::digest(fs::read(&path)?));

        let record = AlertRecord {
            id,
            reason: reason.to_string(),
            timestamp,
            evidence: file_name,
            sha256: digest,
        };
        append_json_line(&self.dir.join(ALERTS_FILE), &record)?;

        tracing::info!(alert = %id, reason, path = %path.display(), "alert recorded");
        Ok(())
    }
}

/// Append-only JSON-lines audit trail of attempt outcomes.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn append(&self, record: &AuditRecord) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        append_json_line(&self.path, record)
    }
}

fn append_json_line<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let mut line = serde_json::to_string(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    line.push('\n');
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::{LivenessResult, TerminalState};

    fn frame() -> Frame {
        Frame::new(7, 2, 1, vec![255, 0, 0, 0, 0, 255])
    }

    #[test]
    fn test_alert_writes_image_and_record() {
        let dir = tempfile::tempdir().unwrap();
        let channel = FsAlertChannel::new(dir.path().join("alerts"));

        channel
            .notify(&frame(), "unauthorized person", Utc::now())
            .unwrap();

        let log = fs::read_to_string(channel.dir().join(ALERTS_FILE)).unwrap();
        let record: AlertRecord = serde_json::from_str(log.lines().next().unwrap()).unwrap();
        assert_eq!(record.reason, "unauthorized person");

        let image_path = channel.dir().join(&record.evidence);
        let img = image::open(&image_path).unwrap().to_rgb8();
        assert_eq!(img.dimensions(), (2, 1));
        assert_eq!(img.get_pixel(0, 0).0, [255, 0, 0]);

        let digest = format!("{:x}", Sha256::digest(fs::read(&image_path).unwrap()));
        assert_eq!(record.sha256, digest);
    }

    #[test]
    fn test_alert_rejects_inconsistent_frame() {
        let dir = tempfile::tempdir().unwrap();
        let channel = FsAlertChannel::new(dir.path());
        let bad = Frame::new(1, 10, 10, vec![0; 3]);
        assert!(channel.notify(&bad, "x", Utc::now()).is_err());
        assert!(!dir.path().join(ALERTS_FILE).exists());
    }

    #[test]
    fn test_recent_alerts_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let channel = FsAlertChannel::new(dir.path());
        assert!(channel.recent(10).unwrap().is_empty());

        let earlier = Utc::now() - chrono::Duration::seconds(30);
        channel.notify(&frame(), "possible spoofing attempt", earlier).unwrap();
        channel.notify(&frame(), "unauthorized person", Utc::now()).unwrap();

        let all = channel.recent(10).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].reason, "unauthorized person");
        assert_eq!(all[1].reason, "possible spoofing attempt");
        assert!(all[0].timestamp > all[1].timestamp);
        assert!(dir.path().join(&all[1].evidence).exists());

        let newest = channel.recent(1).unwrap();
        assert_eq!(newest.len(), 1);
        assert_eq!(newest[0].id, all[0].id);
        assert_eq!(channel.recent(0).unwrap().len(), 2);
    }

    #[test]
    fn test_recent_skips_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let channel = FsAlertChannel::new(dir.path());
        channel.notify(&frame(), "unauthorized person", Utc::now()).unwrap();
        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.path().join(ALERTS_FILE))
            .unwrap();
        file.write_all(b"{not json\n").unwrap();

        let records = channel.recent(0).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].reason, "unauthorized person");
    }

    #[test]
    fn test_audit_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("nested").join("audit.jsonl"));

        let outcome = vigil_core::AuthorizationOutcome {
            attempt_id: uuid::Uuid::new_v4(),
            state: TerminalState::Authorized,
            authorized: true,
            identity: Some("alice".to_string()),
            reason: "authorized".to_string(),
            distance: Some(0.1),
            liveness: LivenessResult::default(),
            evidence_frame: None,
            timestamp: Utc::now(),
            alert_delivered: None,
            error: None,
        };
        log.append(&outcome.audit_record()).unwrap();
        log.append(&outcome.audit_record()).unwrap();

        let contents = fs::read_to_string(dir.path().join("nested").join("audit.jsonl")).unwrap();
        assert_eq!(contents.lines().count(), 2);
        let parsed: AuditRecord = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        assert_eq!(parsed.identity.as_deref(), Some("alice"));
    }
}
