use anyhow::{anyhow, Context, Result};
use rand::RngCore;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::{ChannelAdapter, ChannelKind, RenderedPayload};
use crate::GestureEvent;

/// Writes each alert as an RFC 5322 message into a spool directory for the
/// local MTA to pick up. Files appear atomically (write then rename).
pub struct EmailSpoolAdapter {
    name: String,
    spool_dir: PathBuf,
    from: String,
    recipients: Vec<String>,
}

impl EmailSpoolAdapter {
    pub fn new(name: &str, spool_dir: &Path, from: &str, recipients: Vec<String>) -> Result<Self> {
        fs::create_dir_all(spool_dir)
            .with_context(|| format!("failed to create email spool {}", spool_dir.display()))?;
        for addr in std::iter::once(from).chain(recipients.iter().map(String::as_str)) {
            if has_line_break(addr) || !addr.contains('@') {
                return Err(anyhow!("invalid email address '{}'", addr.escape_debug()));
            }
        }
        Ok(Self {
            name: name.to_string(),
            spool_dir: spool_dir.to_path_buf(),
            from: from.to_string(),
            recipients,
        })
    }

    pub fn spool_dir(&self) -> &Path {
        &self.spool_dir
    }

    fn render_message(&self, event: &GestureEvent, payload: &RenderedPayload, id: &str) -> String {
        let to = if self.recipients.is_empty() {
            "undisclosed-recipients:;".to_string()
        } else {
            self.recipients.join(", ")
        };
        let subject: String = payload
            .subject
            .chars()
            .map(|c| if c == '\r' || c == '\n' { ' ' } else { c })
            .collect();
        let mut msg = String::new();
        msg.push_str(&format!("From: {}\r\n", self.from));
        msg.push_str(&format!("To: {}\r\n", to));
        msg.push_str(&format!("Subject: {}\r\n", subject));
        msg.push_str(&format!("Date: {}\r\n", rfc5322_date(event.timestamp_ms())));
        msg.push_str(&format!("Message-ID: <{}@gesture-guard>\r\n", id));
        msg.push_str("MIME-Version: 1.0\r\n");
        msg.push_str("Content-Type: text/plain; charset=utf-8\r\n");
        msg.push_str(&format!("X-Gesture-Label: {}\r\n", event.label()));
        msg.push_str(&format!("X-Gesture-Session: {}\r\n", event.session_id()));
        msg.push_str("\r\n");
        for line in payload.body.lines() {
            msg.push_str(line);
            msg.push_str("\r\n");
        }
        msg
    }
}

impl ChannelAdapter for EmailSpoolAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Email
    }

    fn send(&self, event: &GestureEvent, payload: &RenderedPayload) -> Result<()> {
        let mut nonce = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut nonce);
        let id = format!(
            "{}-{}-{}",
            event.timestamp_ms(),
            event.track_id().as_u64(),
            hex::encode(nonce)
        );
        let message = self.render_message(event, payload, &id);

        let tmp_path = self.spool_dir.join(format!(".{}.tmp", id));
        let final_path = self.spool_dir.join(format!("{}.eml", id));
        let mut file = fs::File::create(&tmp_path)
            .with_context(|| format!("failed to create {}", tmp_path.display()))?;
        file.write_all(message.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp_path, &final_path)
            .with_context(|| format!("failed to publish {}", final_path.display()))?;
        log::debug!("[{}] spooled {}", self.name, final_path.display());
        Ok(())
    }
}

fn has_line_break(s: &str) -> bool {
    s.contains('\r') || s.contains('\n')
}

/// RFC 5322 date-time in UTC, e.g. "Tue, 14 Nov 2023 22:13:20 +0000".
fn rfc5322_date(ms: u64) -> String {
    const DAYS: [&str; 7] = ["Thu", "Fri", "Sat", "Sun", "Mon", "Tue", "Wed"];
    const MONTHS: [&str; 12] = [
        "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
    ];
    let secs = ms / 1000;
    let days = secs / 86_400;
    let rem = secs % 86_400;
    let (year, month, day) = civil_from_days(days as i64);
    format!(
        "{}, {:02} {} {} {:02}:{:02}:{:02} +0000",
        DAYS[(days % 7) as usize],
        day,
        MONTHS[(month - 1) as usize],
        year,
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60
    )
}

/// Days since 1970-01-01 to (year, month, day), proleptic Gregorian.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}
