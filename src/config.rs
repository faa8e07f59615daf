use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::dispatch::Priority;
use crate::transport::ChannelKind;
use crate::GestureLabel;

// Placeholders until thresholds are tuned against recorded sessions.
const DEFAULT_DB_PATH: &str = "gesture_guard.db";
const DEFAULT_IOU_THRESHOLD: f32 = 0.3;
const DEFAULT_MAX_CENTROID_DISTANCE: f32 = 80.0;
const DEFAULT_STALENESS_MS: u64 = 500;
const DEFAULT_HISTORY_LEN: usize = 30;
const DEFAULT_WINDOW: usize = 15;
const DEFAULT_MIN_CONSECUTIVE: usize = 5;
const DEFAULT_MIN_FRAME_CONFIDENCE: f32 = 0.5;
const DEFAULT_EMIT_THRESHOLD: f32 = 0.7;
const DEFAULT_COOLDOWN_MS: u64 = 3_000;
const DEFAULT_RETRY_LIMIT: u32 = 3;
const DEFAULT_BACKOFF_BASE_MS: u64 = 500;
const DEFAULT_MAX_BACKOFF_MS: u64 = 10_000;
const DEFAULT_CALL_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 2_000;
const DEFAULT_TICK_MS: u64 = 50;
const DEFAULT_QUEUE_WARN_DEPTH: usize = 256;
const DEFAULT_ESCALATE_ABOVE: f32 = 0.9;
const DEFAULT_CHANNEL_CAPACITY: f64 = 5.0;
const DEFAULT_CHANNEL_REFILL_PER_SEC: f64 = 0.2;
const DEFAULT_SOUND_VOLUME: u8 = 50;
const DEFAULT_MQTT_TOPIC_PREFIX: &str = "gesture_guard";
const DEFAULT_MQTT_CLIENT_ID: &str = "gestured";
const DEFAULT_EMAIL_FROM: &str = "gesture-guard@localhost";

#[derive(Debug, Deserialize, Default)]
struct ConfigFile {
    tracker: Option<TrackerConfigFile>,
    stabilizer: Option<StabilizerConfigFile>,
    dispatch: Option<DispatchConfigFile>,
    log: Option<LogConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct TrackerConfigFile {
    iou_threshold: Option<f32>,
    max_centroid_distance: Option<f32>,
    staleness_ms: Option<u64>,
    history_len: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct StabilizerConfigFile {
    window: Option<usize>,
    min_consecutive: Option<usize>,
    min_frame_confidence: Option<f32>,
    emit_threshold: Option<f32>,
    cooldown_ms: Option<u64>,
    label_cooldowns_ms: Option<BTreeMap<String, u64>>,
}

#[derive(Debug, Deserialize, Default)]
struct DispatchConfigFile {
    retry_limit: Option<u32>,
    backoff_base_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
    call_timeout_ms: Option<u64>,
    shutdown_grace_ms: Option<u64>,
    tick_ms: Option<u64>,
    queue_warn_depth: Option<usize>,
    priorities: Option<PriorityConfigFile>,
    channels: Option<Vec<ChannelConfigFile>>,
}

#[derive(Debug, Deserialize, Default)]
struct PriorityConfigFile {
    default: Option<Priority>,
    labels: Option<BTreeMap<String, Priority>>,
    escalate_above: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct ChannelConfigFile {
    name: Option<String>,
    kind: ChannelKind,
    capacity: Option<f64>,
    refill_per_sec: Option<f64>,
    min_priority: Option<Priority>,
    volume: Option<u8>,
    url: Option<String>,
    spool_dir: Option<PathBuf>,
    from: Option<String>,
    recipients: Option<Vec<String>>,
    broker: Option<String>,
    topic_prefix: Option<String>,
    client_id: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct LogConfigFile {
    db_path: Option<String>,
    retention_days: Option<u64>,
}

/// Complete, validated configuration. Built once at startup and handed to
/// each component's constructor.
#[derive(Debug, Clone)]
pub struct GestureGuardConfig {
    pub tracker: TrackerSettings,
    pub stabilizer: StabilizerSettings,
    pub dispatch: DispatchSettings,
    pub log: LogSettings,
}

#[derive(Debug, Clone)]
pub struct TrackerSettings {
    /// Minimum IoU for a detection to continue a track.
    pub iou_threshold: f32,
    /// Alternative match criterion for fast-moving hands whose boxes no
    /// longer overlap enough.
    pub max_centroid_distance: f32,
    /// Unmatched longer than this and the track goes stale.
    pub staleness: Duration,
    /// Sliding history cap per track.
    pub history_len: usize,
}

#[derive(Debug, Clone)]
pub struct StabilizerSettings {
    pub window: usize,
    pub min_consecutive: usize,
    /// Frames below this confidence are noise.
    pub min_frame_confidence: f32,
    pub emit_threshold: f32,
    pub cooldown: Duration,
    pub label_cooldowns: BTreeMap<GestureLabel, Duration>,
}

impl StabilizerSettings {
    pub fn cooldown_for(&self, label: GestureLabel) -> Duration {
        self.label_cooldowns
            .get(&label)
            .copied()
            .unwrap_or(self.cooldown)
    }
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub retry_limit: u32,
    pub backoff_base: Duration,
    pub max_backoff: Duration,
    pub call_timeout: Duration,
    pub shutdown_grace: Duration,
    /// Lane re-check interval while jobs wait for tokens or backoff.
    pub tick: Duration,
    pub queue_warn_depth: usize,
    pub priorities: PrioritySettings,
    pub channels: Vec<ChannelSettings>,
}

#[derive(Debug, Clone)]
pub struct PrioritySettings {
    pub default: Priority,
    pub labels: BTreeMap<GestureLabel, Priority>,
    /// Confidence at or above which the tier is raised by one.
    pub escalate_above: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct ChannelSettings {
    pub name: String,
    pub capacity: f64,
    pub refill_per_sec: f64,
    pub min_priority: Priority,
    pub target: ChannelTarget,
}

impl ChannelSettings {
    pub fn kind(&self) -> ChannelKind {
        self.target.kind()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelTarget {
    Sound {
        volume: u8,
    },
    Email {
        spool_dir: PathBuf,
        from: String,
        recipients: Vec<String>,
    },
    Push {
        url: String,
    },
    Mqtt {
        broker: String,
        topic_prefix: String,
        client_id: String,
    },
}

impl ChannelTarget {
    pub fn kind(&self) -> ChannelKind {
        match self {
            ChannelTarget::Sound { .. } => ChannelKind::Sound,
            ChannelTarget::Email { .. } => ChannelKind::Email,
            ChannelTarget::Push { .. } => ChannelKind::Push,
            ChannelTarget::Mqtt { .. } => ChannelKind::Mqtt,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogSettings {
    pub db_path: String,
    pub retention: Option<Duration>,
}

/// Retention window for a number of days; errors instead of overflowing.
pub fn retention_from_days(days: u64) -> Result<Duration> {
    days.checked_mul(24 * 60 * 60)
        .map(Duration::from_secs)
        .ok_or_else(|| anyhow!("retention of {} days is out of range", days))
}

impl Default for GestureGuardConfig {
    fn default() -> Self {
        // Defaults always validate; from_file on an empty file cannot fail.
        match Self::from_file(ConfigFile::default()) {
            Ok(cfg) => cfg,
            Err(e) => unreachable!("default configuration is invalid: {}", e),
        }
    }
}

impl GestureGuardConfig {
    /// Load from `GESTURE_CONFIG` (if set), apply environment overrides,
    /// then validate. Any problem is fatal.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("GESTURE_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load a config file without consulting the environment.
    pub fn from_path(path: &Path) -> Result<Self> {
        let cfg = Self::from_file(read_config_file(path)?)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ConfigFile) -> Result<Self> {
        let tracker_file = file.tracker.unwrap_or_default();
        let tracker = TrackerSettings {
            iou_threshold: tracker_file.iou_threshold.unwrap_or(DEFAULT_IOU_THRESHOLD),
            max_centroid_distance: tracker_file
                .max_centroid_distance
                .unwrap_or(DEFAULT_MAX_CENTROID_DISTANCE),
            staleness: Duration::from_millis(
                tracker_file.staleness_ms.unwrap_or(DEFAULT_STALENESS_MS),
            ),
            history_len: tracker_file.history_len.unwrap_or(DEFAULT_HISTORY_LEN),
        };

        let stabilizer_file = file.stabilizer.unwrap_or_default();
        let label_cooldowns = stabilizer_file
            .label_cooldowns_ms
            .unwrap_or_default()
            .into_iter()
            .map(|(label, ms)| Ok((label.parse::<GestureLabel>()?, Duration::from_millis(ms))))
            .collect::<Result<BTreeMap<_, _>>>()?;
        let stabilizer = StabilizerSettings {
            window: stabilizer_file.window.unwrap_or(DEFAULT_WINDOW),
            min_consecutive: stabilizer_file
                .min_consecutive
                .unwrap_or(DEFAULT_MIN_CONSECUTIVE),
            min_frame_confidence: stabilizer_file
                .min_frame_confidence
                .unwrap_or(DEFAULT_MIN_FRAME_CONFIDENCE),
            emit_threshold: stabilizer_file
                .emit_threshold
                .unwrap_or(DEFAULT_EMIT_THRESHOLD),
            cooldown: Duration::from_millis(
                stabilizer_file.cooldown_ms.unwrap_or(DEFAULT_COOLDOWN_MS),
            ),
            label_cooldowns,
        };

        let dispatch_file = file.dispatch.unwrap_or_default();
        let priority_file = dispatch_file.priorities.unwrap_or_default();
        let priority_labels = priority_file
            .labels
            .unwrap_or_default()
            .into_iter()
            .map(|(label, tier)| Ok((label.parse::<GestureLabel>()?, tier)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        let priorities = PrioritySettings {
            default: priority_file.default.unwrap_or(Priority::Info),
            labels: priority_labels,
            escalate_above: priority_file
                .escalate_above
                .or(Some(DEFAULT_ESCALATE_ABOVE)),
        };
        let channels = match dispatch_file.channels {
            Some(channels) => channels
                .into_iter()
                .map(channel_from_file)
                .collect::<Result<Vec<_>>>()?,
            None => vec![default_sound_channel()],
        };
        let dispatch = DispatchSettings {
            retry_limit: dispatch_file.retry_limit.unwrap_or(DEFAULT_RETRY_LIMIT),
            backoff_base: Duration::from_millis(
                dispatch_file
                    .backoff_base_ms
                    .unwrap_or(DEFAULT_BACKOFF_BASE_MS),
            ),
            max_backoff: Duration::from_millis(
                dispatch_file.max_backoff_ms.unwrap_or(DEFAULT_MAX_BACKOFF_MS),
            ),
            call_timeout: Duration::from_millis(
                dispatch_file
                    .call_timeout_ms
                    .unwrap_or(DEFAULT_CALL_TIMEOUT_MS),
            ),
            shutdown_grace: Duration::from_millis(
                dispatch_file
                    .shutdown_grace_ms
                    .unwrap_or(DEFAULT_SHUTDOWN_GRACE_MS),
            ),
            tick: Duration::from_millis(dispatch_file.tick_ms.unwrap_or(DEFAULT_TICK_MS)),
            queue_warn_depth: dispatch_file
                .queue_warn_depth
                .unwrap_or(DEFAULT_QUEUE_WARN_DEPTH),
            priorities,
            channels,
        };

        let log_file = file.log.unwrap_or_default();
        let log = LogSettings {
            db_path: log_file
                .db_path
                .unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            retention: log_file
                .retention_days
                .map(retention_from_days)
                .transpose()?,
        };

        Ok(Self {
            tracker,
            stabilizer,
            dispatch,
            log,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("GESTURE_DB_PATH") {
            if !path.trim().is_empty() {
                self.log.db_path = path;
            }
        }
        if let Ok(raw) = std::env::var("GESTURE_IOU_THRESHOLD") {
            self.tracker.iou_threshold = raw
                .trim()
                .parse()
                .map_err(|_| anyhow!("GESTURE_IOU_THRESHOLD must be a number"))?;
        }
        if let Ok(raw) = std::env::var("GESTURE_STALENESS_MS") {
            let ms: u64 = raw.trim().parse().map_err(|_| {
                anyhow!("GESTURE_STALENESS_MS must be an integer number of milliseconds")
            })?;
            self.tracker.staleness = Duration::from_millis(ms);
        }
        if let Ok(raw) = std::env::var("GESTURE_EMIT_THRESHOLD") {
            self.stabilizer.emit_threshold = raw
                .trim()
                .parse()
                .map_err(|_| anyhow!("GESTURE_EMIT_THRESHOLD must be a number"))?;
        }
        if let Ok(raw) = std::env::var("GESTURE_COOLDOWN_MS") {
            let ms: u64 = raw.trim().parse().map_err(|_| {
                anyhow!("GESTURE_COOLDOWN_MS must be an integer number of milliseconds")
            })?;
            self.stabilizer.cooldown = Duration::from_millis(ms);
        }
        if let Ok(url) = std::env::var("GESTURE_PUSH_URL") {
            if !url.trim().is_empty() {
                self.override_or_add_channel(ChannelTarget::Push { url });
            }
        }
        if let Ok(dir) = std::env::var("GESTURE_EMAIL_SPOOL") {
            if !dir.trim().is_empty() {
                self.override_or_add_channel(ChannelTarget::Email {
                    spool_dir: PathBuf::from(dir),
                    from: DEFAULT_EMAIL_FROM.to_string(),
                    recipients: Vec::new(),
                });
            }
        }
        Ok(())
    }

    /// Point every channel of the target's kind at the new destination, or
    /// add one channel with default limits if none exists.
    fn override_or_add_channel(&mut self, target: ChannelTarget) {
        let kind = target.kind();
        let mut found = false;
        for channel in self
            .dispatch
            .channels
            .iter_mut()
            .filter(|c| c.kind() == kind)
        {
            found = true;
            match (&mut channel.target, &target) {
                (ChannelTarget::Push { url }, ChannelTarget::Push { url: new_url }) => {
                    *url = new_url.clone();
                }
                (
                    ChannelTarget::Email { spool_dir, .. },
                    ChannelTarget::Email {
                        spool_dir: new_dir, ..
                    },
                ) => {
                    *spool_dir = new_dir.clone();
                }
                _ => {}
            }
        }
        if !found {
            self.dispatch.channels.push(ChannelSettings {
                name: kind.as_str().to_string(),
                capacity: DEFAULT_CHANNEL_CAPACITY,
                refill_per_sec: DEFAULT_CHANNEL_REFILL_PER_SEC,
                min_priority: default_min_priority(kind),
                target,
            });
        }
    }

    /// Reject anything that would make the pipeline degrade silently.
    pub fn validate(&self) -> Result<()> {
        let t = &self.tracker;
        check_unit_interval("tracker.iou_threshold", t.iou_threshold)?;
        if !t.max_centroid_distance.is_finite() || t.max_centroid_distance < 0.0 {
            return Err(anyhow!("tracker.max_centroid_distance must be >= 0"));
        }
        if t.staleness.is_zero() {
            return Err(anyhow!("tracker.staleness_ms must be greater than zero"));
        }
        if t.history_len == 0 {
            return Err(anyhow!("tracker.history_len must be greater than zero"));
        }

        let s = &self.stabilizer;
        if s.window == 0 {
            return Err(anyhow!("stabilizer.window must be greater than zero"));
        }
        if s.window > t.history_len {
            return Err(anyhow!(
                "stabilizer.window ({}) exceeds tracker.history_len ({})",
                s.window,
                t.history_len
            ));
        }
        if s.min_consecutive == 0 || s.min_consecutive > s.window {
            return Err(anyhow!(
                "stabilizer.min_consecutive must be in 1..={} (got {})",
                s.window,
                s.min_consecutive
            ));
        }
        if !s.min_frame_confidence.is_finite() || !(0.0..=1.0).contains(&s.min_frame_confidence)
        {
            return Err(anyhow!("stabilizer.min_frame_confidence must be in 0..=1"));
        }
        check_unit_interval("stabilizer.emit_threshold", s.emit_threshold)?;
        if s.label_cooldowns.contains_key(&GestureLabel::Unknown) {
            return Err(anyhow!("stabilizer.label_cooldowns_ms cannot configure Unknown"));
        }

        let d = &self.dispatch;
        if d.backoff_base.is_zero() {
            return Err(anyhow!("dispatch.backoff_base_ms must be greater than zero"));
        }
        if d.max_backoff < d.backoff_base {
            return Err(anyhow!("dispatch.max_backoff_ms must be >= backoff_base_ms"));
        }
        if d.call_timeout.is_zero() {
            return Err(anyhow!("dispatch.call_timeout_ms must be greater than zero"));
        }
        if d.tick.is_zero() {
            return Err(anyhow!("dispatch.tick_ms must be greater than zero"));
        }
        if let Some(level) = d.priorities.escalate_above {
            check_unit_interval("dispatch.priorities.escalate_above", level)?;
        }

        let mut names = HashSet::new();
        for channel in &d.channels {
            if channel.name.trim().is_empty() {
                return Err(anyhow!("dispatch channel name must not be empty"));
            }
            if !names.insert(channel.name.as_str()) {
                return Err(anyhow!("duplicate dispatch channel '{}'", channel.name));
            }
            if !channel.capacity.is_finite() || channel.capacity < 1.0 {
                return Err(anyhow!(
                    "channel '{}': capacity must be a finite number >= 1",
                    channel.name
                ));
            }
            if !channel.refill_per_sec.is_finite() || channel.refill_per_sec < 0.0 {
                return Err(anyhow!(
                    "channel '{}': refill_per_sec must be a finite number >= 0",
                    channel.name
                ));
            }
            match &channel.target {
                ChannelTarget::Sound { volume } if *volume > 100 => {
                    return Err(anyhow!("channel '{}': volume must be 0..=100", channel.name));
                }
                ChannelTarget::Push { url } if !url.starts_with("http") => {
                    return Err(anyhow!(
                        "channel '{}': push url must be http(s) (got '{}')",
                        channel.name,
                        url
                    ));
                }
                ChannelTarget::Email { spool_dir, .. } if spool_dir.as_os_str().is_empty() => {
                    return Err(anyhow!("channel '{}': email spool_dir is required", channel.name));
                }
                ChannelTarget::Mqtt { broker, .. } if broker.trim().is_empty() => {
                    return Err(anyhow!("channel '{}': mqtt broker is required", channel.name));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn channel_from_file(file: ChannelConfigFile) -> Result<ChannelSettings> {
    let kind = file.kind;
    let target = match kind {
        ChannelKind::Sound => ChannelTarget::Sound {
            volume: file.volume.unwrap_or(DEFAULT_SOUND_VOLUME),
        },
        ChannelKind::Email => ChannelTarget::Email {
            spool_dir: file.spool_dir.unwrap_or_default(),
            from: file.from.unwrap_or_else(|| DEFAULT_EMAIL_FROM.to_string()),
            recipients: file.recipients.unwrap_or_default(),
        },
        ChannelKind::Push => ChannelTarget::Push {
            url: file.url.unwrap_or_default(),
        },
        ChannelKind::Mqtt => ChannelTarget::Mqtt {
            broker: file.broker.unwrap_or_default(),
            topic_prefix: file
                .topic_prefix
                .unwrap_or_else(|| DEFAULT_MQTT_TOPIC_PREFIX.to_string()),
            client_id: file
                .client_id
                .unwrap_or_else(|| DEFAULT_MQTT_CLIENT_ID.to_string()),
        },
    };
    Ok(ChannelSettings {
        name: file.name.unwrap_or_else(|| kind.as_str().to_string()),
        capacity: file.capacity.unwrap_or(DEFAULT_CHANNEL_CAPACITY),
        refill_per_sec: file
            .refill_per_sec
            .unwrap_or(DEFAULT_CHANNEL_REFILL_PER_SEC),
        min_priority: file.min_priority.unwrap_or_else(|| default_min_priority(kind)),
        target,
    })
}

fn default_sound_channel() -> ChannelSettings {
    ChannelSettings {
        name: ChannelKind::Sound.as_str().to_string(),
        capacity: DEFAULT_CHANNEL_CAPACITY,
        refill_per_sec: DEFAULT_CHANNEL_REFILL_PER_SEC,
        min_priority: Priority::Info,
        target: ChannelTarget::Sound {
            volume: DEFAULT_SOUND_VOLUME,
        },
    }
}

/// Email only carries the important alerts unless configured otherwise.
fn default_min_priority(kind: ChannelKind) -> Priority {
    match kind {
        ChannelKind::Email => Priority::Warning,
        _ => Priority::Info,
    }
}

fn check_unit_interval(name: &str, value: f32) -> Result<()> {
    if !value.is_finite() || value <= 0.0 || value > 1.0 {
        return Err(anyhow!("{} must be in (0, 1] (got {})", name, value));
    }
    Ok(())
}

fn read_config_file(path: &Path) -> Result<ConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = GestureGuardConfig::default();
        cfg.validate().expect("defaults must validate");
        assert_eq!(cfg.dispatch.channels.len(), 1);
        assert_eq!(cfg.dispatch.channels[0].kind(), ChannelKind::Sound);
        assert_eq!(cfg.stabilizer.min_consecutive, DEFAULT_MIN_CONSECUTIVE);
    }

    #[test]
    fn min_consecutive_larger_than_window_is_fatal() {
        let mut cfg = GestureGuardConfig::default();
        cfg.stabilizer.min_consecutive = cfg.stabilizer.window + 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn window_larger_than_history_is_fatal() {
        let mut cfg = GestureGuardConfig::default();
        cfg.stabilizer.window = cfg.tracker.history_len + 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn out_of_range_thresholds_are_fatal() {
        let mut cfg = GestureGuardConfig::default();
        cfg.tracker.iou_threshold = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = GestureGuardConfig::default();
        cfg.stabilizer.emit_threshold = 1.5;
        assert!(cfg.validate().is_err());

        let mut cfg = GestureGuardConfig::default();
        cfg.stabilizer.emit_threshold = f32::NAN;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn duplicate_channel_names_are_fatal() {
        let mut cfg = GestureGuardConfig::default();
        let dup = cfg.dispatch.channels[0].clone();
        cfg.dispatch.channels.push(dup);
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn channel_without_destination_is_fatal() {
        let file: ConfigFile = serde_json::from_str(
            r#"{"dispatch": {"channels": [{"kind": "push", "capacity": 3}]}}"#,
        )
        .unwrap();
        let cfg = GestureGuardConfig::from_file(file).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_capacity_bucket_is_fatal() {
        let mut cfg = GestureGuardConfig::default();
        cfg.dispatch.channels[0].capacity = 0.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn retention_days_overflow_is_an_error() {
        assert_eq!(
            retention_from_days(2).unwrap(),
            Duration::from_secs(2 * 86_400)
        );
        assert!(retention_from_days(u64::MAX / 1_000).is_err());
        let file: ConfigFile =
            serde_json::from_str(&format!(r#"{{"log": {{"retention_days": {}}}}}"#, u64::MAX))
                .unwrap();
        assert!(GestureGuardConfig::from_file(file).is_err());
    }

    #[test]
    fn per_label_cooldown_overrides_default() {
        let file: ConfigFile = serde_json::from_str(
            r#"{"stabilizer": {"cooldown_ms": 1000, "label_cooldowns_ms": {"Fist": 250}}}"#,
        )
        .unwrap();
        let cfg = GestureGuardConfig::from_file(file).unwrap();
        assert_eq!(
            cfg.stabilizer.cooldown_for(GestureLabel::Fist),
            Duration::from_millis(250)
        );
        assert_eq!(
            cfg.stabilizer.cooldown_for(GestureLabel::Peace),
            Duration::from_millis(1000)
        );
    }

    #[test]
    fn unknown_label_in_config_is_rejected() {
        let file: ConfigFile =
            serde_json::from_str(r#"{"stabilizer": {"label_cooldowns_ms": {"Wave": 250}}}"#)
                .unwrap();
        assert!(GestureGuardConfig::from_file(file).is_err());
    }

    #[test]
    fn email_channel_defaults_to_warning_floor() {
        let file: ConfigFile = serde_json::from_str(
            r#"{"dispatch": {"channels": [{"kind": "email", "spool_dir": "/tmp/spool"}]}}"#,
        )
        .unwrap();
        let cfg = GestureGuardConfig::from_file(file).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.dispatch.channels[0].min_priority, Priority::Warning);
        assert_eq!(cfg.dispatch.channels[0].name, "email");
    }
}
