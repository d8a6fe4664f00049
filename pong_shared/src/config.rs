//! Configuration system.
//!
//! Loads game configuration from JSON strings/files. Every field has a
//! default so partial configs are valid.

use std::path::Path;

use anyhow::{ensure, Context};
use serde::{Deserialize, Serialize};

/// How far a reader may project a snapshot forward in time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ExtrapolationLimit {
    /// Keep projecting from the last known velocity for as long as no
    /// snapshot arrives.
    #[default]
    Unbounded,
    /// Stop projecting once `max_secs` have elapsed since the last snapshot.
    Clamp { max_secs: f32 },
}

impl ExtrapolationLimit {
    /// Applies the limit to an elapsed time.
    pub fn apply(self, elapsed: f32) -> f32 {
        match self {
            ExtrapolationLimit::Unbounded => elapsed,
            ExtrapolationLimit::Clamp { max_secs } => elapsed.min(max_secs),
        }
    }
}

/// Reader tunables for one kind of networked body.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Share of the elapsed time used to project the target forward, in $[0,1]$.
    pub delay_compensation: f32,
    /// Predicted error above which the body snaps to the snapshot.
    pub teleport_threshold: f32,
    /// Position blend rate (per second) at zero distance.
    pub base_blend_rate: f32,
    /// Additional position blend rate per unit of distance.
    pub distance_blend_gain: f32,
    /// Velocity blend rate (per second).
    pub velocity_smoothing: f32,
    /// Velocity is only blended when the target speed exceeds this.
    pub velocity_blend_min_speed: f32,
    /// Errors at or below this distance are left alone.
    pub dead_zone: f32,
    /// Rotation slerp rate (per second).
    pub rotation_smoothing: f32,
    pub extrapolation_limit: ExtrapolationLimit,
    /// Shift the target by `velocity * transit lag` when a snapshot is accepted.
    pub project_transit_lag: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::ball()
    }
}

impl SyncConfig {
    /// Profile for the fast, bouncing ball.
    pub fn ball() -> Self {
        Self {
            delay_compensation: 0.5,
            teleport_threshold: 5.0,
            base_blend_rate: 5.0,
            distance_blend_gain: 2.0,
            velocity_smoothing: 3.0,
            velocity_blend_min_speed: 0.0,
            dead_zone: 0.0,
            rotation_smoothing: 8.0,
            extrapolation_limit: ExtrapolationLimit::Unbounded,
            project_transit_lag: false,
        }
    }

    /// Profile for player avatars.
    pub fn avatar() -> Self {
        Self {
            delay_compensation: 0.0,
            teleport_threshold: 5.0,
            base_blend_rate: 10.0,
            distance_blend_gain: 0.0,
            velocity_smoothing: 10.0,
            velocity_blend_min_speed: 0.0,
            dead_zone: 0.1,
            rotation_smoothing: 8.0,
            extrapolation_limit: ExtrapolationLimit::Clamp { max_secs: 1.0 },
            project_transit_lag: true,
        }
    }

    /// Rejects values the reader cannot work with.
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            (0.0..=1.0).contains(&self.delay_compensation),
            "delay_compensation must be in [0, 1], got {}",
            self.delay_compensation
        );
        ensure!(
            self.teleport_threshold > 0.0,
            "teleport_threshold must be positive, got {}",
            self.teleport_threshold
        );
        for (name, v) in [
            ("base_blend_rate", self.base_blend_rate),
            ("distance_blend_gain", self.distance_blend_gain),
            ("velocity_smoothing", self.velocity_smoothing),
            ("velocity_blend_min_speed", self.velocity_blend_min_speed),
            ("dead_zone", self.dead_zone),
            ("rotation_smoothing", self.rotation_smoothing),
        ] {
            ensure!(v >= 0.0, "{name} must not be negative, got {v}");
        }
        ensure!(
            self.dead_zone < self.teleport_threshold,
            "dead_zone ({}) must be below teleport_threshold ({})",
            self.dead_zone,
            self.teleport_threshold
        );
        if let ExtrapolationLimit::Clamp { max_secs } = self.extrapolation_limit {
            ensure!(max_secs >= 0.0, "extrapolation max_secs must not be negative");
        }
        Ok(())
    }
}

/// Root configuration shared by client/server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameConfig {
    /// Server listen address, e.g. `127.0.0.1:40000`.
    #[serde(default = "default_server_addr")]
    pub server_addr: String,
    /// Fixed physics tick rate.
    #[serde(default = "default_tick_hz")]
    pub tick_hz: u32,
    /// Snapshot send rate for owned bodies.
    #[serde(default = "default_snapshot_hz")]
    pub snapshot_hz: u32,
    /// Player name (client only).
    #[serde(default = "default_player_name")]
    pub player_name: String,
    #[serde(default = "SyncConfig::ball")]
    pub ball: SyncConfig,
    /// Fields missing from a partial `avatar` object keep the avatar profile.
    #[serde(default = "SyncConfig::avatar", deserialize_with = "avatar_profile")]
    pub avatar: SyncConfig,
}

/// Overlays the given fields onto [`SyncConfig::avatar`]. The plain
/// `SyncConfig` deserializer would fill the gaps from the ball profile.
fn avatar_profile<'de, D>(deserializer: D) -> Result<SyncConfig, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    let fields = serde_json::Map::<String, serde_json::Value>::deserialize(deserializer)?;
    let mut merged = serde_json::to_value(SyncConfig::avatar()).map_err(D::Error::custom)?;
    if let serde_json::Value::Object(base) = &mut merged {
        base.extend(fields);
    }
    serde_json::from_value(merged).map_err(D::Error::custom)
}

fn default_server_addr() -> String {
    "127.0.0.1:40000".to_string()
}

fn default_tick_hz() -> u32 {
    50
}

fn default_snapshot_hz() -> u32 {
    20
}

fn default_player_name() -> String {
    "Player".to_string()
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            server_addr: default_server_addr(),
            tick_hz: default_tick_hz(),
            snapshot_hz: default_snapshot_hz(),
            player_name: default_player_name(),
            ball: SyncConfig::ball(),
            avatar: SyncConfig::avatar(),
        }
    }
}

impl GameConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Reads, parses and validates a JSON config file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let cfg = Self::from_json_str(&text)
            .with_context(|| format!("parse config {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.tick_hz > 0, "tick_hz must be positive");
        ensure!(self.snapshot_hz > 0, "snapshot_hz must be positive");
        ensure!(
            self.snapshot_hz <= self.tick_hz,
            "snapshot_hz ({}) must not exceed tick_hz ({})",
            self.snapshot_hz,
            self.tick_hz
        );
        self.ball.validate().context("ball sync config")?;
        self.avatar.validate().context("avatar sync config")?;
        Ok(())
    }

    /// Fixed physics step in seconds.
    pub fn tick_dt(&self) -> f32 {
        1.0 / self.tick_hz as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        GameConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_json_uses_defaults() {
        let cfg = GameConfig::from_json_str(
            r#"{ "tick_hz": 60, "ball": { "teleport_threshold": 3.0 } }"#,
        )
        .unwrap();
        assert_eq!(cfg.tick_hz, 60);
        assert_eq!(cfg.snapshot_hz, 20);
        assert_eq!(cfg.ball.teleport_threshold, 3.0);
        assert_eq!(cfg.ball.delay_compensation, 0.5);
        assert_eq!(cfg.avatar, SyncConfig::avatar());
    }

    #[test]
    fn partial_avatar_keeps_avatar_profile() {
        let cfg = GameConfig::from_json_str(r#"{ "avatar": { "dead_zone": 0.2 } }"#).unwrap();
        assert_eq!(cfg.avatar.dead_zone, 0.2);
        assert_eq!(cfg.avatar.delay_compensation, 0.0);
        assert!(cfg.avatar.project_transit_lag);
        assert_eq!(
            cfg.avatar.extrapolation_limit,
            ExtrapolationLimit::Clamp { max_secs: 1.0 }
        );
        assert_eq!(cfg.ball, SyncConfig::ball());
        cfg.validate().unwrap();

        let err = GameConfig::from_json_str(r#"{ "avatar": { "dead_zone": "wide" } }"#);
        assert!(err.is_err());
    }

    #[test]
    fn extrapolation_limit_json() {
        let cfg = GameConfig::from_json_str(
            r#"{ "ball": { "extrapolation_limit": { "mode": "clamp", "max_secs": 1.0 } } }"#,
        )
        .unwrap();
        assert_eq!(
            cfg.ball.extrapolation_limit,
            ExtrapolationLimit::Clamp { max_secs: 1.0 }
        );
        assert_eq!(cfg.ball.extrapolation_limit.apply(3.0), 1.0);
        assert_eq!(ExtrapolationLimit::Unbounded.apply(3.0), 3.0);
    }

    #[test]
    fn rejects_out_of_range_compensation() {
        let cfg = SyncConfig {
            delay_compensation: 1.5,
            ..SyncConfig::ball()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_snapshot_rate_above_tick_rate() {
        let cfg = GameConfig {
            tick_hz: 20,
            snapshot_hz: 30,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
