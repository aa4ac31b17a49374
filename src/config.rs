//! 调度器配置

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::BrokerError;

/// 默认帧上限 1MiB
const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;
/// 默认 `sched_later` 延迟单位为秒
const DEFAULT_DELAY_UNIT_MS: u64 = 1000;
/// 默认写超时 5 秒
const DEFAULT_WRITE_TIMEOUT_MS: u64 = 5000;

/// 会话断开或分派失败时，对在途任务的处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisconnectPolicy {
    /// 重新入队，交给其他 drone
    #[default]
    Requeue,
    /// 直接标记为 failed
    Fail,
}

impl std::str::FromStr for DisconnectPolicy {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "requeue" => Ok(DisconnectPolicy::Requeue),
            "fail" => Ok(DisconnectPolicy::Fail),
            other => Err(BrokerError::Config(format!("unknown disconnect policy: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub disconnect_policy: DisconnectPolicy,
    /// 每个延迟单位对应的毫秒数
    pub delay_unit_ms: u64,
    pub max_frame_len: usize,
    /// 启动时从存储恢复未完成的任务
    pub recover_on_start: bool,
    /// TCP 写超时毫秒数，0 表示不设超时
    pub write_timeout_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            disconnect_policy: DisconnectPolicy::default(),
            delay_unit_ms: DEFAULT_DELAY_UNIT_MS,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            recover_on_start: true,
            write_timeout_ms: DEFAULT_WRITE_TIMEOUT_MS,
        }
    }
}

impl BrokerConfig {
    /// 从 JSON 文件加载，缺省字段取默认值
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, BrokerError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| BrokerError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, BrokerError> {
        serde_json::from_str(raw).map_err(|e| BrokerError::Config(e.to_string()))
    }

    /// 默认值叠加 `HIVE_*` 环境变量
    pub fn from_env() -> Result<Self, BrokerError> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, BrokerError> {
        if let Some(v) = lookup("HIVE_DISCONNECT_POLICY") {
            self.disconnect_policy = v.parse()?;
        }
        if let Some(v) = lookup("HIVE_DELAY_UNIT_MS") {
            self.delay_unit_ms = parse_env("HIVE_DELAY_UNIT_MS", &v)?;
        }
        if let Some(v) = lookup("HIVE_MAX_FRAME_LEN") {
            self.max_frame_len = parse_env("HIVE_MAX_FRAME_LEN", &v)?;
        }
        if let Some(v) = lookup("HIVE_RECOVER_ON_START") {
            self.recover_on_start = parse_env("HIVE_RECOVER_ON_START", &v)?;
        }
        if let Some(v) = lookup("HIVE_WRITE_TIMEOUT_MS") {
            self.write_timeout_ms = parse_env("HIVE_WRITE_TIMEOUT_MS", &v)?;
        }
        Ok(self)
    }

    /// 把 `sched_later` 的延迟参数换算为时长
    pub fn delay(&self, units: u64) -> Duration {
        Duration::from_millis(units.saturating_mul(self.delay_unit_ms))
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        (self.write_timeout_ms > 0).then(|| Duration::from_millis(self.write_timeout_ms))
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, BrokerError> {
    value
        .trim()
        .parse()
        .map_err(|_| BrokerError::Config(format!("invalid value for {}: {}", key, value)))
}
