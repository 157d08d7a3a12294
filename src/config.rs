//! Debug and tuning knobs read from `NEO_*` environment variables.
//!
//! The settings object is created once per [`ExecutionEnvironment`](crate::context::ExecutionEnvironment)
//! and handed to every component that needs it.

use log::warn;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// How the command stream receiver hands finished batches to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// Every `flush_task` submits right away.
    #[default]
    Immediate,
    /// `flush_task` queues the batch; `flush_batched_submissions` submits.
    Batched,
}

impl FromStr for DispatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "immediate" | "0" => Ok(Self::Immediate),
            "batched" | "1" => Ok(Self::Batched),
            other => Err(format!("unknown dispatch mode '{other}'")),
        }
    }
}

#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone)]
pub struct DebugSettings {
    pub make_each_enqueue_blocking: bool,
    pub enable_timestamp_packet: bool,
    pub csr_dispatch_mode: DispatchMode,
    pub force_command_buffer_alignment_kb: Option<usize>,
    /// Busy-poll window before a completion wait parks on the condition variable.
    pub completion_spin_us: u64,
    /// When set, each CSR runs a poller thread that wakes waiters at this interval.
    pub completion_poll_interval_us: Option<u64>,
    pub default_wait_timeout_ms: u64,
    pub enable_local_memory: bool,
    pub timestamp_packet_tags_per_chunk: usize,
    pub hw_timestamp_tags_per_chunk: usize,
}

impl Default for DebugSettings {
    fn default() -> Self {
        Self {
            make_each_enqueue_blocking: false,
            enable_timestamp_packet: true,
            csr_dispatch_mode: DispatchMode::Immediate,
            force_command_buffer_alignment_kb: None,
            completion_spin_us: 20,
            completion_poll_interval_us: None,
            default_wait_timeout_ms: 5000,
            enable_local_memory: false,
            timestamp_packet_tags_per_chunk: 64,
            hw_timestamp_tags_per_chunk: 32,
        }
    }
}

impl DebugSettings {
    /// Builds settings from the process environment, falling back to defaults.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) but with an injectable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();

        read_into(&lookup, "NEO_MAKE_EACH_ENQUEUE_BLOCKING", &mut settings.make_each_enqueue_blocking);
        read_into(&lookup, "NEO_ENABLE_TIMESTAMP_PACKET", &mut settings.enable_timestamp_packet);
        read_into(&lookup, "NEO_CSR_DISPATCH_MODE", &mut settings.csr_dispatch_mode);
        read_into(&lookup, "NEO_COMPLETION_SPIN_US", &mut settings.completion_spin_us);
        read_into(&lookup, "NEO_DEFAULT_WAIT_TIMEOUT_MS", &mut settings.default_wait_timeout_ms);
        read_into(&lookup, "NEO_ENABLE_LOCAL_MEMORY", &mut settings.enable_local_memory);
        read_into(
            &lookup,
            "NEO_TIMESTAMP_PACKET_TAGS_PER_CHUNK",
            &mut settings.timestamp_packet_tags_per_chunk,
        );
        read_into(
            &lookup,
            "NEO_HW_TIMESTAMP_TAGS_PER_CHUNK",
            &mut settings.hw_timestamp_tags_per_chunk,
        );

        let mut alignment_kb = 0usize;
        read_into(&lookup, "NEO_FORCE_COMMAND_BUFFER_ALIGNMENT_KB", &mut alignment_kb);
        if alignment_kb.is_power_of_two() {
            settings.force_command_buffer_alignment_kb = Some(alignment_kb);
        }

        let mut poll_us = 0u64;
        read_into(&lookup, "NEO_COMPLETION_POLL_INTERVAL_US", &mut poll_us);
        if poll_us > 0 {
            settings.completion_poll_interval_us = Some(poll_us);
        }

        settings
    }

    #[must_use]
    pub const fn completion_spin(&self) -> Duration {
        Duration::from_micros(self.completion_spin_us)
    }

    #[must_use]
    pub const fn default_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.default_wait_timeout_ms)
    }
}

fn read_into<F, T>(lookup: &F, key: &str, slot: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: ParseSetting,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    match T::parse_setting(raw.trim()) {
        Some(value) => *slot = value,
        None => warn!("[DebugSettings] ignoring {key}={raw}: unparsable value"),
    }
}

trait ParseSetting: Sized {
    fn parse_setting(raw: &str) -> Option<Self>;
}

impl ParseSetting for bool {
    fn parse_setting(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "on" | "yes" => Some(true),
            "0" | "false" | "off" | "no" => Some(false),
            _ => None,
        }
    }
}

impl ParseSetting for u64 {
    fn parse_setting(raw: &str) -> Option<Self> {
        raw.parse().ok()
    }
}

impl ParseSetting for usize {
    fn parse_setting(raw: &str) -> Option<Self> {
        raw.parse().ok()
    }
}

impl ParseSetting for DispatchMode {
    fn parse_setting(raw: &str) -> Option<Self> {
        raw.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings_from(pairs: &[(&str, &str)]) -> DebugSettings {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        DebugSettings::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let settings = settings_from(&[]);
        assert!(!settings.make_each_enqueue_blocking);
        assert!(settings.enable_timestamp_packet);
        assert_eq!(settings.csr_dispatch_mode, DispatchMode::Immediate);
        assert_eq!(settings.force_command_buffer_alignment_kb, None);
        assert_eq!(settings.completion_poll_interval_us, None);
    }

    #[test]
    fn recognized_variables_override_defaults() {
        let settings = settings_from(&[
            ("NEO_MAKE_EACH_ENQUEUE_BLOCKING", "1"),
            ("NEO_ENABLE_TIMESTAMP_PACKET", "false"),
            ("NEO_CSR_DISPATCH_MODE", "batched"),
            ("NEO_FORCE_COMMAND_BUFFER_ALIGNMENT_KB", "128"),
            ("NEO_COMPLETION_POLL_INTERVAL_US", "50"),
        ]);
        assert!(settings.make_each_enqueue_blocking);
        assert!(!settings.enable_timestamp_packet);
        assert_eq!(settings.csr_dispatch_mode, DispatchMode::Batched);
        assert_eq!(settings.force_command_buffer_alignment_kb, Some(128));
        assert_eq!(settings.completion_poll_interval_us, Some(50));
    }

    #[test]
    fn garbage_values_keep_defaults() {
        let settings = settings_from(&[
            ("NEO_MAKE_EACH_ENQUEUE_BLOCKING", "maybe"),
            ("NEO_FORCE_COMMAND_BUFFER_ALIGNMENT_KB", "100"),
            ("NEO_COMPLETION_SPIN_US", "-3"),
        ]);
        assert!(!settings.make_each_enqueue_blocking);
        assert_eq!(settings.force_command_buffer_alignment_kb, None);
        assert_eq!(settings.completion_spin_us, 20);
    }
}
