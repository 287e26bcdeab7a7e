//! Centralized configuration and builder for a GristMR engine.
//!
//! Goals:
//! - Single place to collect tunables instead of scattering env lookups.
//! - MrConfig::from_env() reads GMR_* variables; the fluent builder
//!   overrides individual fields on top of that.
//!
//! The engine validates memsize/alignment on construction, not here, so a
//! config object itself can always be built and printed.

use std::fmt;
use std::path::PathBuf;

use crate::consts::{ALIGN_KV_DEFAULT, MEMSIZE_MB_DEFAULT};

/// Task dispatch policy for map().
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapStyle {
    /// Contiguous range of task ids per rank.
    Chunk,
    /// Rank r handles tasks r, r+P, r+2P, ...
    Strided,
    /// Rank 0 hands out tasks on demand, point-to-point.
    MasterSlave,
}

/// How much each operation reports after it completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd)]
pub enum Verbosity {
    Silent,
    /// Global totals on rank 0.
    Totals,
    /// Totals plus per-rank min/max/mean and a 10-bin histogram.
    Histogram,
}

/// Per-operation wall-clock timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerMode {
    Off,
    /// Barrier before starting the clock, so the time is the collective one.
    Barrier,
    /// No barrier; each rank times its own span.
    NoBarrier,
}

#[derive(Debug, Clone)]
pub struct MrConfig {
    /// In-RAM page-buffer size in bytes. A quarter of it is the page size of
    /// each container, the remaining half is scratch.
    /// Env: GMR_MEMSIZE_MB (default 64)
    pub memsize_bytes: u64,

    /// Power-of-two byte alignment of keys within a page.
    /// Env: GMR_KEY_ALIGN (default 4)
    pub key_align: usize,

    /// Power-of-two byte alignment of values within a page.
    /// Env: GMR_VALUE_ALIGN (default 4)
    pub value_align: usize,

    /// Env: GMR_MAPSTYLE = chunk|strided|master_slave (default chunk)
    pub mapstyle: MapStyle,

    /// Env: GMR_VERBOSITY = silent|totals|histogram (default silent)
    pub verbosity: Verbosity,

    /// Env: GMR_TIMER = off|barrier|nobarrier (default off)
    pub timer: TimerMode,

    /// Directory for per-rank spill files.
    /// Env: GMR_SCRATCH_DIR (default std::env::temp_dir())
    pub scratch_dir: PathBuf,
}

impl Default for MrConfig {
    fn default() -> Self {
        Self {
            memsize_bytes: MEMSIZE_MB_DEFAULT * 1024 * 1024,
            key_align: ALIGN_KV_DEFAULT,
            value_align: ALIGN_KV_DEFAULT,
            mapstyle: MapStyle::Chunk,
            verbosity: Verbosity::Silent,
            timer: TimerMode::Off,
            scratch_dir: std::env::temp_dir(),
        }
    }
}

impl MrConfig {
    /// Load configuration from GMR_* environment variables.
    /// Unparsable values are silently ignored, field keeps its default.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("GMR_MEMSIZE_MB") {
            if let Ok(n) = v.trim().parse::<u64>() {
                cfg.memsize_bytes = n * 1024 * 1024;
            }
        }
        if let Ok(v) = std::env::var("GMR_KEY_ALIGN") {
            if let Ok(n) = v.trim().parse::<usize>() {
                cfg.key_align = n;
            }
        }
        if let Ok(v) = std::env::var("GMR_VALUE_ALIGN") {
            if let Ok(n) = v.trim().parse::<usize>() {
                cfg.value_align = n;
            }
        }
        if let Ok(v) = std::env::var("GMR_MAPSTYLE") {
            match v.trim().to_ascii_lowercase().as_str() {
                "chunk" => cfg.mapstyle = MapStyle::Chunk,
                "strided" => cfg.mapstyle = MapStyle::Strided,
                "master_slave" | "masterslave" => cfg.mapstyle = MapStyle::MasterSlave,
                _ => {}
            }
        }
        if let Ok(v) = std::env::var("GMR_VERBOSITY") {
            match v.trim().to_ascii_lowercase().as_str() {
                "silent" | "none" | "0" => cfg.verbosity = Verbosity::Silent,
                "totals" | "1" => cfg.verbosity = Verbosity::Totals,
                "histogram" | "2" => cfg.verbosity = Verbosity::Histogram,
                _ => {}
            }
        }
        if let Ok(v) = std::env::var("GMR_TIMER") {
            match v.trim().to_ascii_lowercase().as_str() {
                "off" | "0" => cfg.timer = TimerMode::Off,
                "barrier" | "1" => cfg.timer = TimerMode::Barrier,
                "nobarrier" | "2" => cfg.timer = TimerMode::NoBarrier,
                _ => {}
            }
        }
        if let Ok(v) = std::env::var("GMR_SCRATCH_DIR") {
            let s = v.trim();
            if !s.is_empty() {
                cfg.scratch_dir = PathBuf::from(s);
            }
        }

        cfg
    }

    // Fluent setters (builder-style) to override specific fields.

    pub fn with_memsize_mb(mut self, mb: u64) -> Self {
        self.memsize_bytes = mb * 1024 * 1024;
        self
    }

    /// Exact byte size, for tests that want tiny pages. Must stay a
    /// multiple of MEMSIZE_GRAIN or the engine will refuse it.
    pub fn with_memsize_bytes(mut self, bytes: u64) -> Self {
        self.memsize_bytes = bytes;
        self
    }

    pub fn with_aligns(mut self, key_align: usize, value_align: usize) -> Self {
        self.key_align = key_align;
        self.value_align = value_align;
        self
    }

    pub fn with_mapstyle(mut self, style: MapStyle) -> Self {
        self.mapstyle = style;
        self
    }

    pub fn with_verbosity(mut self, v: Verbosity) -> Self {
        self.verbosity = v;
        self
    }

    pub fn with_timer(mut self, t: TimerMode) -> Self {
        self.timer = t;
        self
    }

    pub fn with_scratch_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.scratch_dir = dir.into();
        self
    }
}

impl fmt::Display for MrConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MrConfig {{ memsize: {} KB, key_align: {}, value_align: {}, \
             mapstyle: {:?}, verbosity: {:?}, timer: {:?}, scratch_dir: {} }}",
            self.memsize_bytes / 1024,
            self.key_align,
            self.value_align,
            self.mapstyle,
            self.verbosity,
            self.timer,
            self.scratch_dir.display(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = MrConfig::default();
        assert_eq!(cfg.memsize_bytes, 64 * 1024 * 1024);
        assert_eq!(cfg.key_align, 4);
        assert_eq!(cfg.mapstyle, MapStyle::Chunk);
        assert_eq!(cfg.verbosity, Verbosity::Silent);
    }

    #[test]
    fn builder_overrides() {
        let cfg = MrConfig::default()
            .with_memsize_bytes(16 * 1024)
            .with_aligns(8, 16)
            .with_mapstyle(MapStyle::Strided);
        assert_eq!(cfg.memsize_bytes, 16 * 1024);
        assert_eq!(cfg.key_align, 8);
        assert_eq!(cfg.value_align, 16);
        assert_eq!(cfg.mapstyle, MapStyle::Strided);
    }
}
