use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Local;
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RpsConfig {
    #[serde(default)]
    pub download: u32,
    #[serde(default)]
    pub upload: u32,
    #[serde(default)]
    pub remove: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BandwidthConfig {
    #[serde(default)]
    pub download: i64,
    #[serde(default)]
    pub upload: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub max_connections_from_ip: u32,
    #[serde(default)]
    pub rps: Option<RpsConfig>,
    #[serde(default)]
    pub bandwidth: Option<BandwidthConfig>,
}

/// Per-IP counter of currently open connections.
///
/// The lock only ever guards counter math; callers must balance every `inc`
/// with a `decr`, which `ConnGuard` does on drop.
pub struct CountLimit {
    max: u32,
    counts: Mutex<HashMap<String, u32>>,
}

impl CountLimit {
    fn new(max: u32) -> Self {
        CountLimit {
            max,
            counts: Mutex::new(HashMap::new()),
        }
    }

    fn inc(&self, ip: &str) -> bool {
        let mut counts = self.counts.lock().unwrap();
        let count = counts.entry(ip.to_string()).or_insert(0);
        *count += 1;
        *count <= self.max
    }

    fn decr(&self, ip: &str) {
        let mut counts = self.counts.lock().unwrap();
        let count = counts.entry(ip.to_string()).or_insert(0);
        if *count > 0 {
            *count -= 1;
        }
    }

    #[cfg(test)]
    fn current(&self, ip: &str) -> u32 {
        *self.counts.lock().unwrap().get(ip).unwrap_or(&0)
    }
}

/// Releases the connection slot taken by `RateLimit::add_connection` when
/// dropped, whether or not the slot was granted.
pub struct ConnGuard {
    limit: Option<Arc<CountLimit>>,
    ip: String,
    allowed: bool,
}

impl ConnGuard {
    pub fn allowed(&self) -> bool {
        self.allowed
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        if let Some(limit) = self.limit.take() {
            limit.decr(&self.ip);
        }
    }
}

/// Server-wide requests-per-second ceiling with a 1-second tumbling window.
/// The window resets on the first admission more than one second after the
/// window started.
pub struct RpsLimit {
    rps: u32,
    window: Mutex<RpsWindow>,
}

#[derive(Default)]
struct RpsWindow {
    count: u32,
    started_at: Option<Instant>,
}

impl RpsLimit {
    fn new(rps: u32) -> Self {
        RpsLimit {
            rps,
            window: Mutex::new(RpsWindow::default()),
        }
    }

    fn admit(&self) -> bool {
        let now = Instant::now();
        let mut window = self.window.lock().unwrap();

        match window.started_at {
            Some(started) if now.duration_since(started) <= Duration::from_secs(1) => {
                window.count += 1;
            }
            _ => {
                window.count = 1;
                window.started_at = Some(now);
            }
        }

        window.count <= self.rps
    }
}

/// Per-IP byte budget per calendar day (local time). The daily reset is
/// lazy: the first admission on a new day swaps in a fresh map seeded with
/// that call's bytes.
pub struct BandwidthLimit {
    max: i64,
    window: Mutex<BandwidthWindow>,
}

struct BandwidthWindow {
    used: HashMap<String, i64>,
    day: String,
}

fn today() -> String {
    Local::now().format("%Y-%m-%d").to_string()
}

impl BandwidthLimit {
    fn new(max: i64) -> Self {
        BandwidthLimit {
            max,
            window: Mutex::new(BandwidthWindow {
                used: HashMap::new(),
                day: today(),
            }),
        }
    }

    fn admit(&self, ip: &str, bytes: i64) -> bool {
        let now = today();
        let mut window = self.window.lock().unwrap();

        if window.day != now {
            window.day = now;
            let mut fresh = HashMap::new();
            fresh.insert(ip.to_string(), bytes);
            window.used = fresh;
            return bytes <= self.max;
        }

        let total = window.used.entry(ip.to_string()).or_insert(0);
        *total += bytes;
        *total <= self.max
    }

    #[cfg(test)]
    fn set_day(&self, day: &str) {
        self.window.lock().unwrap().day = day.to_string();
    }
}

/// Facade over the three limiters. Absent config disables the matching
/// limiter (always allow); unknown actions are always allowed.
pub struct RateLimit {
    connections: Option<Arc<CountLimit>>,
    bandwidth_download: Option<BandwidthLimit>,
    bandwidth_upload: Option<BandwidthLimit>,
    rps_download: Option<RpsLimit>,
    rps_upload: Option<RpsLimit>,
    rps_remove: Option<RpsLimit>,
}

impl RateLimit {
    pub fn new(cfg: &RateLimitConfig) -> Self {
        let connections = (cfg.max_connections_from_ip > 0)
            .then(|| Arc::new(CountLimit::new(cfg.max_connections_from_ip)));

        let (bandwidth_download, bandwidth_upload) = match &cfg.bandwidth {
            Some(bw) => (
                (bw.download > 0).then(|| BandwidthLimit::new(bw.download)),
                (bw.upload > 0).then(|| BandwidthLimit::new(bw.upload)),
            ),
            None => (None, None),
        };

        let (rps_download, rps_upload, rps_remove) = match &cfg.rps {
            Some(rps) => (
                (rps.download > 0).then(|| RpsLimit::new(rps.download)),
                (rps.upload > 0).then(|| RpsLimit::new(rps.upload)),
                (rps.remove > 0).then(|| RpsLimit::new(rps.remove)),
            ),
            None => (None, None, None),
        };

        RateLimit {
            connections,
            bandwidth_download,
            bandwidth_upload,
            rps_download,
            rps_upload,
            rps_remove,
        }
    }

    /// Takes a connection slot for `ip`. The returned guard reports whether
    /// the slot was within the cap and gives it back on drop.
    pub fn add_connection(&self, ip: &str) -> ConnGuard {
        match &self.connections {
            None => ConnGuard {
                limit: None,
                ip: String::new(),
                allowed: true,
            },
            Some(limit) => {
                let allowed = limit.inc(ip);
                ConnGuard {
                    limit: Some(Arc::clone(limit)),
                    ip: ip.to_string(),
                    allowed,
                }
            }
        }
    }

    pub fn admit_rps(&self, action: &str) -> bool {
        let limit = match action {
            "download" => &self.rps_download,
            "upload" => &self.rps_upload,
            "remove" => &self.rps_remove,
            _ => return true,
        };

        limit.as_ref().map_or(true, |l| l.admit())
    }

    pub fn admit_bandwidth(&self, action: &str, ip: &str, bytes: i64) -> bool {
        let limit = match action {
            "download" => &self.bandwidth_download,
            "upload" => &self.bandwidth_upload,
            _ => return true,
        };

        limit.as_ref().map_or(true, |l| l.admit(ip, bytes))
    }
}
