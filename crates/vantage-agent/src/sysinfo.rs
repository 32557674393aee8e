//! Best-effort host information for the registration payload.
//!
//! Everything here degrades to zero values rather than failing: the
//! broker only requires the credential; the rest is dashboard garnish.

use std::sync::OnceLock;

use tracing::debug;
use vantage_proto::{DisplayInfo, Registration};

/// Gather host facts. `name` overrides the default (the hostname).
pub fn collect(name: Option<&str>) -> Registration {
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_default();
    let name = name
        .filter(|n| !n.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| hostname.clone());

    let (memory_total, memory_free) = memory();
    let (disk_total, disk_free) = disk_usage("/");
    let displays = probe_displays();
    let display_count = (displays.len() as u32).max(1);

    Registration {
        credential: String::new(),
        name,
        hostname,
        os: std::env::consts::OS.to_string(),
        os_version: os_version(),
        arch: std::env::consts::ARCH.to_string(),
        cpu_count: std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1),
        memory_total,
        memory_free,
        disk_total,
        disk_free,
        displays,
        display_count,
        local_ips: local_ips(),
        username: std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_default(),
        uptime_seconds: uptime_seconds(),
        agent_version: env!("CARGO_PKG_VERSION").to_string(),
    }
}

/// Number of attached displays, for switch bounds checks. Probed once per
/// process: hot-plugging a monitor requires an agent restart.
pub fn display_count() -> u32 {
    static COUNT: OnceLock<u32> = OnceLock::new();
    *COUNT.get_or_init(|| (probe_displays().len() as u32).max(1))
}

/// Total and free bytes for the filesystem holding `path`.
#[cfg(unix)]
fn disk_usage(path: &str) -> (u64, u64) {
    match nix::sys::statvfs::statvfs(path) {
        Ok(stat) => {
            let frsize = stat.fragment_size() as u64;
            (
                stat.blocks() as u64 * frsize,
                stat.blocks_available() as u64 * frsize,
            )
        }
        Err(e) => {
            debug!(error = %e, path, "statvfs failed");
            (0, 0)
        }
    }
}

#[cfg(not(unix))]
fn disk_usage(_path: &str) -> (u64, u64) {
    (0, 0)
}

#[cfg(target_os = "linux")]
fn probe_displays() -> Vec<DisplayInfo> {
    let Ok(output) = std::process::Command::new("xrandr").arg("--query").output() else {
        return Vec::new();
    };
    parse_xrandr_displays(&String::from_utf8_lossy(&output.stdout))
}

#[cfg(target_os = "macos")]
fn probe_displays() -> Vec<DisplayInfo> {
    let Ok(output) = std::process::Command::new("system_profiler")
        .arg("SPDisplaysDataType")
        .output()
    else {
        return Vec::new();
    };
    parse_profiler_displays(&String::from_utf8_lossy(&output.stdout))
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn probe_displays() -> Vec<DisplayInfo> {
    Vec::new()
}

/// Pull connected-display resolutions out of `xrandr --query` output.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_xrandr_displays(output: &str) -> Vec<DisplayInfo> {
    let mut displays = Vec::new();
    let mut index = 1;
    // Lines like: "DP-1 connected primary 2560x1440+0+0 ..."
    for line in output.lines().filter(|l| l.contains(" connected")) {
        if let Some((width, height)) = line.split_whitespace().find_map(parse_geometry) {
            displays.push(DisplayInfo {
                index,
                width,
                height,
            });
            index += 1;
        }
    }
    displays
}

/// Parse a "WxH+X+Y" geometry token.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_geometry(token: &str) -> Option<(u32, u32)> {
    let x = token.find('x')?;
    let plus = token.find('+')?;
    if x < 1 || plus <= x {
        return None;
    }
    let width = token[..x].parse().ok()?;
    let height = token[x + 1..plus].parse().ok()?;
    Some((width, height))
}

/// Pull "Resolution: 2560 x 1440 ..." lines out of system_profiler output.
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn parse_profiler_displays(output: &str) -> Vec<DisplayInfo> {
    let mut displays = Vec::new();
    let mut index = 1;
    for line in output.lines() {
        let line = line.trim_start();
        let Some(rest) = line.strip_prefix("Resolution:") else {
            continue;
        };
        let mut fields = rest.split_whitespace();
        let (Some(w), Some("x"), Some(h)) = (fields.next(), fields.next(), fields.next()) else {
            continue;
        };
        if let (Ok(width), Ok(height)) = (w.parse(), h.parse()) {
            displays.push(DisplayInfo {
                index,
                width,
                height,
            });
            index += 1;
        }
    }
    displays
}

fn local_ips() -> Vec<String> {
    match if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces
            .into_iter()
            .filter(|i| !i.is_loopback())
            .map(|i| i.ip().to_string())
            .collect(),
        Err(e) => {
            debug!(error = %e, "interface enumeration failed");
            Vec::new()
        }
    }
}

#[cfg(target_os = "linux")]
fn os_version() -> String {
    let Ok(data) = std::fs::read_to_string("/etc/os-release") else {
        return "Linux".to_string();
    };
    data.lines()
        .find_map(|line| line.strip_prefix("PRETTY_NAME="))
        .map(|value| value.trim_matches('"').to_string())
        .unwrap_or_else(|| "Linux".to_string())
}

#[cfg(target_os = "macos")]
fn os_version() -> String {
    match std::process::Command::new("sw_vers")
        .arg("-productVersion")
        .output()
    {
        Ok(output) => format!("macOS {}", String::from_utf8_lossy(&output.stdout).trim()),
        Err(_) => "macOS".to_string(),
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn os_version() -> String {
    String::new()
}

#[cfg(target_os = "linux")]
fn memory() -> (u64, u64) {
    let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") else {
        return (0, 0);
    };
    let field = |name: &str| {
        meminfo
            .lines()
            .find(|l| l.starts_with(name))
            .and_then(|l| l.split_whitespace().nth(1))
            .and_then(|v| v.parse::<u64>().ok())
            .map(|kb| kb * 1024)
            .unwrap_or(0)
    };
    (field("MemTotal:"), field("MemAvailable:"))
}

#[cfg(not(target_os = "linux"))]
fn memory() -> (u64, u64) {
    (0, 0)
}

#[cfg(target_os = "linux")]
fn uptime_seconds() -> i64 {
    std::fs::read_to_string("/proc/uptime")
        .ok()
        .and_then(|s| {
            s.split_whitespace()
                .next()
                .and_then(|v| v.parse::<f64>().ok())
        })
        .map(|secs| secs as i64)
        .unwrap_or(0)
}

#[cfg(not(target_os = "linux"))]
fn uptime_seconds() -> i64 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collect_fills_identity_fields() {
        let reg = collect(Some("named"));
        assert_eq!(reg.name, "named");
        assert_eq!(reg.os, std::env::consts::OS);
        assert_eq!(reg.arch, std::env::consts::ARCH);
        assert!(reg.cpu_count >= 1);
        assert!(reg.display_count >= 1);
        assert_eq!(reg.agent_version, env!("CARGO_PKG_VERSION"));
        assert!(reg.credential.is_empty());
    }

    #[test]
    fn empty_name_falls_back_to_hostname() {
        let reg = collect(Some(""));
        assert_eq!(reg.name, reg.hostname);
    }

    #[test]
    fn display_count_is_cached() {
        assert_eq!(display_count(), display_count());
    }

    #[cfg(unix)]
    #[test]
    fn root_filesystem_has_nonzero_capacity() {
        let (total, free) = disk_usage("/");
        assert!(total > 0);
        assert!(free <= total);
    }

    #[test]
    fn xrandr_connected_lines_are_parsed() {
        let output = "\
Screen 0: minimum 320 x 200, current 4480 x 1440, maximum 16384 x 16384
DP-1 connected primary 2560x1440+0+0 (normal left inverted) 597mm x 336mm
HDMI-1 connected 1920x1080+2560+0 (normal left inverted) 509mm x 286mm
DP-2 disconnected (normal left inverted right x axis y axis)
";
        let displays = parse_xrandr_displays(output);
        assert_eq!(displays.len(), 2);
        assert_eq!(displays[0].index, 1);
        assert_eq!((displays[0].width, displays[0].height), (2560, 1440));
        assert_eq!(displays[1].index, 2);
        assert_eq!((displays[1].width, displays[1].height), (1920, 1080));
    }

    #[test]
    fn geometry_tokens_reject_non_geometry_fields() {
        assert_eq!(parse_geometry("2560x1440+0+0"), Some((2560, 1440)));
        assert_eq!(parse_geometry("connected"), None);
        assert_eq!(parse_geometry("597mm"), None);
        assert_eq!(parse_geometry("x1440+0+0"), None);
        assert_eq!(parse_geometry("2560x+0"), None);
    }

    #[test]
    fn profiler_resolution_lines_are_parsed() {
        let output = "\
Graphics/Displays:
    Apple M2:
      Displays:
        Built-in Liquid Retina Display:
          Resolution: 3024 x 1964 Retina
        LG HDR 4K:
          Resolution: 3840 x 2160 (2160p/4K UHD 1)
";
        let displays = parse_profiler_displays(output);
        assert_eq!(displays.len(), 2);
        assert_eq!((displays[0].width, displays[0].height), (3024, 1964));
        assert_eq!((displays[1].width, displays[1].height), (3840, 2160));
    }
}
