//! Sensor serial discovery
//!
//! Sensors identify themselves to the sink by the board serial found in
//! /proc/cpuinfo, unless the config pins one explicitly.

use std::fs;
use std::path::Path;
use tracing::warn;

/// Serial reported when cpuinfo has no `Serial` line
pub const UNKNOWN_SERIAL: &str = "0000000000000000";
/// Serial reported when cpuinfo cannot be read
pub const ERROR_SERIAL: &str = "ERROR000000000";

const CPUINFO_PATH: &str = "/proc/cpuinfo";

/// Resolve the serial for this sensor
pub fn resolve_serial(configured: Option<&str>) -> String {
    match configured {
        Some(serial) => serial.to_string(),
        None => read_cpu_serial(Path::new(CPUINFO_PATH)),
    }
}

/// Read the `Serial : ...` line of a cpuinfo file
pub fn read_cpu_serial(path: &Path) -> String {
    match fs::read_to_string(path) {
        Ok(content) => parse_cpu_serial(&content).unwrap_or_else(|| UNKNOWN_SERIAL.to_string()),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cpuinfo_read_failed");
            ERROR_SERIAL.to_string()
        }
    }
}

fn parse_cpu_serial(content: &str) -> Option<String> {
    content
        .lines()
        .filter(|line| line.starts_with("Serial"))
        .filter_map(|line| line.split_once(':'))
        .map(|(_, value)| value.trim().to_string())
        .rfind(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_configured_serial_wins() {
        assert_eq!(resolve_serial(Some("abc123")), "abc123");
    }

    #[test]
    fn test_parse_cpuinfo() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "processor\t: 0\nHardware\t: BCM2835\nSerial\t\t: 00000000f56eacba\n")
            .unwrap();
        assert_eq!(read_cpu_serial(file.path()), "00000000f56eacba");
    }

    #[test]
    fn test_missing_serial_line() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "processor\t: 0\n").unwrap();
        assert_eq!(read_cpu_serial(file.path()), UNKNOWN_SERIAL);
    }

    #[test]
    fn test_unreadable_cpuinfo() {
        assert_eq!(read_cpu_serial(Path::new("/nonexistent/cpuinfo")), ERROR_SERIAL);
    }
}
