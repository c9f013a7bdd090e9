//! Available-RAM probing for the pre-flight and mid-decode budget checks.

/// Available system memory in MiB, or `None` where the platform exposes no
/// cheap probe (the budget checks are skipped in that case).
pub fn available_mib() -> Option<u64> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
        parse_available_kib(&meminfo).map(|kib| kib / 1024)
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        None
    }
}

#[cfg_attr(
    not(any(target_os = "linux", target_os = "android")),
    allow(dead_code)
)]
fn parse_available_kib(meminfo: &str) -> Option<u64> {
    meminfo
        .lines()
        .find_map(|line| line.strip_prefix("MemAvailable:"))
        .and_then(|rest| rest.trim().split_whitespace().next())
        .and_then(|value| value.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mem_available_line() {
        let meminfo =
            "MemTotal:        3882924 kB\nMemFree:          111000 kB\nMemAvailable:    1536000 kB\n";
        assert_eq!(parse_available_kib(meminfo), Some(1_536_000));
    }

    #[test]
    fn missing_line_yields_none() {
        assert_eq!(parse_available_kib("MemTotal: 1 kB\n"), None);
        assert_eq!(parse_available_kib(""), None);
    }

    #[test]
    fn garbage_value_yields_none() {
        assert_eq!(parse_available_kib("MemAvailable: lots kB\n"), None);
    }
}
