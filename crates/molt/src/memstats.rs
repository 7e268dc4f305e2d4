//! Per-process memory statistics for mold selection.
//!
//! The default mold selector prefers the worker with the most private
//! resident memory (the most warmed-up process makes the best
//! copy-on-write parent). On Linux that comes from
//! `/proc/<pid>/smaps_rollup`; when unavailable, `/proc/<pid>/statm`
//! supplies a resident-set fallback with `private_kb` approximated by RSS.

use std::fs;
use std::io;

/// Memory counters for one process, in kilobytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemStats {
    /// Resident set size.
    pub rss_kb: u64,
    /// Proportional set size (shared pages divided among sharers).
    pub pss_kb: u64,
    /// Private (clean + dirty) resident pages.
    pub private_kb: u64,
}

impl MemStats {
    /// Read stats for a pid.
    pub fn read(pid: u32) -> io::Result<Self> {
        match fs::read_to_string(format!("/proc/{pid}/smaps_rollup")) {
            Ok(text) => Ok(Self::parse_smaps_rollup(&text)),
            Err(_) => Self::read_statm(pid),
        }
    }

    fn parse_smaps_rollup(text: &str) -> Self {
        let mut stats = Self::default();
        for line in text.lines() {
            let Some((key, rest)) = line.split_once(':') else {
                continue;
            };
            let kb: u64 = rest
                .trim()
                .trim_end_matches("kB")
                .trim()
                .parse()
                .unwrap_or(0);
            match key {
                "Rss" => stats.rss_kb = kb,
                "Pss" => stats.pss_kb = kb,
                "Private_Clean" | "Private_Dirty" => stats.private_kb += kb,
                _ => {}
            }
        }
        stats
    }

    fn read_statm(pid: u32) -> io::Result<Self> {
        let text = fs::read_to_string(format!("/proc/{pid}/statm"))?;
        let mut fields = text.split_whitespace();
        let _size = fields.next();
        let resident: u64 = fields
            .next()
            .and_then(|f| f.parse().ok())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed statm"))?;
        let page_kb = (unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u64) / 1024;
        let rss_kb = resident * page_kb.max(1);
        Ok(Self {
            rss_kb,
            pss_kb: rss_kb,
            private_kb: rss_kb,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_smaps_rollup() {
        let text = "55e8 rollup header\n\
                    Rss:               12340 kB\n\
                    Pss:                8000 kB\n\
                    Private_Clean:      1000 kB\n\
                    Private_Dirty:      3000 kB\n\
                    Shared_Clean:       5000 kB\n";
        let stats = MemStats::parse_smaps_rollup(text);
        assert_eq!(stats.rss_kb, 12340);
        assert_eq!(stats.pss_kb, 8000);
        assert_eq!(stats.private_kb, 4000);
    }

    #[test]
    fn reads_own_process() {
        let stats = MemStats::read(std::process::id()).unwrap();
        assert!(stats.rss_kb > 0);
    }
}
