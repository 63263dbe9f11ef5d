//! Read-only views over `/proc`: system-wide CPU accounting and per-process
//! usage, as consumed by the affinity binder and the limit watchers.

use std::fs;
use std::io;

use nix::unistd::Pid;

#[derive(Debug, Clone, Copy)]
pub struct ProcessStats {
    /// user + system time, in clock ticks
    pub cpu_ticks: u64,
    /// virtual memory size, in bytes
    pub vsize: u64,
}

/// Total busy+idle time of the whole machine, in clock ticks, from the
/// aggregate `cpu` line of `/proc/stat`.
pub fn total_cpu_time() -> io::Result<u64> {
    let text = fs::read_to_string("/proc/stat")?;
    parse_total_cpu(&text)
}

/// CPU and virtual memory usage of one process from `/proc/<pid>/stat`.
///
/// Fails with `NotFound` once the process has been reaped, which the
/// watchers treat as a normal end of sampling.
pub fn process_stats(pid: Pid) -> io::Result<ProcessStats> {
    let text = fs::read_to_string(format!("/proc/{}/stat", pid))?;
    parse_process_stat(&text)
}

/// Peak resident set size of one process in bytes (`VmHWM` of
/// `/proc/<pid>/status`).
pub fn process_rss_peak(pid: Pid) -> io::Result<u64> {
    let text = fs::read_to_string(format!("/proc/{}/status", pid))?;
    parse_rss_peak(&text)
}

/// Index of the CPU with the smallest cumulative busy+idle time.
/// Ties resolve to the lowest index.
pub fn least_loaded_cpu() -> io::Result<usize> {
    let text = fs::read_to_string("/proc/stat")?;
    parse_least_loaded(&text)
}

/// Number of CPUs reported by `/proc/stat`.
pub fn online_cpu_count() -> io::Result<usize> {
    let text = fs::read_to_string("/proc/stat")?;
    let count = per_cpu_totals(&text).count();
    if count == 0 {
        return Err(invalid("no cpu lines in /proc/stat"));
    }
    Ok(count)
}

/// Command line of a process with embedded NUL bytes replaced by spaces.
/// Never fails the caller: any error yields `-`.
pub fn process_command(pid: Pid) -> String {
    match fs::read(format!("/proc/{}/cmdline", pid)) {
        Ok(raw) => {
            let text: String = raw
                .iter()
                .map(|&b| if b == 0 { ' ' } else { char::from(b) })
                .collect();
            text.trim().to_owned()
        }
        Err(_) => "-".to_owned(),
    }
}

/// Clock ticks per second used by `/proc` accounting.
pub fn clock_ticks_per_sec() -> u64 {
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks <= 0 {
        100
    } else {
        ticks as u64
    }
}

pub fn ticks_to_ms(ticks: u64) -> u64 {
    ticks * 1000 / clock_ticks_per_sec()
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

fn parse_total_cpu(text: &str) -> io::Result<u64> {
    let line = text.lines().next().unwrap_or_default();
    let mut fields = line.split_whitespace();
    if fields.next() != Some("cpu") {
        return Err(invalid("missing aggregate cpu line in /proc/stat"));
    }
    sum_first_four(fields)
}

/// Sums user + nice + system + idle from the remaining fields of a cpu line.
fn sum_first_four<'a>(fields: impl Iterator<Item = &'a str>) -> io::Result<u64> {
    let mut total = 0u64;
    let mut seen = 0;
    for field in fields.take(4) {
        total += field
            .parse::<u64>()
            .map_err(|_| invalid(format!("bad cpu time field: {:?}", field)))?;
        seen += 1;
    }
    if seen < 4 {
        return Err(invalid("truncated cpu line in /proc/stat"));
    }
    Ok(total)
}

fn per_cpu_totals(text: &str) -> impl Iterator<Item = (usize, io::Result<u64>)> + '_ {
    text.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let tag = fields.next()?;
            let index = tag.strip_prefix("cpu")?.parse::<usize>().ok()?;
            Some((index, sum_first_four(fields)))
        })
}

fn parse_least_loaded(text: &str) -> io::Result<usize> {
    let mut best: Option<(u64, usize)> = None;
    for (index, total) in per_cpu_totals(text) {
        let total = total?;
        match best {
            Some((min, _)) if total >= min => {}
            _ => best = Some((total, index)),
        }
    }
    best.map(|(_, index)| index)
        .ok_or_else(|| invalid("no cpu lines in /proc/stat"))
}

fn parse_process_stat(text: &str) -> io::Result<ProcessStats> {
    // The command field is parenthesised and may contain spaces; everything
    // after the closing paren is whitespace separated.
    let rest = text
        .rfind(')')
        .map(|pos| &text[pos + 1..])
        .ok_or_else(|| invalid("malformed process stat line"))?;
    let fields: Vec<&str> = rest.split_whitespace().collect();

    // Field numbers from proc(5), counting from 1: utime = 14, stime = 15,
    // vsize = 23. `rest` starts at field 3 (state).
    let field = |n: usize| -> io::Result<u64> {
        fields
            .get(n - 3)
            .and_then(|f| f.parse::<u64>().ok())
            .ok_or_else(|| invalid(format!("missing field {} in process stat", n)))
    };

    let utime = field(14)?;
    let stime = field(15)?;
    let vsize = field(23)?;

    Ok(ProcessStats {
        cpu_ticks: utime + stime,
        vsize,
    })
}

fn parse_rss_peak(text: &str) -> io::Result<u64> {
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("VmHWM:") {
            let kb = rest
                .trim()
                .trim_end_matches("kB")
                .trim()
                .parse::<u64>()
                .map_err(|_| invalid("bad VmHWM value"))?;
            return Ok(kb * 1024);
        }
    }
    Err(invalid("no VmHWM line in process status"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT: &str = "\
cpu  100 20 30 4000 50 0 6 0 0 0
cpu0 10 5 10 1000 10 0 3 0 0 0
cpu1 80 10 15 900 30 0 2 0 0 0
cpu2 10 5 5 2100 10 0 1 0 0 0
intr 12345
ctxt 6789
";

    #[test]
    fn total_cpu_sums_first_four_fields() {
        assert_eq!(parse_total_cpu(STAT).unwrap(), 100 + 20 + 30 + 4000);
    }

    #[test]
    fn total_cpu_requires_aggregate_sentinel() {
        assert!(parse_total_cpu("cpu0 1 2 3 4\n").is_err());
        assert!(parse_total_cpu("").is_err());
    }

    #[test]
    fn least_loaded_picks_smallest_total() {
        // cpu1: 80+10+15+900 = 1005, smallest of the three
        assert_eq!(parse_least_loaded(STAT).unwrap(), 1);
    }

    #[test]
    fn least_loaded_breaks_ties_towards_lowest_index() {
        let text = "cpu  4 4 4 4\ncpu0 1 1 1 1\ncpu1 1 1 1 1\n";
        assert_eq!(parse_least_loaded(text).unwrap(), 0);
    }

    #[test]
    fn cpu_count_ignores_non_cpu_lines() {
        assert_eq!(per_cpu_totals(STAT).count(), 3);
    }

    #[test]
    fn process_stat_reads_times_and_vsize() {
        let text = "42 (some command) S 1 42 42 0 -1 4194560 601 0 0 0 \
                    7 3 0 0 20 0 1 0 12345 104857600 188 18446744073709551615 1 1 0 0 0 0 0 0 0 0 0 0 17 3 0 0 0 0 0";
        let stats = parse_process_stat(text).unwrap();
        assert_eq!(stats.cpu_ticks, 7 + 3);
        assert_eq!(stats.vsize, 104857600);
    }

    #[test]
    fn process_stat_survives_spaces_in_command() {
        let text = "7 (a) b) c) R 1 7 7 0 -1 0 0 0 0 0 \
                    1 2 0 0 20 0 1 0 0 4096 0 0 0 0 0 0 0 0 0 0 0 0 0 0 17 0 0 0 0 0 0";
        let stats = parse_process_stat(text).unwrap();
        assert_eq!(stats.cpu_ticks, 3);
        assert_eq!(stats.vsize, 4096);
    }

    #[test]
    fn rss_peak_parses_vmhwm_kilobytes() {
        let text = "Name:\tsome\nVmPeak:\t  2048 kB\nVmHWM:\t    512 kB\nThreads:\t1\n";
        assert_eq!(parse_rss_peak(text).unwrap(), 512 * 1024);
    }

    #[test]
    fn rss_peak_requires_vmhwm() {
        assert!(parse_rss_peak("Name:\tx\n").is_err());
    }

    #[test]
    fn own_process_is_readable() {
        let me = nix::unistd::getpid();
        let stats = process_stats(me).unwrap();
        assert!(stats.vsize > 0);
        assert!(process_rss_peak(me).unwrap() > 0);
        assert!(!process_command(me).is_empty());
    }

    #[test]
    fn machine_level_readers_agree() {
        let count = online_cpu_count().unwrap();
        assert!(count >= 1);
        assert!(least_loaded_cpu().unwrap() < count);
        assert!(total_cpu_time().unwrap() > 0);
    }
}
