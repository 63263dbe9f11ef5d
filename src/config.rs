use std::env;
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use structopt::clap::AppSettings;
use structopt::StructOpt;

/// Frozen run configuration, assembled once from the command line.
#[derive(Debug, Serialize, Deserialize, StructOpt)]
#[structopt(
    name = "corral",
    about = "Judge-style sandbox runner: supervises a target binary under ptrace with enforced resource limits",
    setting = AppSettings::TrailingVarArg,
    setting = AppSettings::AllowLeadingHyphen
)]
pub struct Config {
    /// Real (wall clock) time limit: `90`, `1500ms`, `5m` or `1h`.
    #[structopt(short = "t", long = "time-limit", parse(try_from_str = parse_duration))]
    pub real_time: Option<Duration>,

    /// CPU time limit, same formats as the real time limit.
    #[structopt(long = "cpu-time-limit", parse(try_from_str = parse_duration))]
    pub cpu_time: Option<Duration>,

    /// Memory (RSS) limit in bytes; `K` and `M` suffixes are accepted.
    #[structopt(short = "m", long = "memory-limit", parse(try_from_str = parse_memory))]
    pub memory_limit: Option<u64>,

    /// Processor load required for the tracee not to be considered idle
    /// (`0.05` or `5%`).
    #[structopt(
        short = "r",
        long = "required-load",
        default_value = "0.05",
        parse(try_from_str = parse_load)
    )]
    pub required_load: f64,

    /// Idleness limit: terminate when the load stays below the required load
    /// for this long (minimum 1s when set).
    #[structopt(short = "y", long = "idle-limit", parse(try_from_str = parse_duration))]
    pub idle_limit: Option<Duration>,

    /// Working directory for the tracee; created when missing.
    #[structopt(short = "d", long = "dir", parse(from_os_str))]
    pub working_dir: Option<PathBuf>,

    /// Run the tracee as this user.
    #[structopt(short = "l", long = "login")]
    pub user: Option<String>,

    /// Password for the pseudo-terminal re-login fallback.
    #[structopt(short = "p", long = "password")]
    pub password: Option<String>,

    /// Redirect the tracee's standard input from a file.
    #[structopt(short = "i", long = "stdin", parse(from_os_str))]
    pub input_file: Option<PathBuf>,

    /// Redirect the tracee's standard output to a file.
    #[structopt(short = "o", long = "stdout", parse(from_os_str))]
    pub output_file: Option<PathBuf>,

    /// Redirect the tracee's standard error to a file.
    #[structopt(short = "e", long = "stderr", parse(from_os_str))]
    pub error_file: Option<PathBuf>,

    /// Statistics sink: one `HH:MM:SS,load,rss` row per sample.
    #[structopt(short = "s", long = "stats", parse(from_os_str))]
    pub stats_file: Option<PathBuf>,

    /// Return the tracee's own exit code.
    #[structopt(short = "x", long = "exit-code")]
    pub propagate_exit_code: bool,

    /// Do not print anything to the console.
    #[structopt(short = "q", long = "quiet")]
    pub quiet: bool,

    /// Re-open the runner in a new terminal window.
    #[structopt(short = "w", long = "window")]
    pub window: bool,

    /// Restrict the tracee to the single least loaded CPU core.
    #[structopt(short = "1", long = "single-core")]
    pub single_core: bool,

    /// CPU indices the tracee may use; a single `-1` selects the least
    /// loaded core at launch.
    #[structopt(
        short = "a",
        long = "affinity",
        number_of_values = 1,
        allow_hyphen_values = true
    )]
    pub affinity: Vec<i32>,

    /// Environment override (`KEY=VAL`); the host environment is inherited
    /// and overridden key by key.
    #[structopt(short = "D", long = "env", number_of_values = 1, parse(try_from_str = parse_env_pair))]
    pub env_overrides: Vec<String>,

    /// Allow the tracee to spawn child processes.
    #[structopt(long = "allow-create-processes")]
    pub allow_create_processes: bool,

    /// Allow the tracee to clone itself for thread creation. Only meaningful
    /// when process creation is forbidden.
    #[structopt(long = "allow-multithreading")]
    pub allow_multithreading: bool,

    /// Abort after this many trace loop iterations (diagnostics; <= 0 disables).
    #[structopt(long = "max-iterations", default_value = "-1", allow_hyphen_values = true)]
    pub max_iterations: i64,

    /// Root filesystem to pivot into before launching the tracee.
    #[structopt(long = "rootfs", parse(from_os_str))]
    pub rootfs: Option<PathBuf>,

    /// Network setup helper, invoked with `-pid <child>` after the sandbox
    /// namespaces are created.
    #[structopt(long = "nsgpath", parse(from_os_str))]
    pub netsetgo_path: Option<PathBuf>,

    /// Enable debug output.
    #[structopt(long = "debug")]
    pub debug: bool,

    /// Path to the target executable.
    #[structopt(parse(from_os_str))]
    pub process_path: PathBuf,

    /// Arguments passed to the target.
    #[structopt(parse(from_os_str))]
    pub process_args: Vec<OsString>,
}

impl Config {
    /// Normalises the parsed flags into their effective form.
    pub fn finalize(&mut self) {
        if let Some(idle) = self.idle_limit {
            if !idle.is_zero() && idle < Duration::from_secs(1) {
                self.idle_limit = Some(Duration::from_secs(1));
            }
        }

        if self.single_core && self.affinity.is_empty() {
            self.affinity.push(-1);
        }

        // With process creation permitted the clone policy never fires.
        if self.allow_create_processes {
            self.allow_multithreading = true;
        }

        if self.quiet {
            self.window = false;
        }
    }

    /// Real time limit, `None` when disabled.
    pub fn real_time_limit(&self) -> Option<Duration> {
        self.real_time.filter(|d| !d.is_zero())
    }

    /// CPU time ceiling in milliseconds, `None` when disabled.
    pub fn cpu_time_limit_ms(&self) -> Option<u64> {
        self.cpu_time
            .filter(|d| !d.is_zero())
            .map(|d| d.as_millis() as u64)
    }

    /// Memory (RSS) ceiling in bytes, `None` when disabled.
    pub fn memory_limit_bytes(&self) -> Option<u64> {
        self.memory_limit.filter(|&m| m > 0)
    }

    /// Idle streak ceiling in seconds, `None` when disabled.
    pub fn idle_limit_secs(&self) -> Option<u64> {
        self.idle_limit.filter(|d| !d.is_zero()).map(|d| d.as_secs())
    }

    /// Final `KEY=VAL` environment of the tracee: the host environment with
    /// the `-D` overrides applied key by key.
    pub fn effective_env(&self) -> Vec<String> {
        let mut vars: Vec<String> = env::vars().map(|(k, v)| format!("{}={}", k, v)).collect();
        for pair in &self.env_overrides {
            let key = pair.split('=').next().unwrap_or_default();
            let slot = vars
                .iter_mut()
                .find(|v| v.starts_with(key) && v.as_bytes().get(key.len()) == Some(&b'='));
            match slot {
                Some(v) => *v = pair.clone(),
                None => vars.push(pair.clone()),
            }
        }
        vars
    }
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    let (number, scale_ms) = match value {
        v if v.ends_with("ms") => (&v[..v.len() - 2], 1.0),
        v if v.ends_with('s') => (&v[..v.len() - 1], 1000.0),
        v if v.ends_with('m') => (&v[..v.len() - 1], 60_000.0),
        v if v.ends_with('h') => (&v[..v.len() - 1], 3_600_000.0),
        v => (v, 1000.0),
    };
    let number = number
        .parse::<f64>()
        .map_err(|_| format!("invalid duration: {:?}", value))?;
    if number < 0.0 || !number.is_finite() {
        return Err(format!("invalid duration: {:?}", value));
    }
    Ok(Duration::from_millis((number * scale_ms) as u64))
}

fn parse_memory(value: &str) -> Result<u64, String> {
    if let Ok(bytes) = value.parse::<u64>() {
        return Ok(bytes);
    }
    let err = || format!("invalid memory size: {:?}", value);
    if value.is_empty() {
        return Err(err());
    }
    let (number, suffix) = value.split_at(value.len() - 1);
    let scale = match suffix {
        "b" | "B" => 1,
        "k" | "K" => 1024,
        "m" | "M" => 1024 * 1024,
        _ => return Err(err()),
    };
    let number = number.parse::<u64>().map_err(|_| err())?;
    Ok(number * scale)
}

fn parse_load(value: &str) -> Result<f64, String> {
    let err = || format!("required load out of range (0, 1]: {:?}", value);
    if let Some(percent) = value.strip_suffix('%') {
        let percent = percent.parse::<u32>().map_err(|_| err())?;
        if percent == 0 || percent > 100 {
            return Err(err());
        }
        return Ok(f64::from(percent) / 100.0);
    }
    let load = value.parse::<f64>().map_err(|_| err())?;
    if load > 0.0 && load <= 1.0 {
        Ok(load)
    } else {
        Err(err())
    }
}

fn parse_env_pair(value: &str) -> Result<String, String> {
    match value.find('=') {
        Some(pos) if pos > 0 => Ok(value.to_owned()),
        _ => Err(format!("expected KEY=VAL, got {:?}", value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_accepts_bare_seconds() {
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("0").unwrap(), Duration::from_secs(0));
    }

    #[test]
    fn duration_accepts_suffixes() {
        assert_eq!(parse_duration("1500ms").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("0.5s").unwrap(), Duration::from_millis(500));
    }

    #[test]
    fn duration_rejects_garbage() {
        assert!(parse_duration("ten").is_err());
        assert!(parse_duration("-5s").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn memory_accepts_suffixes() {
        assert_eq!(parse_memory("1048576").unwrap(), 1 << 20);
        assert_eq!(parse_memory("64K").unwrap(), 64 * 1024);
        assert_eq!(parse_memory("64M").unwrap(), 64 * 1024 * 1024);
        assert_eq!(parse_memory("64m").unwrap(), 64 * 1024 * 1024);
        assert_eq!(parse_memory("512b").unwrap(), 512);
    }

    #[test]
    fn memory_rejects_unknown_suffix() {
        assert!(parse_memory("64G").is_err());
        assert!(parse_memory("").is_err());
    }

    #[test]
    fn load_accepts_fraction_and_percent() {
        assert!((parse_load("0.05").unwrap() - 0.05).abs() < f64::EPSILON);
        assert!((parse_load("5%").unwrap() - 0.05).abs() < f64::EPSILON);
        assert!((parse_load("100%").unwrap() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn load_rejects_out_of_range() {
        assert!(parse_load("0").is_err());
        assert!(parse_load("1.5").is_err());
        assert!(parse_load("0%").is_err());
        assert!(parse_load("101%").is_err());
    }

    #[test]
    fn env_pair_requires_key_and_separator() {
        assert!(parse_env_pair("KEY=VAL").is_ok());
        assert!(parse_env_pair("KEY=").is_ok());
        assert!(parse_env_pair("=VAL").is_err());
        assert!(parse_env_pair("KEYVAL").is_err());
    }

    #[test]
    fn finalize_clamps_idle_limit_up_to_one_second() {
        let mut cfg = Config::from_iter(&["corral", "-y", "200ms", "/bin/true"]);
        cfg.finalize();
        assert_eq!(cfg.idle_limit, Some(Duration::from_secs(1)));
    }

    #[test]
    fn finalize_maps_single_core_to_least_loaded_selector() {
        let mut cfg = Config::from_iter(&["corral", "-1", "/bin/true"]);
        cfg.finalize();
        assert_eq!(cfg.affinity, vec![-1]);
    }

    #[test]
    fn finalize_relaxes_clone_policy_with_process_creation() {
        let mut cfg = Config::from_iter(&["corral", "--allow-create-processes", "/bin/true"]);
        cfg.finalize();
        assert!(cfg.allow_multithreading);
    }

    #[test]
    fn zero_limits_are_disabled() {
        let cfg = Config::from_iter(&["corral", "-t", "0", "-m", "0", "/bin/true"]);
        assert_eq!(cfg.real_time_limit(), None);
        assert_eq!(cfg.memory_limit_bytes(), None);
        assert_eq!(cfg.idle_limit_secs(), None);
    }

    #[test]
    fn env_overrides_replace_inherited_values() {
        env::set_var("CORRAL_ENV_TEST", "old");
        let cfg = Config::from_iter(&[
            "corral",
            "-D",
            "CORRAL_ENV_TEST=new",
            "-D",
            "CORRAL_ENV_EXTRA=1",
            "/bin/true",
        ]);
        let vars = cfg.effective_env();
        assert!(vars.contains(&"CORRAL_ENV_TEST=new".to_owned()));
        assert!(vars.contains(&"CORRAL_ENV_EXTRA=1".to_owned()));
        assert!(!vars.contains(&"CORRAL_ENV_TEST=old".to_owned()));
    }

    #[test]
    fn trailing_arguments_are_kept_verbatim() {
        let cfg = Config::from_iter(&["corral", "-x", "/bin/sh", "-c", "exit 3"]);
        assert_eq!(cfg.process_path, PathBuf::from("/bin/sh"));
        assert_eq!(cfg.process_args, vec![OsString::from("-c"), OsString::from("exit 3")]);
        assert!(cfg.propagate_exit_code);
    }
}
