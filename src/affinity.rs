//! Binds a process to a set of CPU cores, with the `-1` sentinel resolved to
//! the least loaded core at call time.

use crate::procfs;

use anyhow::{bail, Context, Result};
use log::debug;
use nix::sched::{sched_setaffinity, CpuSet};
use nix::unistd::Pid;

/// Applies the configured affinity set to `pid` and returns the effective
/// core indices. An empty input set leaves the process unrestricted.
pub fn apply(set: &[i32], pid: Pid) -> Result<Vec<usize>> {
    if set.is_empty() {
        return Ok(Vec::new());
    }

    let cpu_count = procfs::online_cpu_count().context("failed to count cpus")?;

    let set = if set == [-1] {
        let least = procfs::least_loaded_cpu().unwrap_or(0);
        debug!("least loaded cpu is {}", least);
        vec![least as i32]
    } else {
        set.to_vec()
    };

    let filtered = normalize(&set, cpu_count);
    if filtered.is_empty() {
        bail!("unable to set affinity: no valid cpu index in {:?}", set);
    }

    let mut cpuset = CpuSet::new();
    for &index in &filtered {
        cpuset
            .set(index)
            .with_context(|| format!("cpu index {} does not fit the affinity mask", index))?;
    }
    sched_setaffinity(pid, &cpuset)
        .with_context(|| format!("failed to set affinity of pid {}", pid))?;

    Ok(filtered)
}

/// Drops indices outside `[0, cpu_count)`.
fn normalize(set: &[i32], cpu_count: usize) -> Vec<usize> {
    set.iter()
        .filter(|&&index| index >= 0 && (index as usize) < cpu_count)
        .map(|&index| index as usize)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_range_indices_are_dropped() {
        assert_eq!(normalize(&[0, 1, 7, -3], 4), vec![0, 1]);
        assert_eq!(normalize(&[5, 6], 4), Vec::<usize>::new());
    }

    #[test]
    fn empty_set_is_a_no_op() {
        let applied = apply(&[], nix::unistd::getpid()).unwrap();
        assert!(applied.is_empty());
    }

    #[test]
    fn invalid_set_is_rejected() {
        assert!(apply(&[4096], nix::unistd::getpid()).is_err());
    }

    #[test]
    fn own_process_can_be_pinned() {
        let applied = apply(&[-1], nix::unistd::getpid()).unwrap();
        assert_eq!(applied.len(), 1);

        // restore: allow all cores again
        let all: Vec<i32> = (0..procfs::online_cpu_count().unwrap() as i32).collect();
        apply(&all, nix::unistd::getpid()).unwrap();
    }
}
