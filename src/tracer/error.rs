use std::io;

use nix::sys::signal::Signal;
use thiserror::Error;

/// A policy-driven abort condition with its pre-assigned exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Violation {
    #[error("Real time limit was exceeded")]
    RealTime,
    #[error("Memory (RSS) limit was exceeded")]
    Memory,
    #[error("CPU time limit was exceeded")]
    CpuTime,
    #[error("Idle time limit was exceeded")]
    Idle,
    #[error("Spawning child processes is not allowed")]
    ProcessCreation,
    #[error("Cloning processes is not allowed")]
    Cloning,
    #[error("Segmentation fault (memory access violation)")]
    SegmentationFault,
}

impl Violation {
    pub fn exit_code(self) -> i32 {
        match self {
            Violation::RealTime => 2,
            Violation::Memory => 3,
            Violation::CpuTime => 4,
            Violation::Idle => 5,
            Violation::ProcessCreation => 6,
            Violation::Cloning => 7,
            Violation::SegmentationFault => 8,
        }
    }
}

/// Anything that ends a supervised run apart from a plain tracee exit.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("{0}")]
    Violation(#[from] Violation),

    #[error("tracee was terminated by signal {0}")]
    TraceeSignaled(Signal),

    #[error("trace loop iterations limit ({limit}) exceeded")]
    IterationsExhausted { limit: i64 },

    #[error("{op} failed for pid {pid} ({command}): {source}")]
    Trace {
        op: &'static str,
        pid: i32,
        command: String,
        #[source]
        source: nix::Error,
    },

    #[error("wait failed (current pid {pid}): {source}")]
    Wait {
        pid: i32,
        #[source]
        source: io::Error,
    },

    #[error("{0}")]
    Tracer(String),
}

impl RunnerError {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunnerError::Violation(violation) => violation.exit_code(),
            _ => 1,
        }
    }
}
