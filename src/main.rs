use std::env;
use std::fs;
use std::path::PathBuf;
use std::process::{self, Command};

use anyhow::{Context, Result};
use log::{error, info, LevelFilter};
use nix::unistd::Uid;
use structopt::StructOpt;

use corral::launch;
use corral::{bootstrap, pty, Config};

fn main() {
    let mut cfg = Config::from_args();
    cfg.finalize();
    init_logging(&cfg);

    let code = match run(cfg) {
        Ok(code) => code,
        Err(err) => {
            error!("{:#}", err);
            1
        }
    };
    process::exit(code);
}

fn init_logging(cfg: &Config) {
    let mut builder = env_logger::Builder::from_default_env();
    if cfg.quiet {
        builder.filter_level(LevelFilter::Off);
    } else if cfg.debug {
        builder.filter_level(LevelFilter::Debug);
    }
    builder.init();
}

fn run(mut cfg: Config) -> Result<i32> {
    if cfg.window {
        return restart_in_terminal();
    }

    if let Some(dir) = cfg.working_dir.take() {
        cfg.working_dir = Some(prepare_working_dir(dir)?);
    }

    let current_user = launch::current_user_name();
    let credentials = match &cfg.user {
        Some(user) if *user != current_user => {
            if Uid::effective().is_root() {
                Some(launch::lookup_user(user)?)
            } else {
                // Not allowed to change credentials directly; re-login
                // through a pseudo terminal instead.
                let user = user.clone();
                return pty::relogin(&cfg, &user);
            }
        }
        _ => None,
    };

    bootstrap::supervise(&cfg, credentials.as_ref())
}

/// `-d`: resolved against the current directory and created when missing.
fn prepare_working_dir(dir: PathBuf) -> Result<PathBuf> {
    let path = if dir.is_relative() {
        env::current_dir()
            .context("unable to get the working directory")?
            .join(dir)
    } else {
        dir
    };
    if !path.exists() {
        fs::create_dir_all(&path)
            .with_context(|| format!("error creating working directory {}", path.display()))?;
        info!("working directory {} was just created", path.display());
    }
    Ok(path)
}

/// `-w`: re-open the same command line in a fresh terminal, without `-w`.
fn restart_in_terminal() -> Result<i32> {
    let args: Vec<String> = env::args()
        .skip(1)
        .filter(|arg| arg != "-w" && arg != "--window")
        .collect();

    let mut cmd = Command::new("gnome-terminal");
    cmd.arg("-x").arg(env::current_exe().context("unable to locate self")?);
    cmd.args(&args);

    let status = cmd.status().context("unable to open a new terminal")?;
    if !status.success() {
        anyhow::bail!("terminal emulator exited with {}", status);
    }
    info!("redirected to a new terminal");
    Ok(0)
}
