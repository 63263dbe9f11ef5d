use std::sync::{Mutex, MutexGuard, Once};

use corral::Config;
use structopt::StructOpt;

pub fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        dotenv::dotenv().ok();
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// The trace loop waits on any child of the whole process, so two
/// supervised runs inside one test binary would steal each other's wait
/// statuses. Every test that spawns a tracee holds this lock.
pub fn tracer_lock() -> MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub fn config(args: &[&str]) -> Config {
    let mut argv = vec!["corral"];
    argv.extend_from_slice(args);
    let mut cfg = Config::from_iter(argv);
    cfg.finalize();
    cfg
}
