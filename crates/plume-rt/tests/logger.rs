use std::sync::Mutex;

use log::LevelFilter;
use plume_rt::log::{init, level_from_env};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn set_log_env(value: Option<&str>) {
    unsafe {
        match value {
            Some(value) => std::env::set_var("PLUME_LOG", value),
            None => std::env::remove_var("PLUME_LOG"),
        }
    }
}

#[test]
fn plume_log_env_selects_level() {
    let _env_guard = ENV_LOCK.lock().expect("lock env guard");
    set_log_env(None);
    assert_eq!(level_from_env(), LevelFilter::Off);
    set_log_env(Some("1"));
    assert_eq!(level_from_env(), LevelFilter::Info);
    set_log_env(Some("debug"));
    assert_eq!(level_from_env(), LevelFilter::Debug);
    set_log_env(Some("nonsense"));
    assert_eq!(level_from_env(), LevelFilter::Off);
    set_log_env(None);
}

#[test]
fn init_is_idempotent_and_tracks_env() {
    let _env_guard = ENV_LOCK.lock().expect("lock env guard");
    set_log_env(Some("warn"));
    init();
    assert_eq!(log::max_level(), LevelFilter::Warn);
    set_log_env(None);
    init();
    assert_eq!(log::max_level(), LevelFilter::Off);
    log::warn!("dropped while logging is off");
}
