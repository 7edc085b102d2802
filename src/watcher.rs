use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{error, info, warn};

use crate::config;
use crate::handler::Handler;

/// Watch the config file and reload the handler state on change. Runs
/// on a dedicated thread so the watcher outlives any async lifetime
/// concerns.
pub fn spawn(path: PathBuf, handler: Arc<Handler>) {
    thread::spawn(move || {
        if let Err(err) = run_watcher(path, handler) {
            error!(target = "watcher", error = %err, "config watcher exited with error");
        }
    });
}

fn run_watcher(path: PathBuf, handler: Arc<Handler>) -> notify::Result<()> {
    let (tx, rx) = std::sync::mpsc::channel();
    let mut watcher: RecommendedWatcher = Watcher::new(tx, Config::default())?;
    watcher.watch(&path, RecursiveMode::NonRecursive)?;

    info!(target = "watcher", path = %path.display(), "config watcher started");

    for res in rx {
        match res {
            Ok(_event) => {
                // Retry a few times to ride out truncate+write races
                let mut retries = 3;
                while retries > 0 {
                    let reloaded = config::load_config(&path)
                        .and_then(|conf| config::build_state(&conf))
                        .and_then(|state| handler.apply_update(state.into()));
                    match reloaded {
                        Ok(()) => {
                            info!(target = "watcher", path = %path.display(), "config reloaded");
                            break;
                        }
                        Err(err) => {
                            retries -= 1;
                            if retries == 0 {
                                warn!(
                                    target = "watcher",
                                    path = %path.display(),
                                    error = %err,
                                    "config reload failed, keeping old config"
                                );
                            } else {
                                std::thread::sleep(std::time::Duration::from_millis(50));
                            }
                        }
                    }
                }
            }
            Err(err) => {
                warn!(target = "watcher", error = %err, "watcher event error");
            }
        }
    }
    Ok(())
}
