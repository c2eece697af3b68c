use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use arc_swap::ArcSwap;
use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{error, info, warn};

use crate::config;
use crate::fanout::Fanout;
use crate::metrics::Metrics;

pub fn spawn(path: PathBuf, engine: Arc<ArcSwap<Fanout>>, metrics: Arc<Metrics>) {
    // A blocking thread owns the watcher to sidestep async lifetime issues.
    thread::spawn(move || {
        if let Err(err) = run_watcher(path, engine, metrics) {
            error!(target = "watcher", error = %err, "config watcher exited with error");
        }
    });
}

fn run_watcher(
    path: PathBuf,
    engine: Arc<ArcSwap<Fanout>>,
    metrics: Arc<Metrics>,
) -> notify::Result<()> {
    let (tx, rx) = std::sync::mpsc::channel();
    let mut watcher: RecommendedWatcher = Watcher::new(tx, Config::default())?;
    watcher.watch(&path, RecursiveMode::NonRecursive)?;

    info!(target = "watcher", path = %path.display(), "config watcher started");

    for res in rx {
        match res {
            Ok(_event) => {
                // Simple retry mechanism to handle file write races (e.g. truncate+write)
                let mut retries = 3;
                while retries > 0 {
                    match config::load_config(&path)
                        .and_then(|cfg| Fanout::from_config(&cfg, Arc::clone(&metrics)))
                    {
                        Ok(new_engine) => {
                            engine.store(Arc::new(new_engine));
                            info!(target = "watcher", path = %path.display(), "config reloaded");
                            break;
                        }
                        Err(err) => {
                            retries -= 1;
                            if retries == 0 {
                                warn!(target = "watcher", path = %path.display(), error = %err, "config reload failed, keeping old config");
                            } else {
                                // Wait a bit and retry
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
