//! Worker supervision.
//!
//! One cooperative task per configured repository, stopped through an
//! explicit watch channel rather than ambient global state. Repositories
//! are independent: a dying worker never takes its siblings down, and a
//! `keep-alive` delay restarts it instead.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;

use ferry_common::{Config, Error};

use crate::manager::Manager;

pub struct Supervisor {
    stop: watch::Sender<bool>,
    workers: JoinSet<()>,
}

impl Supervisor {
    /// Builds and starts one worker per configured repository.
    ///
    /// Configuration errors surface here, before anything runs.
    pub async fn spawn(config: &Config) -> Result<Self, Error> {
        if config.repositories.is_empty() {
            return Err(Error::InvalidConfig("no repositories configured".into()));
        }
        let (stop, _) = watch::channel(false);
        let mut workers = JoinSet::new();
        for (name, repo_cfg) in &config.repositories {
            let mut manager = Manager::from_config(config.client.clone(), name, repo_cfg).await?;
            let keep_alive = repo_cfg.keep_alive.map(Duration::from_secs);
            let mut stop_rx = stop.subscribe();
            let repository = name.clone();
            workers.spawn(async move {
                loop {
                    match manager.run(stop_rx.clone()).await {
                        Ok(()) => break,
                        Err(err) => {
                            let Some(delay) = keep_alive else {
                                tracing::error!(
                                    repository = repository.as_str(),
                                    error = %err,
                                    "worker stopped"
                                );
                                break;
                            };
                            tracing::warn!(
                                repository = repository.as_str(),
                                error = %err,
                                "restarting worker in {}s",
                                delay.as_secs()
                            );
                            tokio::select! {
                                _ = tokio::time::sleep(delay) => {}
                                _ = stop_rx.changed() => break,
                            }
                        }
                    }
                }
            });
        }
        Ok(Self { stop, workers })
    }

    /// Handle for requesting shutdown from elsewhere (e.g. a signal task).
    pub fn stop_handle(&self) -> watch::Sender<bool> {
        self.stop.clone()
    }

    /// Waits until every worker has finished on its own. Cancellation-safe:
    /// unfinished workers stay owned by the supervisor.
    pub async fn wait(&mut self) {
        while let Some(result) = self.workers.join_next().await {
            if let Err(err) = result {
                if err.is_panic() {
                    tracing::error!("worker panicked: {err}");
                }
            }
        }
    }

    /// Signals every worker to stop and waits for them to wind down.
    pub async fn shutdown(mut self) {
        let _ = self.stop.send(true);
        self.wait().await;
    }
}
