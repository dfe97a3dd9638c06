//! Background bundle-adjustment worker.
//!
//! `run` snapshots the map and hands the problem to a worker thread;
//! `join` blocks on the result and merges it back. The map is never read
//! or written by the worker itself, so the caller keeps exclusive access
//! between the two calls. The orchestrator joins before triggering a new
//! run and before `clear()`.

use anyhow::{anyhow, ensure, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::thread::{self, JoinHandle};
use tracing::debug;

use crate::map::SlamMap;

use super::bundle_adjustment::{
    apply_ba_solution, collect_ba_problem, solve_ba, BaConfig, BaProblem, BaSolution,
};

pub struct MapOptimizer {
    job_tx: Option<Sender<BaProblem>>,
    result_rx: Receiver<BaSolution>,
    worker: Option<JoinHandle<()>>,
    in_flight: bool,
}

impl MapOptimizer {
    /// Spawn the worker thread.
    pub fn new(config: BaConfig) -> Self {
        let (job_tx, job_rx) = bounded::<BaProblem>(1);
        let (result_tx, result_rx) = bounded::<BaSolution>(1);

        let worker = thread::spawn(move || {
            while let Ok(problem) = job_rx.recv() {
                let solution = solve_ba(&problem, &config);
                if result_tx.send(solution).is_err() {
                    break;
                }
            }
        });

        Self {
            job_tx: Some(job_tx),
            result_rx,
            worker: Some(worker),
            in_flight: false,
        }
    }

    /// Launch an optimization pass over the map's current state.
    ///
    /// Returns `Ok(false)` when the map is too small to optimize. Calling
    /// `run` while a pass is still in flight is a contract violation and
    /// fails without touching the worker.
    pub fn run(&mut self, map: &SlamMap) -> Result<bool> {
        ensure!(
            !self.in_flight,
            "bundle adjustment already running, join it first"
        );

        let Some(problem) = collect_ba_problem(map) else {
            return Ok(false);
        };

        let tx = self
            .job_tx
            .as_ref()
            .ok_or_else(|| anyhow!("optimizer worker has shut down"))?;
        tx.send(problem)
            .map_err(|_| anyhow!("optimizer worker has shut down"))?;
        self.in_flight = true;
        Ok(true)
    }

    /// Whether a pass has been launched and not yet joined.
    pub fn is_running(&self) -> bool {
        self.in_flight
    }

    /// Block until the in-flight pass completes and merge its result.
    ///
    /// No-op returning `None` when nothing is in flight.
    pub fn join(&mut self, map: &mut SlamMap) -> Option<BaSolution> {
        if !self.in_flight {
            return None;
        }
        self.in_flight = false;

        match self.result_rx.recv() {
            Ok(solution) => {
                let updated = apply_ba_solution(map, &solution);
                debug!(
                    iterations = solution.iterations,
                    initial_error = solution.initial_error,
                    final_error = solution.final_error,
                    updated, "bundle adjustment merged"
                );
                Some(solution)
            }
            Err(_) => None,
        }
    }
}

impl Drop for MapOptimizer {
    fn drop(&mut self) {
        // Closing the job channel ends the worker loop; a pending result is
        // simply dropped with the receiver.
        self.job_tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
