//! Throttling of new agents.
//!
//! Two ceilings apply to process-bearing agents only: the number started
//! and not yet done, and the number newly started in one tick. Agents with
//! no worker processes are always admitted. Once either ceiling refuses an
//! agent, the rest of the tick refuses every process-bearing agent so a
//! small agent cannot jump ahead of a large one that was held back.

use tracing::debug;

use crate::config::SchedulerConfig;


#[derive(Debug)]
pub struct Admission {
    max_running: usize,
    max_per_tick: usize,
    running: usize,
    started_this_tick: usize,
    blocked: bool,
}

impl Admission {
    /// `running` counts process-bearing agents already started.
    pub fn new(config: &SchedulerConfig, running: usize) -> Admission {
        Admission {
            max_running: config.max_running_agents,
            max_per_tick: config.max_agents_started_per_tick,
            running,
            started_this_tick: 0,
            blocked: false,
        }
    }

    /// Whether an agent needing `num_processes` slots may start now. An
    /// admitted agent is counted immediately.
    pub fn try_start(&mut self, num_processes: usize) -> bool {
        if num_processes == 0 {
            return true;
        }
        if self.blocked {
            return false;
        }
        if self.running >= self.max_running {
            debug!(running = self.running, max = self.max_running, "running agent limit reached");
            self.blocked = true;
            return false;
        }
        if self.started_this_tick >= self.max_per_tick {
            debug!(started = self.started_this_tick, max = self.max_per_tick, "per-tick start limit reached");
            self.blocked = true;
            return false;
        }
        self.running += 1;
        self.started_this_tick += 1;
        true
    }

    pub fn started_this_tick(&self) -> usize {
        self.started_this_tick
    }
}
