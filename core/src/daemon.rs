//! Daemon: the scheduler's main loop.
//!
//! All scheduling state is mutated on the loop's thread. Other threads
//! (the CLI's signal watcher, tests) talk to it through a [`DaemonHandle`]
//! over an mpsc channel. The loop is the single consumer.
//!
//! # Main loop
//!
//! 1. Run one dispatcher tick.
//! 2. Wait up to `tick_pause` for an event; a shutdown or a dropped
//!    channel ends the loop, a wake starts the next tick early.

use std::sync::mpsc;

use tracing::{error, info};

use crate::dispatcher::Dispatcher;
use crate::error::{Result, SchedulerError};
use crate::runtime::Runtime;


/// Events that can be sent to the daemon's main loop via the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonEvent {
    /// Skip the rest of the pause and tick now.
    Wake,
    /// Finish the current tick and return from `run`.
    Shutdown,
}


/// Handle returned from `Daemon::handle()` allowing threads to send events.
#[derive(Debug, Clone)]
pub struct DaemonHandle {
    sender: mpsc::Sender<DaemonEvent>,
}

impl DaemonHandle {
    pub fn wake(&self) -> Result<()> {
        self.send(DaemonEvent::Wake)
    }

    /// Request daemon shutdown.
    pub fn shutdown(&self) -> Result<()> {
        self.send(DaemonEvent::Shutdown)
    }

    fn send(&self, event: DaemonEvent) -> Result<()> {
        self.sender
            .send(event)
            .map_err(|_| SchedulerError::DaemonStopped)
    }
}


/// Owns the runtime and the dispatcher for the life of the process.
pub struct Daemon {
    rt: Runtime,
    dispatcher: Dispatcher,
    receiver: mpsc::Receiver<DaemonEvent>,
    handle: DaemonHandle,
}

impl Daemon {
    pub fn new(rt: Runtime) -> Daemon {
        let dispatcher = Dispatcher::new(&rt);
        let (sender, receiver) = mpsc::channel();
        Daemon {
            rt,
            dispatcher,
            receiver,
            handle: DaemonHandle { sender },
        }
    }

    /// Get a handle for sending events to this daemon.
    pub fn handle(&self) -> DaemonHandle {
        self.handle.clone()
    }

    pub fn runtime(&self) -> &Runtime {
        &self.rt
    }

    pub fn runtime_mut(&mut self) -> &mut Runtime {
        &mut self.rt
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Rebuild in-memory state from the store and the results tree. Must
    /// run once before the first tick.
    pub fn initialize(&mut self) -> Result<()> {
        info!("recovering scheduler state");
        let outcome = self.dispatcher.initialize(&mut self.rt);
        self.finish_step(outcome, "recovery")?;
        info!(agents = self.dispatcher.agent_count(), "recovery complete");
        Ok(())
    }

    /// Run exactly one tick. An error is reported to the operators before
    /// it is returned.
    pub fn run_once(&mut self) -> Result<()> {
        let outcome = self.dispatcher.tick(&mut self.rt);
        self.finish_step(outcome, "tick")
    }

    /// Tick until shutdown is requested or a tick fails.
    pub fn run(&mut self) -> Result<()> {
        info!(pause_secs = self.rt.config.tick_pause_secs, "scheduler loop starting");
        loop {
            self.run_once()?;
            if self.wait() {
                break;
            }
        }
        info!(ticks = self.dispatcher.tick_count(), "scheduler loop stopped");
        self.rt.mail.flush();
        Ok(())
    }

    fn finish_step(&mut self, outcome: Result<()>, step: &str) -> Result<()> {
        if let Err(e) = &outcome {
            error!(step, error = %e, "unhandled scheduler error");
            self.rt
                .mail
                .enqueue_admin(&format!("Scheduler {} failed", step), &e.to_string());
            self.rt.mail.flush();
        }
        outcome
    }

    /// Sleep between ticks. Returns true if the loop should stop.
    fn wait(&mut self) -> bool {
        match self.receiver.recv_timeout(self.rt.config.tick_pause()) {
            Ok(DaemonEvent::Wake) => {
                // Coalesce a burst of wakes into one tick.
                self.drain_channel()
            }
            Ok(DaemonEvent::Shutdown) => true,
            Err(mpsc::RecvTimeoutError::Timeout) => false,
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                error!("daemon channel disconnected, shutting down");
                true
            }
        }
    }

    /// Drain all pending events from the channel.
    /// Returns true if a Shutdown event was received.
    fn drain_channel(&mut self) -> bool {
        loop {
            match self.receiver.try_recv() {
                Ok(DaemonEvent::Wake) => {}
                Ok(DaemonEvent::Shutdown) => return true,
                Err(mpsc::TryRecvError::Empty) => return false,
                // The daemon holds a sender itself, so this only happens
                // during teardown.
                Err(mpsc::TryRecvError::Disconnected) => return true,
            }
        }
    }
}
