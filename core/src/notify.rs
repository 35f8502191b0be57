//! Outgoing email.
//!
//! Notifications are queued during a tick and sent by [`NotificationSink::flush`]
//! at the end of it. Admin notices are folded into a single message per
//! flush. A failing mailer is logged and never stops the scheduler.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{debug, warn};


#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Email {
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
}


pub trait Mailer {
    fn send(&self, email: &Email) -> Result<(), String>;
}


/// Writes every message to the log instead of sending it.
#[derive(Debug, Default)]
pub struct LogMailer;

impl Mailer for LogMailer {
    fn send(&self, email: &Email) -> Result<(), String> {
        tracing::info!(to = ?email.to, subject = %email.subject, "email");
        Ok(())
    }
}


/// Keeps sent messages in memory. Clones share one outbox.
#[derive(Debug, Clone, Default)]
pub struct RecordingMailer {
    sent: Rc<RefCell<Vec<Email>>>,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Email> {
        self.sent.borrow().clone()
    }
}

impl Mailer for RecordingMailer {
    fn send(&self, email: &Email) -> Result<(), String> {
        self.sent.borrow_mut().push(email.clone());
        Ok(())
    }
}


pub struct NotificationSink {
    mailer: Box<dyn Mailer>,
    admins: Vec<String>,
    queued: Vec<Email>,
    admin_notes: Vec<(String, String)>,
}

impl NotificationSink {
    pub fn new(mailer: Box<dyn Mailer>, admins: Vec<String>) -> Self {
        NotificationSink {
            mailer,
            admins,
            queued: Vec::new(),
            admin_notes: Vec::new(),
        }
    }

    pub fn enqueue(&mut self, to: Vec<String>, subject: &str, body: &str) {
        if to.is_empty() {
            return;
        }
        self.queued.push(Email {
            to,
            subject: subject.to_string(),
            body: body.to_string(),
        });
    }

    /// Queue a notice for the scheduler's administrators. Logged as a
    /// warning even when no admin address is configured.
    pub fn enqueue_admin(&mut self, subject: &str, body: &str) {
        warn!(subject, "admin notification");
        self.admin_notes.push((subject.to_string(), body.to_string()));
    }

    pub fn pending(&self) -> usize {
        self.queued.len() + self.admin_notes.len()
    }

    /// Subjects of the admin notes queued since the last flush.
    pub fn admin_subjects(&self) -> Vec<&str> {
        self.admin_notes.iter().map(|(s, _)| s.as_str()).collect()
    }

    /// Send everything queued. Returns the number of messages handed to the
    /// mailer.
    pub fn flush(&mut self) -> usize {
        let mut outgoing = std::mem::take(&mut self.queued);
        let notes = std::mem::take(&mut self.admin_notes);
        if !notes.is_empty() && !self.admins.is_empty() {
            let subject = if notes.len() == 1 {
                notes[0].0.clone()
            } else {
                format!("{} scheduler notifications", notes.len())
            };
            let body = notes
                .iter()
                .map(|(subject, body)| format!("{}\n\n{}", subject, body))
                .collect::<Vec<_>>()
                .join("\n\n----\n\n");
            outgoing.push(Email {
                to: self.admins.clone(),
                subject,
                body,
            });
        }

        let mut sent = 0;
        for email in &outgoing {
            match self.mailer.send(email) {
                Ok(()) => {
                    debug!(subject = %email.subject, "email sent");
                    sent += 1;
                }
                Err(e) => warn!(subject = %email.subject, error = %e, "failed to send email"),
            }
        }
        sent
    }
}
