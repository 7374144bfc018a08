//! Operator commands recognised in any inbound message.
//!
//! A leading `/` is optional. Bare commands must be the whole message, so
//! "status?" is a command but "status of the build" is conversation.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Status,
    Doctor,
    Help,
    Jobs,
    /// `schedule <phrase>`
    Schedule(String),
    /// `unschedule <job id or prefix>`
    Unschedule(String),
    /// Archive the current transcript and start over.
    NewSession,
}

impl Command {
    pub fn parse(text: &str) -> Option<Command> {
        let trimmed = text.trim();
        let body = trimmed.strip_prefix('/').unwrap_or(trimmed).trim_start();
        if body.is_empty() {
            return None;
        }

        let (head, rest) = match body.split_once(char::is_whitespace) {
            Some((head, rest)) => (head, rest.trim()),
            None => (body, ""),
        };
        let head = head.to_lowercase();

        match head.as_str() {
            "schedule" => return Some(Command::Schedule(rest.to_string())),
            "unschedule" => return Some(Command::Unschedule(rest.to_string())),
            _ => {}
        }

        let word = body
            .trim_end_matches(|c: char| matches!(c, '.' | '!' | '?' | ',' | ';' | ':'))
            .to_lowercase();
        match word.as_str() {
            "status" => Some(Command::Status),
            "doctor" => Some(Command::Doctor),
            "help" => Some(Command::Help),
            "jobs" => Some(Command::Jobs),
            "new" | "new session" => Some(Command::NewSession),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Status => "status",
            Command::Doctor => "doctor",
            Command::Help => "help",
            Command::Jobs => "jobs",
            Command::Schedule(_) => "schedule",
            Command::Unschedule(_) => "unschedule",
            Command::NewSession => "new",
        }
    }

    /// Commands that change persisted state or reveal operator details.
    /// Remote senders need the operator identity to run these.
    pub fn is_operator_only(&self) -> bool {
        matches!(self, Command::Doctor | Command::Schedule(_) | Command::Unschedule(_))
    }
}

pub const HELP_TEXT: &str = "\
Commands (a leading / is optional):
  status               connection, uptime, affect, life stage, jobs
  doctor               operator identity, providers, transport, state dir
  jobs                 list scheduled jobs
  schedule <phrase>    e.g. schedule every weekday at 9am check the build
  unschedule <id>      remove a job by id or id prefix
  new                  archive this conversation and start fresh
  help                 this text
Prefix a message with /deep to ask for a considered answer.";
