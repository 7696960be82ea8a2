//! Server protocol states.

use std::fmt;

use crate::message::Command;

/// Server side of the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerState {
    /// Opening key sent, waiting for the client's
    Open,
    /// Session keys ready, waiting for a master secret
    Session,
    /// Master secret held, waiting for LOGIN or CREATION
    Select,
    /// Account open, waiting for the layer configuration
    Configuration,
    /// Serving data operations
    Ready,
    /// Terminal
    Closed,
}

impl ServerState {
    /// State name for logs
    pub fn name(&self) -> &'static str {
        match self {
            ServerState::Open => "Open",
            ServerState::Session => "Session",
            ServerState::Select => "Select",
            ServerState::Configuration => "Configuration",
            ServerState::Ready => "Ready",
            ServerState::Closed => "Closed",
        }
    }

    /// Whether `command` may arrive in this state
    pub fn accepts(&self, command: Command) -> bool {
        match self {
            ServerState::Session => command == Command::Session,
            ServerState::Select => matches!(command, Command::Login | Command::Creation),
            ServerState::Configuration => command == Command::Configuration,
            ServerState::Ready => matches!(
                command,
                Command::AddData | Command::DeleteData | Command::SearchData
            ),
            ServerState::Open | ServerState::Closed => false,
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_table() {
        assert!(ServerState::Session.accepts(Command::Session));
        assert!(!ServerState::Session.accepts(Command::Login));
        assert!(ServerState::Select.accepts(Command::Creation));
        assert!(!ServerState::Select.accepts(Command::AddData));
        assert!(ServerState::Ready.accepts(Command::SearchData));
        assert!(!ServerState::Ready.accepts(Command::Configuration));
        assert!(!ServerState::Closed.accepts(Command::Session));
    }
}
