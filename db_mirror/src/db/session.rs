//! Session state that must survive a reconnect
//!
//! `FOREIGN_KEY_CHECKS` and open transactions belong to one server session.
//! When a handle swaps in a fresh session after a transient failure, the
//! variables it changed are replayed on the new one. An open transaction
//! cannot be carried over: a new one is started in its place and marked lost,
//! so that the following commit fails instead of half applying the table.

/// A statement that changes session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    ForeignKeyChecks(bool),
    Begin,
}

impl SessionCommand {
    pub fn sql(self) -> &'static str {
        match self {
            SessionCommand::ForeignKeyChecks(true) => "SET FOREIGN_KEY_CHECKS = 1",
            SessionCommand::ForeignKeyChecks(false) => "SET FOREIGN_KEY_CHECKS = 0",
            SessionCommand::Begin => "START TRANSACTION",
        }
    }
}

/// What a handle has done to its session so far
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    foreign_key_checks_off: bool,
    in_transaction: bool,
    transaction_lost: bool,
}

impl SessionState {
    pub fn foreign_key_checks(&self) -> bool {
        !self.foreign_key_checks_off
    }

    pub fn set_foreign_key_checks(&mut self, enabled: bool) {
        self.foreign_key_checks_off = !enabled;
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub fn begin(&mut self) {
        self.in_transaction = true;
        self.transaction_lost = false;
    }

    /// Close the current transaction. Returns `true` when its changes were
    /// lost to a reconnect and it must not be committed.
    pub fn end_transaction(&mut self) -> bool {
        let lost = self.transaction_lost;
        self.in_transaction = false;
        self.transaction_lost = false;
        lost
    }

    /// Commands that bring a fresh session to this state
    pub fn replay(&mut self) -> Vec<SessionCommand> {
        let mut commands = Vec::new();
        if self.foreign_key_checks_off {
            commands.push(SessionCommand::ForeignKeyChecks(false));
        }
        if self.in_transaction {
            self.transaction_lost = true;
            commands.push(SessionCommand::Begin);
        }
        commands
    }
}
