//! Commands and replies exchanged with a datastore.

use std::borrow::Cow;
use std::fmt;

use apm_primitives::Operation;
use bytes::Bytes;

use crate::{DatastoreError, DatastoreResult};

/// Commands whose first argument is a subcommand that belongs in the operation
/// name (`CLIENT LIST` is reported as `client_list`).
const CONTAINER_COMMANDS: &[&str] = &[
    "ACL", "CLIENT", "CLUSTER", "COMMAND", "CONFIG", "FUNCTION", "LATENCY", "MEMORY", "MODULE",
    "OBJECT", "PUBSUB", "SCRIPT", "SLOWLOG", "XGROUP", "XINFO",
];

/// A datastore command: a verb followed by binary-safe arguments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command {
    verb: String,
    args: Vec<Bytes>,
}

impl Command {
    /// Starts a command with the given verb.
    #[must_use]
    pub fn new(verb: &str) -> Self {
        Self {
            verb: verb.trim().to_ascii_uppercase(),
            args: Vec::new(),
        }
    }

    /// Appends an argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<Bytes>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Builds a command from whitespace-free textual parts, e.g. `["CLIENT", "LIST"]`.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError::InvalidCommand`] when `parts` is empty or the verb
    /// is blank.
    pub fn from_parts<S: AsRef<str>>(parts: &[S]) -> DatastoreResult<Self> {
        let (verb, rest) = parts
            .split_first()
            .ok_or_else(|| DatastoreError::invalid_command("command cannot be empty"))?;
        if verb.as_ref().trim().is_empty() {
            return Err(DatastoreError::invalid_command("command verb cannot be blank"));
        }
        Ok(rest.iter().fold(Self::new(verb.as_ref()), |cmd, part| {
            cmd.arg(Bytes::copy_from_slice(part.as_ref().as_bytes()))
        }))
    }

    /// Returns the upper-cased verb.
    #[must_use]
    pub fn verb(&self) -> &str {
        &self.verb
    }

    /// Returns the arguments following the verb.
    #[must_use]
    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    /// Returns argument `idx` decoded lossily as text.
    #[must_use]
    pub fn arg_str(&self, idx: usize) -> Option<Cow<'_, str>> {
        self.args.get(idx).map(|b| String::from_utf8_lossy(b))
    }

    /// Returns the upper-cased subcommand for container commands.
    #[must_use]
    pub fn subcommand(&self) -> Option<String> {
        if CONTAINER_COMMANDS.contains(&self.verb.as_str()) {
            self.arg_str(0).map(|s| s.to_ascii_uppercase())
        } else {
            None
        }
    }

    /// Operation name used in metric names.
    ///
    /// # Errors
    ///
    /// Returns an error when the verb cannot form a valid operation name.
    pub fn operation(&self) -> apm_primitives::Result<Operation> {
        match self.subcommand() {
            Some(sub) => Operation::new(format!("{}_{sub}", self.verb)),
            None => Operation::new(&self.verb),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.verb)?;
        if let Some(sub) = self.subcommand() {
            write!(f, " {sub}")?;
        }
        Ok(())
    }
}

/// Reply returned by a datastore.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    /// Missing value.
    Nil,
    /// Simple status such as `OK` or `PONG`.
    Status(String),
    /// Integer reply.
    Integer(i64),
    /// Binary-safe string.
    Bulk(Bytes),
    /// Nested replies.
    Array(Vec<Reply>),
}

impl Reply {
    /// Returns `true` for the `OK` status.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Status(s) if s == "OK")
    }

    /// Returns the payload of a bulk reply, `None` for `Nil`.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError::UnexpectedReply`] for any other reply.
    pub fn into_optional_bytes(self, command: &str) -> DatastoreResult<Option<Bytes>> {
        match self {
            Self::Nil => Ok(None),
            Self::Bulk(bytes) => Ok(Some(bytes)),
            other => Err(DatastoreError::unexpected_reply(
                command,
                format!("expected bulk or nil, got {other:?}"),
            )),
        }
    }

    /// Returns the value of an integer reply.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError::UnexpectedReply`] for any other reply.
    pub fn into_integer(self, command: &str) -> DatastoreResult<i64> {
        match self {
            Self::Integer(n) => Ok(n),
            other => Err(DatastoreError::unexpected_reply(
                command,
                format!("expected integer, got {other:?}"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_names_are_lower_case() {
        let cmd = Command::new("get").arg("key1");
        assert_eq!(cmd.verb(), "GET");
        assert_eq!(cmd.operation().unwrap().as_str(), "get");
    }

    #[test]
    fn container_commands_include_subcommand() {
        let list = Command::from_parts(&["CLIENT", "LIST"]).unwrap();
        assert_eq!(list.operation().unwrap().as_str(), "client_list");
        let setinfo = Command::new("CLIENT").arg("setinfo").arg("LIB-NAME").arg("x");
        assert_eq!(setinfo.operation().unwrap().as_str(), "client_setinfo");
        assert_eq!(setinfo.to_string(), "CLIENT SETINFO");
    }

    #[test]
    fn empty_commands_are_rejected() {
        let empty: [&str; 0] = [];
        assert!(Command::from_parts(&empty).is_err());
        assert!(Command::from_parts(&[" "]).is_err());
    }

    #[test]
    fn reply_conversions() {
        assert!(Reply::Status("OK".into()).is_ok());
        assert_eq!(Reply::Nil.into_optional_bytes("GET").unwrap(), None);
        assert!(Reply::Integer(1).into_optional_bytes("GET").is_err());
        assert_eq!(Reply::Integer(2).into_integer("PUBLISH").unwrap(), 2);
    }
}
