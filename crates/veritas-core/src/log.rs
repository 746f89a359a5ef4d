use serde::{Deserialize, Serialize};

use crate::errors::LogError;
use crate::messages::{Message, TailPatch};

/// Ordered, append-only message sequence for one session.
///
/// Insertion order is the only ordering signal. The one exception to
/// append-only is [`MessageLog::update_last`], which fills in the tail while
/// its content is still streaming.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageLog(Vec<Message>);

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, message: Message) {
        self.0.push(message);
    }

    /// Patch the most recent message. Rejected unless the tail's type
    /// accepts this kind of incremental content.
    pub fn update_last(&mut self, patch: TailPatch) -> Result<(), LogError> {
        let tail = self.0.last_mut().ok_or(LogError::Empty)?;
        if !tail.payload.accepts(&patch) {
            return Err(LogError::NotPatchable {
                kind: tail.kind(),
                patch: patch.name(),
            });
        }
        tail.apply(patch);
        Ok(())
    }

    pub fn snapshot(&self) -> &[Message] {
        &self.0
    }

    pub fn last(&self) -> Option<&Message> {
        self.0.last()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Message> {
        self.0.iter()
    }
}

impl From<Vec<Message>> for MessageLog {
    fn from(messages: Vec<Message>) -> Self {
        Self(messages)
    }
}

impl<'a> IntoIterator for &'a MessageLog {
    type Item = &'a Message;
    type IntoIter = std::slice::Iter<'a, Message>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
