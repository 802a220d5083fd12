use std::fmt::{Display, Formatter};

/// Identifies one logical message on the wire. Ids are drawn at random per message, there is no
///  sequence or ordering between them.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct MessageId(i32);

impl Display for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl MessageId {
    pub fn from_raw(value: i32) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> i32 {
        self.0
    }

    pub fn random() -> Self {
        Self(rand::random())
    }
}
