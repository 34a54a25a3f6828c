use serde::{Deserialize, Serialize};

/// Delivery priority of a message. Higher values are consumed first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(u8);

impl Priority {
    pub const MAX: Priority = Priority(u8::MAX);

    pub fn new(value: u8) -> Self {
        Priority(value)
    }

    pub fn high() -> Self {
        Priority(200)
    }

    pub fn normal() -> Self {
        Priority(150)
    }

    pub fn low() -> Self {
        Priority(50)
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::normal()
    }
}

impl From<u8> for Priority {
    fn from(value: u8) -> Self {
        Priority(value)
    }
}
