use serde::{Deserialize, Serialize};

/// An ordered sequence of strings attached to an event. The first element
/// names the tag; the second is conventionally its primary value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Tag(pub Vec<String>);

impl Tag {
    pub fn new(values: Vec<String>) -> Self {
        Tag(values)
    }

    pub fn name(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }

    pub fn get(&self, idx: usize) -> Option<&str> {
        self.0.get(idx).map(String::as_str)
    }

    pub fn is_named(&self, name: &str) -> bool {
        self.name() == Some(name)
    }
}
