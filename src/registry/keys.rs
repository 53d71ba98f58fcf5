//! Registry key layout

/// Key names derived from the configured prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLayout {
    prefix: String,
}

impl KeyLayout {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Hash of room bodies keyed by room id
    pub fn rooms(&self) -> &str {
        &self.prefix
    }

    /// Boolean flag set, or the sorted set of a number field
    pub fn field(&self, field: &str) -> String {
        format!("{}:field:{}", self.prefix, field)
    }

    /// Membership set of one string or number value
    pub fn field_value(&self, field: &str, token: &str) -> String {
        format!("{}:field:{}:{}", self.prefix, field, token)
    }

    /// Every stored room id
    pub fn room_ids(&self) -> String {
        format!("{}:ids", self.prefix)
    }

    /// Hash of process bodies keyed by process id
    pub fn processes(&self) -> String {
        format!("{}:processes", self.prefix)
    }

    /// Sorted set of process scores
    pub fn process_scores(&self) -> String {
        format!("{}:processes:score", self.prefix)
    }

    /// Topic an owning process listens on for assignments
    pub fn process_topic(&self, process_id: &str) -> String {
        format!("{}:process:{}", self.prefix, process_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let keys = KeyLayout::new("roomcaches");
        assert_eq!(keys.rooms(), "roomcaches");
        assert_eq!(keys.field("locked"), "roomcaches:field:locked");
        assert_eq!(keys.field_value("name", "arena"), "roomcaches:field:name:arena");
        assert_eq!(keys.room_ids(), "roomcaches:ids");
        assert_eq!(keys.processes(), "roomcaches:processes");
        assert_eq!(keys.process_scores(), "roomcaches:processes:score");
        assert_eq!(keys.process_topic("p1"), "roomcaches:process:p1");
    }
}
