use crate::lock::ResourceId;
use std::fmt;

/// Transaction identity used as the lock holder.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TxId(pub u64);

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

/// Resources one transaction locks, in acquisition order.
#[derive(Debug, Hash, Eq, PartialEq, Clone, Default)]
pub struct Operation {
    pub resources: Vec<ResourceId>,
}

impl Operation {
    pub fn new(resources: Vec<ResourceId>) -> Self {
        Self { resources }
    }

    pub fn entity_id(index: usize) -> ResourceId {
        format!("entity-{}", index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!("tx-42", TxId(42).to_string());
        assert_eq!("entity-3", Operation::entity_id(3));
    }
}
