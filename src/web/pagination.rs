use serde::{Deserialize, Serialize};

const DEFAULT_LIMIT: u64 = 50;
const MAX_LIMIT: u64 = 500;

fn default_limit() -> u64 {
    DEFAULT_LIMIT
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Pagination {
    #[serde(default = "default_limit")]
    pub limit: u64,
    #[serde(default)]
    pub offset: u64,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            offset: 0,
        }
    }
}

impl Pagination {
    pub fn new(limit: u64, offset: u64) -> Self {
        Self { limit, offset }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Zero limit falls back to the default; oversized limits are clamped.
    pub fn check(&self) -> Self {
        let limit = match self.limit {
            0 => DEFAULT_LIMIT,
            limit => limit.min(MAX_LIMIT),
        };
        Self {
            limit,
            offset: self.offset,
        }
    }
}
