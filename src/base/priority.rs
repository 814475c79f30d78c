/// Request priority (matches Chromium's RequestPriority).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum RequestPriority {
    Throttled = 0,
    Idle = 1,
    Lowest = 2,
    Low = 3,
    #[default]
    Medium = 4,
    Highest = 5,
}

impl RequestPriority {
    pub const MINIMUM: RequestPriority = RequestPriority::Throttled;
    pub const MAXIMUM: RequestPriority = RequestPriority::Highest;

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestPriority::Throttled => "THROTTLED",
            RequestPriority::Idle => "IDLE",
            RequestPriority::Lowest => "LOWEST",
            RequestPriority::Low => "LOW",
            RequestPriority::Medium => "MEDIUM",
            RequestPriority::Highest => "HIGHEST",
        }
    }
}

impl std::fmt::Display for RequestPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
