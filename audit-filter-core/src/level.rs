use serde::{Deserialize, Serialize};

/// How much of a request an audit event records.
///
/// Ordered `None < Metadata < Request < RequestResponse`; the derived `Ord`
/// relies on declaration order matching that total order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum Level {
    #[default]
    None,
    Metadata,
    Request,
    RequestResponse,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::None => "None",
            Level::Metadata => "Metadata",
            Level::Request => "Request",
            Level::RequestResponse => "RequestResponse",
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_order() {
        assert!(Level::None < Level::Metadata);
        assert!(Level::Metadata < Level::Request);
        assert!(Level::Request < Level::RequestResponse);
    }

    #[test]
    fn serde_roundtrip() {
        let s = serde_json::to_string(&Level::RequestResponse).unwrap();
        assert_eq!(s, "\"RequestResponse\"");
        let back: Level = serde_json::from_str(&s).unwrap();
        assert_eq!(back, Level::RequestResponse);
    }
}
