//! Topic grammar: `type`, `type:instance`, `type:subtype`, `type:subtype:instance`.

use std::fmt;

use crate::error::Error;

/// Subtypes reserved by the grammar; a two-part topic's second segment is an
/// instance id unless it is one of these.
pub const RESERVED_SUBTYPES: &[&str] = &["status", "queue", "calendar", "missing"];

/// A parsed topic address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic {
    /// Integration type, e.g. `qbittorrent`.
    pub kind: String,
    /// Reserved subtype, e.g. `status`/`queue`/`calendar`/`missing`.
    pub subtype: Option<String>,
    /// Opaque instance id.
    pub instance: Option<String>,
    raw: String,
}

impl Topic {
    /// Parse a topic string per the grammar in §3/§6.
    ///
    /// Rule for a two-part topic `type:part`: `part` is a subtype if it is
    /// reserved, otherwise it is an instance id.
    pub fn parse(raw: &str) -> Result<Self, Error> {
        if raw.is_empty() {
            return Err(Error::InvalidTopic(raw.to_owned()));
        }
        let parts: Vec<&str> = raw.split(':').collect();
        let topic = match parts.as_slice() {
            [kind] => Topic {
                kind: (*kind).to_owned(),
                subtype: None,
                instance: None,
                raw: raw.to_owned(),
            },
            [kind, second] => {
                if RESERVED_SUBTYPES.contains(second) {
                    Topic {
                        kind: (*kind).to_owned(),
                        subtype: Some((*second).to_owned()),
                        instance: None,
                        raw: raw.to_owned(),
                    }
                } else {
                    Topic {
                        kind: (*kind).to_owned(),
                        subtype: None,
                        instance: Some((*second).to_owned()),
                        raw: raw.to_owned(),
                    }
                }
            }
            [kind, subtype, instance] => Topic {
                kind: (*kind).to_owned(),
                subtype: Some((*subtype).to_owned()),
                instance: Some((*instance).to_owned()),
                raw: raw.to_owned(),
            },
            _ => return Err(Error::InvalidTopic(raw.to_owned())),
        };
        if topic.kind.is_empty() {
            return Err(Error::InvalidTopic(raw.to_owned()));
        }
        Ok(topic)
    }

    /// The topic's prefix used for registering per-topic filters: just the
    /// integration type, e.g. `overseerr` for `overseerr:abc`.
    pub fn prefix(&self) -> &str {
        &self.kind
    }

    /// The original string this topic was parsed from.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl std::str::FromStr for Topic {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topic::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_type() {
        let t = Topic::parse("overseerr").unwrap();
        assert_eq!(t.kind, "overseerr");
        assert_eq!(t.subtype, None);
        assert_eq!(t.instance, None);
    }

    #[test]
    fn second_segment_reserved_is_subtype() {
        let t = Topic::parse("sonarr:queue").unwrap();
        assert_eq!(t.subtype.as_deref(), Some("queue"));
        assert_eq!(t.instance, None);
    }

    #[test]
    fn second_segment_unreserved_is_instance() {
        let t = Topic::parse("qbittorrent:abc").unwrap();
        assert_eq!(t.subtype, None);
        assert_eq!(t.instance.as_deref(), Some("abc"));
    }

    #[test]
    fn three_segments() {
        let t = Topic::parse("sonarr:queue:abc").unwrap();
        assert_eq!(t.kind, "sonarr");
        assert_eq!(t.subtype.as_deref(), Some("queue"));
        assert_eq!(t.instance.as_deref(), Some("abc"));
    }

    #[test]
    fn rejects_empty_and_overlong() {
        assert!(Topic::parse("").is_err());
        assert!(Topic::parse("a:b:c:d").is_err());
    }
}
