/// The five container kinds the replicator knows how to move, plus a
/// catch-all for anything else the source might report (e.g. streams,
/// HyperLogLog-backed strings masquerading as scalars aside, modules).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyKind {
    Scalar,
    Map,
    UnorderedSet,
    OrderedSet,
    List,
    Other(String),
}

impl KeyKind {
    /// Build a [`KeyKind`] from the source's `TYPE` reply. The source
    /// treats this as a run-time string tag; we turn it into an
    /// exhaustively-matched enum at the boundary so the replicator's
    /// dispatch can never silently fall through to the wrong kind.
    pub fn from_type_tag(tag: &str) -> Self {
        match tag {
            "string" => KeyKind::Scalar,
            "hash" => KeyKind::Map,
            "set" => KeyKind::UnorderedSet,
            "zset" => KeyKind::OrderedSet,
            "list" => KeyKind::List,
            other => KeyKind::Other(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_the_five_supported_kinds() {
        assert_eq!(KeyKind::from_type_tag("string"), KeyKind::Scalar);
        assert_eq!(KeyKind::from_type_tag("hash"), KeyKind::Map);
        assert_eq!(KeyKind::from_type_tag("set"), KeyKind::UnorderedSet);
        assert_eq!(KeyKind::from_type_tag("zset"), KeyKind::OrderedSet);
        assert_eq!(KeyKind::from_type_tag("list"), KeyKind::List);
    }

    #[test]
    fn anything_else_is_other() {
        assert_eq!(
            KeyKind::from_type_tag("stream"),
            KeyKind::Other("stream".to_string())
        );
    }
}
