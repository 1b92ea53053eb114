//! Unit of transfer between producer and consumer

/// One entry in the transfer queue
///
/// The producer enqueues one `Value` per row and, when the scan finishes
/// while the stream is still open, exactly one trailing `End`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item<R> {
    /// A mapped row
    Value(R),
    /// End of data
    End,
}

impl<R> Item<R> {
    /// Whether this is the end marker
    pub fn is_end(&self) -> bool {
        matches!(self, Self::End)
    }

    /// The mapped row, if any
    pub fn into_value(self) -> Option<R> {
        match self {
            Self::Value(value) => Some(value),
            Self::End => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_accessors() {
        assert!(Item::<u8>::End.is_end());
        assert!(!Item::Value(1).is_end());
        assert_eq!(Item::Value("row").into_value(), Some("row"));
        assert_eq!(Item::<&str>::End.into_value(), None);
    }
}
