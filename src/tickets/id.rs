//! Ticket identifiers: `<PREFIX>-<counter>-<random>[-<suffix>]`.
//!
//! The counter makes identifiers unique within the process, the 256-bit random segment
//! makes them unguessable, and the optional suffix names the issuing node.

use std::sync::atomic::{AtomicU64, Ordering};

use super::TicketKind;
use crate::crypto::{CryptoError, random_token};

#[derive(Debug)]
pub struct TicketIdGenerator {
    counter: AtomicU64,
    suffix: Option<String>,
}

impl TicketIdGenerator {
    #[must_use]
    pub fn new(suffix: Option<String>) -> Self {
        Self {
            counter: AtomicU64::new(1),
            suffix: suffix.filter(|s| !s.trim().is_empty()),
        }
    }

    #[must_use]
    pub fn suffix(&self) -> Option<&str> {
        self.suffix.as_deref()
    }

    /// # Errors
    /// Returns an error if the OS random generator fails.
    pub fn next(&self, kind: TicketKind) -> Result<String, CryptoError> {
        self.next_with_prefix(kind.prefix())
    }

    /// Identifier with an arbitrary prefix (`PGTIOU`).
    ///
    /// # Errors
    /// Returns an error if the OS random generator fails.
    pub fn next_with_prefix(&self, prefix: &str) -> Result<String, CryptoError> {
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        let random = random_token()?;
        Ok(match &self.suffix {
            Some(suffix) => format!("{prefix}-{count}-{random}-{suffix}"),
            None => format!("{prefix}-{count}-{random}"),
        })
    }
}

impl Default for TicketIdGenerator {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_carry_prefix_and_suffix() {
        let ids = TicketIdGenerator::new(Some("node1".to_string()));
        let id = ids.next(TicketKind::Service).unwrap();
        assert!(id.starts_with("ST-1-"));
        assert!(id.ends_with("-node1"));
        assert_eq!(TicketKind::from_id(&id), Some(TicketKind::Service));
    }

    #[test]
    fn ids_are_unique() {
        let ids = TicketIdGenerator::default();
        let generated: HashSet<String> = (0..500)
            .map(|_| ids.next(TicketKind::TicketGranting).unwrap())
            .collect();
        assert_eq!(generated.len(), 500);
    }

    #[test]
    fn blank_suffix_is_ignored() {
        let ids = TicketIdGenerator::new(Some("  ".to_string()));
        assert_eq!(ids.suffix(), None);
        let id = ids.next_with_prefix("PGTIOU").unwrap();
        assert!(id.starts_with("PGTIOU-1-"));
    }
}
