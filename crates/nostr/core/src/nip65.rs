//! NIP-65: Relay List Metadata
//!
//! A kind 10002 event lists the relays an author reads from and writes to.
//! Clients use the write relays to find where an author's events live.
//!
//! See: <https://github.com/nostr-protocol/nips/blob/master/65.md>

use crate::nip01::Event;
use thiserror::Error;

pub const RELAY_LIST_METADATA_KIND: u16 = 10002;

pub const RELAY_TAG: &str = "r";

#[derive(Debug, Error)]
pub enum Nip65Error {
    #[error("event is not a relay list metadata event (kind {0})")]
    InvalidKind(u16),

    #[error("relay tag without url")]
    MissingUrl,
}

/// How an author uses a listed relay. No marker means both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMarker {
    Read,
    Write,
    ReadWrite,
}

impl RelayMarker {
    fn parse(marker: Option<&str>) -> Self {
        match marker {
            Some("read") => RelayMarker::Read,
            Some("write") => RelayMarker::Write,
            _ => RelayMarker::ReadWrite,
        }
    }

    pub fn can_read(self) -> bool {
        matches!(self, RelayMarker::Read | RelayMarker::ReadWrite)
    }

    pub fn can_write(self) -> bool {
        matches!(self, RelayMarker::Write | RelayMarker::ReadWrite)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEntry {
    pub url: String,
    pub marker: RelayMarker,
}

/// Parsed kind 10002 event.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RelayListMetadata {
    pub relays: Vec<RelayEntry>,
}

impl RelayListMetadata {
    pub fn from_event(event: &Event) -> Result<Self, Nip65Error> {
        if event.kind != RELAY_LIST_METADATA_KIND {
            return Err(Nip65Error::InvalidKind(event.kind));
        }

        let mut relays = Vec::new();
        for tag in event.tags.iter().filter(|t| t.first().map(String::as_str) == Some(RELAY_TAG)) {
            let url = tag.get(1).ok_or(Nip65Error::MissingUrl)?;
            relays.push(RelayEntry {
                url: url.clone(),
                marker: RelayMarker::parse(tag.get(2).map(String::as_str)),
            });
        }
        Ok(Self { relays })
    }

    pub fn read_relays(&self) -> Vec<String> {
        self.relays
            .iter()
            .filter(|r| r.marker.can_read())
            .map(|r| r.url.clone())
            .collect()
    }

    pub fn write_relays(&self) -> Vec<String> {
        self.relays
            .iter()
            .filter(|r| r.marker.can_write())
            .map(|r| r.url.clone())
            .collect()
    }
}

/// Build the `r` tag for a relay entry.
pub fn relay_tag(url: &str, marker: RelayMarker) -> Vec<String> {
    let mut tag = vec![RELAY_TAG.to_string(), url.to_string()];
    match marker {
        RelayMarker::Read => tag.push("read".to_string()),
        RelayMarker::Write => tag.push("write".to_string()),
        RelayMarker::ReadWrite => {}
    }
    tag
}
