use std::fmt;

use serde::{Deserialize, Serialize};

pub type ContainerId = u32;
pub type PageNo = u32;

/// Identifies a page by container and page number. Ordering is lexicographic
/// on `(container, page)`; container 0 is reserved and never names a page.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct PageId {
    container: ContainerId,
    page: PageNo,
}

impl PageId {
    pub const INVALID: PageId = PageId {
        container: 0,
        page: 0,
    };
    pub const ENCODED_LEN: usize = 8;

    pub const fn new(container: ContainerId, page: PageNo) -> Self {
        Self { container, page }
    }

    pub fn container(&self) -> ContainerId {
        self.container
    }

    pub fn page(&self) -> PageNo {
        self.page
    }

    pub fn is_valid(&self) -> bool {
        self.container != 0
    }

    /// Big-endian container number followed by big-endian page number.
    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[..4].copy_from_slice(&self.container.to_be_bytes());
        out[4..].copy_from_slice(&self.page.to_be_bytes());
        out
    }

    /// Returns `None` for the "no page" encoding (container 0).
    pub fn decode(bytes: &[u8; Self::ENCODED_LEN]) -> Option<Self> {
        let container = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let page = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        (container != 0).then_some(Self { container, page })
    }

    /// Encodes an optional link, writing zeros for `None`.
    pub fn encode_opt(id: Option<PageId>) -> [u8; Self::ENCODED_LEN] {
        id.map(|id| id.encode()).unwrap_or([0u8; Self::ENCODED_LEN])
    }

    pub fn read_from(buf: &[u8]) -> Option<Self> {
        let mut raw = [0u8; Self::ENCODED_LEN];
        raw.copy_from_slice(&buf[..Self::ENCODED_LEN]);
        Self::decode(&raw)
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.container, self.page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_is_big_endian_and_eight_bytes() {
        let id = PageId::new(0x0102_0304, 0x0a0b_0c0d);
        let encoded = id.encode();
        assert_eq!(encoded.len(), 8);
        assert_eq!(encoded, [1, 2, 3, 4, 0x0a, 0x0b, 0x0c, 0x0d]);
        assert_eq!(PageId::decode(&encoded), Some(id));
    }

    #[test]
    fn zero_container_decodes_to_none() {
        assert_eq!(PageId::decode(&[0, 0, 0, 0, 0, 0, 0, 9]), None);
        assert_eq!(PageId::decode(&PageId::encode_opt(None)), None);
        assert!(!PageId::INVALID.is_valid());
    }

    #[test]
    fn round_trips_across_ranges() {
        for container in [1u32, 7, u32::MAX] {
            for page in [0u32, 1, 4242, u32::MAX] {
                let id = PageId::new(container, page);
                assert_eq!(PageId::decode(&id.encode()), Some(id));
            }
        }
    }

    #[test]
    fn ordering_is_lexicographic() {
        assert!(PageId::new(1, 900) < PageId::new(2, 1));
        assert!(PageId::new(2, 1) < PageId::new(2, 2));
        // encoded order matches logical order
        assert!(PageId::new(1, 900).encode() < PageId::new(2, 1).encode());
    }
}
