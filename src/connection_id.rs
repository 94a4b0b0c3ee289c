use std::fmt::{Debug, Display, Formatter};
use rand::RngCore;

/// Identifies a logical multipath connection, e.g. for correlating log output of its subflows.
///  It is assigned when the connection is created and never changes.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct ConnectionId([u8; ConnectionId::LEN]);

impl ConnectionId {
    pub const LEN: usize = 16;

    pub fn random() -> ConnectionId {
        let mut raw = [0u8; Self::LEN];
        rand::thread_rng().fill_bytes(&mut raw);
        ConnectionId(raw)
    }

    pub fn from_bytes(raw: [u8; Self::LEN]) -> ConnectionId {
        ConnectionId(raw)
    }

    pub fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for b in self.as_bytes() {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl Debug for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConnectionId({})", self)
    }
}
