use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RoomCapabilities: u8 {
        const CALLS       = 1 << 0;
        const THREADS     = 1 << 1;
        const DISCUSSIONS = 1 << 2;
    }
}

impl Default for RoomCapabilities {
    fn default() -> Self {
        Self::all()
    }
}

#[derive(Serialize, Deserialize)]
struct CapabilitiesWire {
    calls: bool,
    threads: bool,
    discussions: bool,
}

impl Serialize for RoomCapabilities {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        CapabilitiesWire {
            calls: self.contains(Self::CALLS),
            threads: self.contains(Self::THREADS),
            discussions: self.contains(Self::DISCUSSIONS),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RoomCapabilities {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = CapabilitiesWire::deserialize(deserializer)?;
        let mut caps = Self::empty();
        caps.set(Self::CALLS, wire.calls);
        caps.set(Self::THREADS, wire.threads);
        caps.set(Self::DISCUSSIONS, wire.discussions);
        Ok(caps)
    }
}
