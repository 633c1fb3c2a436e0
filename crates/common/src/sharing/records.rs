use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Local reference to a peer ("friend") this device shares with.
///
/// Never serialized into a record; it is attached after decryption from
/// whatever context the record was fetched in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FriendRef(pub Uuid);

impl FriendRef {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for FriendRef {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FriendRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// How much detail of a record is shared
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Granularity {
    /// Everything, including per-sample data
    Fine,
    /// Summary fields only
    Coarse,
}

/// Wire tag of a record variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordKind {
    LocationTrack = 1,
    StepCount = 2,
}

type Decoder = fn(&[u8]) -> Result<Record, bincode::Error>;

fn decode_location_track(body: &[u8]) -> Result<Record, bincode::Error> {
    bincode::deserialize(body).map(Record::LocationTrack)
}

fn decode_step_count(body: &[u8]) -> Result<Record, bincode::Error> {
    bincode::deserialize(body).map(Record::StepCount)
}

impl RecordKind {
    /// Tag -> decoder registry. New variants register here.
    const REGISTRY: &'static [(RecordKind, Decoder)] = &[
        (RecordKind::LocationTrack, decode_location_track),
        (RecordKind::StepCount, decode_step_count),
    ];

    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::lookup(tag).map(|(kind, _)| *kind)
    }

    fn lookup(tag: u8) -> Option<&'static (RecordKind, Decoder)> {
        Self::REGISTRY.iter().find(|(kind, _)| kind.tag() == tag)
    }
}

/// Anything that can be encrypted and shared as a single record
pub trait Shareable {
    fn kind(&self) -> RecordKind;

    /// Variant body (without tag) at the requested granularity
    fn body(&self, granularity: Granularity) -> Result<Vec<u8>, bincode::Error>;

    fn owner(&self) -> Option<&FriendRef>;

    fn description(&self) -> Option<&str>;

    /// `tag || body`, the form that gets encrypted
    fn to_bytes(&self, granularity: Granularity) -> Result<Vec<u8>, bincode::Error> {
        let body = self.body(granularity)?;
        let mut out = Vec::with_capacity(1 + body.len());
        out.push(self.kind().tag());
        out.extend_from_slice(&body);
        Ok(out)
    }
}

/// How a location track was recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackMode {
    Walking,
    Running,
    Cycling,
    Driving,
    Other,
}

/// One GPS fix
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    /// Unix milliseconds
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationTrack {
    pub name: String,
    pub mode: TrackMode,
    /// Unix milliseconds
    pub timestamp_start: i64,
    /// Unix milliseconds
    pub timestamp_end: i64,
    pub positions: Vec<Position>,
    pub description: Option<String>,
    #[serde(skip)]
    pub owner: Option<FriendRef>,
}

impl Shareable for LocationTrack {
    fn kind(&self) -> RecordKind {
        RecordKind::LocationTrack
    }

    fn body(&self, granularity: Granularity) -> Result<Vec<u8>, bincode::Error> {
        match granularity {
            Granularity::Fine => bincode::serialize(self),
            Granularity::Coarse => bincode::serialize(&LocationTrack {
                positions: Vec::new(),
                ..self.clone()
            }),
        }
    }

    fn owner(&self) -> Option<&FriendRef> {
        self.owner.as_ref()
    }

    fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
}

/// Steps taken within one interval
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepInterval {
    /// Unix milliseconds
    pub timestamp: i64,
    pub steps: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepCount {
    /// Unix milliseconds
    pub timestamp_start: i64,
    /// Unix milliseconds
    pub timestamp_end: i64,
    pub total_steps: u64,
    pub intervals: Vec<StepInterval>,
    pub description: Option<String>,
    #[serde(skip)]
    pub owner: Option<FriendRef>,
}

impl Shareable for StepCount {
    fn kind(&self) -> RecordKind {
        RecordKind::StepCount
    }

    fn body(&self, granularity: Granularity) -> Result<Vec<u8>, bincode::Error> {
        match granularity {
            Granularity::Fine => bincode::serialize(self),
            Granularity::Coarse => bincode::serialize(&StepCount {
                intervals: Vec::new(),
                ..self.clone()
            }),
        }
    }

    fn owner(&self) -> Option<&FriendRef> {
        self.owner.as_ref()
    }

    fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
}

/// Every record variant that can travel through the sharing scheme
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    LocationTrack(LocationTrack),
    StepCount(StepCount),
}

impl From<LocationTrack> for Record {
    fn from(track: LocationTrack) -> Self {
        Record::LocationTrack(track)
    }
}

impl From<StepCount> for Record {
    fn from(steps: StepCount) -> Self {
        Record::StepCount(steps)
    }
}

impl Record {
    fn inner(&self) -> &dyn Shareable {
        match self {
            Record::LocationTrack(track) => track,
            Record::StepCount(steps) => steps,
        }
    }

    /// Decode `tag || body` by dispatching on the tag
    pub fn from_bytes(bytes: &[u8]) -> Result<Record, bincode::Error> {
        let (tag, body) = bytes.split_first().ok_or_else(|| {
            Box::new(bincode::ErrorKind::Custom("empty record".to_string()))
        })?;
        let (_, decode) = RecordKind::lookup(*tag).ok_or_else(|| {
            Box::new(bincode::ErrorKind::Custom(format!(
                "unknown record tag {}",
                tag
            )))
        })?;
        decode(body)
    }

    pub fn set_owner(&mut self, owner: Option<FriendRef>) {
        match self {
            Record::LocationTrack(track) => track.owner = owner,
            Record::StepCount(steps) => steps.owner = owner,
        }
    }
}

impl Shareable for Record {
    fn kind(&self) -> RecordKind {
        self.inner().kind()
    }

    fn body(&self, granularity: Granularity) -> Result<Vec<u8>, bincode::Error> {
        self.inner().body(granularity)
    }

    fn owner(&self) -> Option<&FriendRef> {
        match self {
            Record::LocationTrack(track) => track.owner.as_ref(),
            Record::StepCount(steps) => steps.owner.as_ref(),
        }
    }

    fn description(&self) -> Option<&str> {
        match self {
            Record::LocationTrack(track) => track.description.as_deref(),
            Record::StepCount(steps) => steps.description.as_deref(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn track() -> LocationTrack {
        LocationTrack {
            name: "morning run".to_string(),
            mode: TrackMode::Running,
            timestamp_start: 1_700_000_000_000,
            timestamp_end: 1_700_000_360_000,
            positions: vec![Position {
                latitude: 53.55,
                longitude: 9.99,
                altitude: 12.0,
                timestamp: 1_700_000_000_000,
            }],
            description: Some("along the river".to_string()),
            owner: None,
        }
    }

    #[test]
    fn test_tag_registry() {
        assert_eq!(RecordKind::from_tag(1), Some(RecordKind::LocationTrack));
        assert_eq!(RecordKind::from_tag(2), Some(RecordKind::StepCount));
        assert_eq!(RecordKind::from_tag(0), None);
        assert_eq!(RecordKind::from_tag(200), None);
    }

    #[test]
    fn test_dispatch_on_tag() {
        let bytes = track().to_bytes(Granularity::Fine).unwrap();
        assert_eq!(bytes[0], RecordKind::LocationTrack.tag());
        assert_eq!(Record::from_bytes(&bytes).unwrap(), Record::LocationTrack(track()));
    }

    #[test]
    fn test_coarse_drops_positions() {
        let bytes = track().to_bytes(Granularity::Coarse).unwrap();
        match Record::from_bytes(&bytes).unwrap() {
            Record::LocationTrack(decoded) => {
                assert!(decoded.positions.is_empty());
                assert_eq!(decoded.name, "morning run");
                assert_eq!(decoded.description(), Some("along the river"));
            }
            other => panic!("unexpected variant {:?}", other),
        }
    }

    #[test]
    fn test_owner_not_serialized() {
        let mut owned = track();
        owned.owner = Some(FriendRef::new());
        let bytes = owned.to_bytes(Granularity::Fine).unwrap();
        assert_eq!(Record::from_bytes(&bytes).unwrap().owner(), None);
    }

    #[test]
    fn test_unknown_and_empty_input() {
        assert!(Record::from_bytes(&[]).is_err());
        assert!(Record::from_bytes(&[99, 1, 2, 3]).is_err());
    }
}
