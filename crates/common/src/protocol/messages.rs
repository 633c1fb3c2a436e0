use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Client to server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    ClientHello { protocol_version: String },
    Get { key: String },
    Put { key: String, value: Vec<u8> },
    /// `authenticator` must hash to `key`
    Del { key: String, authenticator: Vec<u8> },
    GetMany { keys: Vec<String> },
    PutMany { entries: BTreeMap<String, Vec<u8>> },
    DelMany { entries: BTreeMap<String, Vec<u8>> },
    Goodbye,
}

/// Server to client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    ServerHello {
        /// lz4-compressed serialized membership filter
        membership_snapshot: Option<Vec<u8>>,
    },
    VersionMismatch { server_version: String },
    Get(GetResult),
    Put(PutResult),
    Del(DelResult),
    GetMany(BTreeMap<String, GetResult>),
    PutMany(BTreeMap<String, PutResult>),
    DelMany(BTreeMap<String, DelResult>),
    /// The request made no sense in the current session state
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GetResult {
    Found(Vec<u8>),
    NotFound,
    BadKeyFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PutResult {
    Ok,
    KeyTaken,
    BadKeyFormat,
    ProtocolError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DelResult {
    Ok,
    NotTaken,
    BadKeyFormat,
    AuthIncorrect,
    ProtocolError,
}
