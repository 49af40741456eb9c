//! Identifiers, LSNs, and row messages

use crate::cursor::PkTuple;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! id_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a fresh random id.
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

id_newtype! {
    /// Identifies one backfill job (and therefore one worker instance).
    BackfillId
}

id_newtype! {
    /// Identifies the downstream consumer the backfill feeds.
    ///
    /// The public PK-index name is derived from this id.
    ConsumerId
}

id_newtype! {
    /// Identifies one batch, assigned when its PK scan starts.
    BatchId
}

/// Source table identifier (the relation OID on the source).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableOid(pub u32);

impl fmt::Display for TableOid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Replication-stream write position. Monotone on the source.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Lsn(pub u64);

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // X/X hex form as the source reports it
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

/// One table row on its way to the SMS.
///
/// `commit_lsn` and `commit_idx` are unset until the owning batch is
/// flushed; flush stamps every surviving message with the flush call's
/// commit LSN and a dense in-batch index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowMessage {
    /// Primary key of the source row.
    pub pk: PkTuple,
    /// Row payload as fetched.
    pub record: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_lsn: Option<Lsn>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_idx: Option<u64>,
}

impl RowMessage {
    /// Create an unstamped message.
    pub fn new(pk: PkTuple, record: serde_json::Value) -> Self {
        Self {
            pk,
            record,
            commit_lsn: None,
            commit_idx: None,
        }
    }

    /// Stamp delivery ordering fields at flush time.
    pub fn stamp(&mut self, commit_lsn: Lsn, commit_idx: u64) {
        self.commit_lsn = Some(commit_lsn);
        self.commit_idx = Some(commit_idx);
    }
}
