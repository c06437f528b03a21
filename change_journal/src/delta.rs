use crate::common::{aligned, Error};
use crate::record::JournalRecord;
use rkyv::{check_archived_root, to_bytes, AlignedVec, Archive, Deserialize, Serialize};

/// Messages exchanged while a restarting member catches up on missed change sets.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[archive(check_bytes)]
pub enum DeltaMessage {
    /// Broadcast by a member on start: send me what I have not seen.
    Request { process_id: String },
    /// A peer's delta for `requester_id`, broadcast and ignored by everybody else.
    Response {
        requester_id: String,
        responder_id: String,
        records: Vec<JournalRecord>,
    },
}

impl DeltaMessage {
    pub fn request(process_id: impl Into<String>) -> Self {
        DeltaMessage::Request {
            process_id: process_id.into(),
        }
    }

    pub fn response(
        requester_id: impl Into<String>,
        responder_id: impl Into<String>,
        records: Vec<JournalRecord>,
    ) -> Self {
        DeltaMessage::Response {
            requester_id: requester_id.into(),
            responder_id: responder_id.into(),
            records,
        }
    }

    pub fn to_bytes(&self) -> Result<AlignedVec, Error> {
        Ok(to_bytes::<_, 1024>(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<DeltaMessage, Error> {
        let buf = aligned(bytes);
        let archived = check_archived_root::<DeltaMessage>(&buf)?;
        let message: DeltaMessage = archived.deserialize(&mut rkyv::Infallible)?;
        Ok(message)
    }
}
