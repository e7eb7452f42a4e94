use byteorder::{ByteOrder, LittleEndian};
use chrono::{DateTime, Utc};
use rkyv::{AlignedVec, Archive, Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    Identifier, WorkerID,
};

/// msg_type (1) | sent_at (8) | len (4)
pub const HEADER_LEN: usize = 1 + 8 + 4;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageType {
    /// Asks every generator to create a list for an identifier
    CreateList = 1,
    /// Asks for the list (or lists) belonging to an identifier to be sent
    /// to a destination
    RequestList = 2,
    /// One list, as produced by one generator
    IntList = 3,
    /// The gathered and reversed lists for one identifier
    ReversedList = 4,
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(MessageType::CreateList),
            2 => Ok(MessageType::RequestList),
            3 => Ok(MessageType::IntList),
            4 => Ok(MessageType::ReversedList),
            other => Err(Error::UnknownMessageType(other)),
        }
    }
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct CreateList {
    pub list_id: Identifier,
    pub list_size: u16,
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct RequestList {
    pub list_id: Identifier,
    /// Where the answer should go. Carried in the request so replies can be
    /// routed back without a directory lookup.
    pub destination: String,
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct IntList {
    pub list_id: Identifier,
    pub generator_id: WorkerID,
    pub list: Vec<i32>,
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct ReversedList {
    pub list_id: Identifier,
    pub reverser_id: WorkerID,
    /// One reversed list per generator that answered, in arrival order.
    pub lists: Vec<IntList>,
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub enum Message {
    CreateList(CreateList),
    RequestList(RequestList),
    IntList(IntList),
    ReversedList(ReversedList),
}

impl Message {
    pub fn msg_type(&self) -> MessageType {
        match self {
            Message::CreateList(_) => MessageType::CreateList,
            Message::RequestList(_) => MessageType::RequestList,
            Message::IntList(_) => MessageType::IntList,
            Message::ReversedList(_) => MessageType::ReversedList,
        }
    }

    pub fn list_id(&self) -> Identifier {
        match self {
            Message::CreateList(m) => m.list_id,
            Message::RequestList(m) => m.list_id,
            Message::IntList(m) => m.list_id,
            Message::ReversedList(m) => m.list_id,
        }
    }
}

/// A buffer containing a msg_type | sent_at | len | msg concatenation. This
/// is the only thing a transport ever sees.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame(pub Vec<u8>);

impl Frame {
    pub fn encode(msg: &Message) -> Result<Self> {
        let payload = rkyv::to_bytes::<_, 256>(msg)
            .map_err(|_| Error::CouldNotEncodeMessage)?;
        let len = u32::try_from(payload.len())
            .map_err(|_| Error::MessageLengthOverflowed)?;

        let mut header = [0u8; HEADER_LEN];
        header[0] = msg.msg_type() as u8;
        LittleEndian::write_i64(
            &mut header[1..9],
            Utc::now().timestamp_micros(),
        );
        LittleEndian::write_u32(&mut header[9..], len);

        let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
        buf.extend_from_slice(&header);
        buf.extend_from_slice(&payload);
        Ok(Self(buf))
    }

    /// Reads the message type without touching the payload.
    pub fn msg_type(&self) -> Result<MessageType> {
        match self.0.first() {
            Some(byte) => MessageType::try_from(*byte),
            None => Err(Error::TruncatedFrame(0)),
        }
    }

    /// Decodes the frame into the time it was sent and its message.
    pub fn decode(&self) -> Result<(DateTime<Utc>, Message)> {
        if self.0.len() < HEADER_LEN {
            Err(Error::TruncatedFrame(self.0.len()))?
        }
        let msg_type = self.msg_type()?;
        let sent_at = LittleEndian::read_i64(&self.0[1..9]);
        let len = LittleEndian::read_u32(&self.0[9..HEADER_LEN]);

        let end = HEADER_LEN
            .checked_add(len as usize)
            .ok_or(Error::MessageLengthOverflowed)?;
        if self.0.len() < end {
            Err(Error::TruncatedFrame(self.0.len()))?
        }

        // rkyv needs the archive to be aligned, which a slice past the
        // header isn't
        let mut payload = AlignedVec::with_capacity(len as usize);
        payload.extend_from_slice(&self.0[HEADER_LEN..end]);
        let msg: Message = rkyv::from_bytes(&payload)
            .map_err(|_| Error::CouldNotDecodeMessage)?;
        if msg.msg_type() != msg_type {
            Err(Error::CouldNotDecodeMessage)?
        }

        let sent_at = DateTime::<Utc>::from_timestamp_micros(sent_at)
            .ok_or(Error::CouldNotDecodeMessage)?;
        Ok((sent_at, msg))
    }
}

impl TryFrom<&Message> for Frame {
    type Error = Error;

    fn try_from(msg: &Message) -> Result<Self> {
        Frame::encode(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reversed() -> Message {
        Message::ReversedList(ReversedList {
            list_id: 42,
            reverser_id: 1,
            lists: vec![
                IntList {
                    list_id: 42,
                    generator_id: 0,
                    list: vec![3, 2, 1],
                },
                IntList {
                    list_id: 42,
                    generator_id: 1,
                    list: vec![],
                },
            ],
        })
    }

    #[test]
    fn frame_carries_message_and_timestamp() {
        let before = Utc::now();
        let frame = Frame::encode(&reversed()).unwrap();
        assert_eq!(frame.msg_type().unwrap(), MessageType::ReversedList);

        let (sent_at, msg) = frame.decode().unwrap();
        assert_eq!(msg, reversed());
        assert_eq!(msg.list_id(), 42);
        assert!(sent_at.timestamp_micros() >= before.timestamp_micros());
        assert!(sent_at <= Utc::now());
    }

    #[test]
    fn header_only_frames_are_truncated() {
        let frame = Frame::encode(&reversed()).unwrap();
        let short = Frame(frame.0[..HEADER_LEN + 2].to_vec());
        assert!(matches!(short.decode(), Err(Error::TruncatedFrame(_))));
        assert!(matches!(
            Frame(vec![3, 0, 0]).decode(),
            Err(Error::TruncatedFrame(3))
        ));
        assert!(matches!(Frame(vec![]).msg_type(), Err(Error::TruncatedFrame(0))));
    }

    #[test]
    fn unknown_type_byte_is_rejected() {
        let mut frame = Frame::encode(&reversed()).unwrap();
        frame.0[0] = 0x7f;
        assert!(matches!(
            frame.decode(),
            Err(Error::UnknownMessageType(0x7f))
        ));
    }

    #[test]
    fn type_byte_must_match_payload() {
        let mut frame = Frame::encode(&Message::CreateList(CreateList {
            list_id: 7,
            list_size: 10,
        }))
        .unwrap();
        frame.0[0] = MessageType::IntList as u8;
        assert!(matches!(frame.decode(), Err(Error::CouldNotDecodeMessage)));
    }
}
