//! Binary value frames: msgpack-encoded 4-tuples `[topicId, serverTime,
//! typeNum, value]`, possibly several concatenated back to back in one
//! WebSocket binary message.

use rmpv::Value as Wire;
use std::io::Cursor;

/// One decoded binary value frame.
///
/// `topic_id == -1` is the RTT heartbeat reply; any other value (including
/// 0, used by the optimistic publish resolver) addresses an announced topic.
#[derive(Debug, Clone, PartialEq)]
pub struct BinaryFrame {
    pub topic_id: i64,
    pub server_time: u64,
    pub type_num: u8,
    pub value: Wire,
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("msgpack encode error: {0}")]
    Encode(#[from] rmpv::encode::Error),
    #[error("msgpack decode error: {0}")]
    Decode(#[from] rmpv::decode::Error),
    #[error("binary frame was not a 4-element array")]
    WrongShape,
    #[error("topic id in frame was not an integer")]
    BadTopicId,
    #[error("server time in frame was not an unsigned integer")]
    BadServerTime,
    #[error("type number in frame was not a small integer")]
    BadTypeNum,
}

impl BinaryFrame {
    pub fn new(topic_id: i64, server_time: u64, type_num: u8, value: Wire) -> Self {
        BinaryFrame {
            topic_id,
            server_time,
            type_num,
            value,
        }
    }

    /// Encode this single frame to msgpack bytes.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let wire = Wire::Array(vec![
            Wire::Integer(self.topic_id.into()),
            Wire::Integer(self.server_time.into()),
            Wire::Integer(self.type_num.into()),
            self.value.clone(),
        ]);
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &wire)?;
        Ok(buf)
    }

    /// Decode every frame packed into one WebSocket binary message. A single
    /// binary message may carry several concatenated msgpack-encoded frames.
    pub fn decode_all(bytes: &[u8]) -> Result<Vec<BinaryFrame>, FrameError> {
        let mut cursor = Cursor::new(bytes);
        let mut frames = Vec::new();
        while (cursor.position() as usize) < bytes.len() {
            let wire = rmpv::decode::read_value(&mut cursor)?;
            frames.push(Self::from_wire(wire)?);
        }
        Ok(frames)
    }

    fn from_wire(wire: Wire) -> Result<BinaryFrame, FrameError> {
        let items = wire.as_array().ok_or(FrameError::WrongShape)?;
        if items.len() != 4 {
            return Err(FrameError::WrongShape);
        }
        let topic_id = items[0].as_i64().ok_or(FrameError::BadTopicId)?;
        let server_time = items[1].as_u64().ok_or(FrameError::BadServerTime)?;
        let type_num: u8 = items[2]
            .as_u64()
            .and_then(|n| u8::try_from(n).ok())
            .ok_or(FrameError::BadTypeNum)?;
        Ok(BinaryFrame::new(topic_id, server_time, type_num, items[3].clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_frame_round_trips() {
        let frame = BinaryFrame::new(3, 1_000_000, 1, Wire::F64(1.234));
        let bytes = frame.encode().unwrap();
        let decoded = BinaryFrame::decode_all(&bytes).unwrap();
        assert_eq!(decoded, vec![frame]);
    }

    #[test]
    fn concatenated_frames_all_decode_in_order() {
        let a = BinaryFrame::new(10, 1, 1, Wire::F64(1.4));
        let b = BinaryFrame::new(11, 2, 2, Wire::Integer(3.into()));
        let c = BinaryFrame::new(12, 3, 1, Wire::F64(3.6));
        let mut bytes = a.encode().unwrap();
        bytes.extend(b.encode().unwrap());
        bytes.extend(c.encode().unwrap());

        let decoded = BinaryFrame::decode_all(&bytes).unwrap();
        assert_eq!(decoded, vec![a, b, c]);
    }

    #[test]
    fn heartbeat_topic_id_is_signed_negative_one() {
        let frame = BinaryFrame::new(-1, 100, 1, Wire::F64(100.0));
        let bytes = frame.encode().unwrap();
        let decoded = &BinaryFrame::decode_all(&bytes).unwrap()[0];
        assert_eq!(decoded.topic_id, -1);
    }
}
