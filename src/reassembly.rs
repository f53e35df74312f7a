//! 수신측 조립 버퍼
//!
//! seq를 인덱스로 하는 희소 슬롯 배열. 도착 순서와 무관하게 프레임을
//! 제자리에 두고, 빈 슬롯을 찾아 리포트로 요청한다.

use bytes::{Bytes, BytesMut};

use crate::frame::Frame;

/// 조립 버퍼
#[derive(Debug)]
pub struct ReassemblyBuffer {
    /// seq -> 페이로드
    slots: Vec<Option<Bytes>>,

    /// 채워진 슬롯 수
    filled: usize,

    /// 슬롯 수 상한
    max_slots: u32,
}

impl ReassemblyBuffer {
    pub fn new(max_slots: u32) -> Self {
        Self {
            slots: Vec::new(),
            filled: 0,
            max_slots,
        }
    }

    /// 프레임 배치 (중복 seq는 마지막 값으로 덮어씀)
    ///
    /// seq가 상한을 넘으면 배치하지 않고 false 반환
    pub fn place(&mut self, frame: Frame) -> bool {
        if frame.seq >= self.max_slots {
            return false;
        }

        let idx = frame.seq as usize;
        if self.slots.len() <= idx {
            self.slots.resize(idx + 1, None);
        }

        if self.slots[idx].replace(frame.payload).is_none() {
            self.filled += 1;
        }
        true
    }

    /// 슬롯 수 (관측된 최대 seq + 1)
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// 빈 슬롯이 없는지
    pub fn is_complete(&self) -> bool {
        self.filled == self.slots.len()
    }

    /// 누락된 seq 목록 (오름차순, 최대 limit개)
    pub fn missing(&self, limit: usize) -> Vec<u32> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(idx, _)| idx as u32)
            .take(limit)
            .collect()
    }

    /// 완료된 메시지 추출 후 버퍼 비움
    pub fn take_message(&mut self) -> Bytes {
        let total: usize = self.slots.iter().flatten().map(Bytes::len).sum();
        let mut data = BytesMut::with_capacity(total);
        for payload in self.slots.drain(..).flatten() {
            data.extend_from_slice(&payload);
        }
        self.filled = 0;
        data.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{split_message, FrameType};

    #[test]
    fn test_out_of_order_assembly() {
        let data: Vec<u8> = (0..250).collect();
        let frames = split_message(&data, 100).unwrap();

        let mut buffer = ReassemblyBuffer::new(1024);
        for frame in frames.into_iter().rev() {
            assert!(buffer.place(frame));
        }

        assert!(buffer.is_complete());
        assert_eq!(buffer.take_message().as_ref(), &data[..]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_gaps_reported_ascending_and_bounded() {
        let mut buffer = ReassemblyBuffer::new(1024);
        buffer.place(Frame::new(FrameType::End, 9, Bytes::from_static(b"z")));
        buffer.place(Frame::new(FrameType::Data, 4, Bytes::from_static(b"e")));

        assert_eq!(buffer.len(), 10);
        assert_eq!(buffer.missing(usize::MAX), vec![0, 1, 2, 3, 5, 6, 7, 8]);
        assert_eq!(buffer.missing(3), vec![0, 1, 2]);
        assert!(!buffer.is_complete());
    }

    #[test]
    fn test_duplicate_last_write_wins() {
        let mut buffer = ReassemblyBuffer::new(1024);
        buffer.place(Frame::new(FrameType::End, 0, Bytes::from_static(b"old")));
        buffer.place(Frame::new(FrameType::End, 0, Bytes::from_static(b"new")));

        assert!(buffer.is_complete());
        assert_eq!(buffer.take_message().as_ref(), b"new");
    }

    #[test]
    fn test_rejects_seq_beyond_limit() {
        let mut buffer = ReassemblyBuffer::new(8);
        assert!(!buffer.place(Frame::new(FrameType::End, u32::MAX, Bytes::new())));
        assert!(buffer.is_empty());
    }
}
