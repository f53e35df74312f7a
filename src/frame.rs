//! 프레임 정의와 와이어 포맷
//!
//! ```text
//! [0]     type (0=Data, 1=Start, 2=End, 3=Report)
//! [1..5]  seq (u32 BE)
//! [5..]   payload (길이는 데이터그램 길이로 결정)
//! ```
//!
//! 송신 순서: START, DATA..., END, (대기) REPORT
//! 리포트 페이로드가 비어 있지 않으면 누락 프레임만 다시 보내고
//! 같은 절차를 반복한다. 재전송 시 seq는 새로 매기지 않는다.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{Error, Result, HEADER_LEN};

/// 프레임 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// 중간 데이터
    Data,
    /// 메시지 시작
    Start,
    /// 메시지 끝
    End,
    /// 수신자 리포트 (payload = 누락 seq 목록)
    Report,
    /// 알 수 없는 타입 코드 (그대로 통과)
    Unknown(u8),
}

impl From<u8> for FrameType {
    fn from(code: u8) -> Self {
        match code {
            0 => FrameType::Data,
            1 => FrameType::Start,
            2 => FrameType::End,
            3 => FrameType::Report,
            other => FrameType::Unknown(other),
        }
    }
}

impl From<FrameType> for u8 {
    fn from(kind: FrameType) -> Self {
        match kind {
            FrameType::Data => 0,
            FrameType::Start => 1,
            FrameType::End => 2,
            FrameType::Report => 3,
            FrameType::Unknown(code) => code,
        }
    }
}

/// 프레임 (송수신 단위)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// 프레임 타입 (재전송 시 Start/End로 다시 태깅될 수 있음)
    pub kind: FrameType,

    /// 시퀀스 번호 (0부터, 조립 버퍼 인덱스로 사용)
    /// 리포트 프레임에서는 수신자가 관측한 슬롯 수
    pub seq: u32,

    /// 페이로드
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: FrameType, seq: u32, payload: Bytes) -> Self {
        Self { kind, seq, payload }
    }

    /// 리포트 프레임 생성
    pub fn report(slot_count: u32, missing: &[u32]) -> Self {
        Self::new(FrameType::Report, slot_count, encode_missing(missing))
    }

    /// 프레임을 바이트로 직렬화
    ///
    /// 호출마다 새 버퍼를 할당하므로 여러 연결에서 동시에 호출해도 안전하다.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u8(self.kind.into());
        buf.put_u32(self.seq);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// 바이트에서 프레임 역직렬화
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::FrameTooShort {
                expected: HEADER_LEN,
                got: bytes.len(),
            });
        }

        let mut header = &bytes[..HEADER_LEN];
        let kind = FrameType::from(header.get_u8());
        let seq = header.get_u32();
        let payload = Bytes::copy_from_slice(&bytes[HEADER_LEN..]);

        Ok(Self { kind, seq, payload })
    }

    pub fn is_end(&self) -> bool {
        self.kind == FrameType::End
    }
}

/// 메시지를 프레임들로 분할
///
/// 첫 프레임은 Start, 마지막은 End, 나머지는 Data.
/// 프레임이 하나뿐이면 End만 붙는다 (빈 메시지도 빈 End 프레임 하나).
pub fn split_message(data: &[u8], chunk_size: usize) -> Result<Vec<Frame>> {
    if chunk_size == 0 {
        return Err(Error::InvalidConfig("chunk_size는 0보다 커야 함".into()));
    }
    if data.is_empty() {
        return Ok(vec![Frame::new(FrameType::End, 0, Bytes::new())]);
    }

    let total = data.len().div_ceil(chunk_size);

    let frames = data
        .chunks(chunk_size)
        .enumerate()
        .map(|(idx, chunk)| {
            let kind = if idx + 1 == total {
                FrameType::End
            } else if idx == 0 {
                FrameType::Start
            } else {
                FrameType::Data
            };
            Frame::new(kind, idx as u32, Bytes::copy_from_slice(chunk))
        })
        .collect();
    Ok(frames)
}

/// 누락 인덱스 목록을 리포트 페이로드로 변환 ("2,5,9")
pub fn encode_missing(missing: &[u32]) -> Bytes {
    let text = missing
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",");
    Bytes::from(text)
}

/// 리포트 페이로드에서 누락 인덱스 목록 파싱
pub fn parse_missing(payload: &[u8]) -> Result<Vec<u32>> {
    let text = std::str::from_utf8(payload)
        .map_err(|e| Error::InvalidReport(e.to_string()))?
        .trim();

    if text.is_empty() {
        return Ok(Vec::new());
    }

    text.split(',')
        .map(|part| {
            part.trim()
                .parse::<u32>()
                .map_err(|_| Error::InvalidReport(format!("숫자가 아님: {part:?}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DEFAULT_CHUNK_SIZE;

    #[test]
    fn test_frame_codec_boundaries() {
        let payloads = [Bytes::new(), Bytes::from(vec![0xAB; DEFAULT_CHUNK_SIZE])];

        for code in 0u8..=3 {
            for seq in [0, 1, u32::MAX] {
                for payload in &payloads {
                    let frame = Frame::new(FrameType::from(code), seq, payload.clone());
                    let bytes = frame.encode();
                    assert_eq!(bytes.len(), HEADER_LEN + payload.len());
                    assert_eq!(Frame::decode(&bytes).unwrap(), frame);
                }
            }
        }
    }

    #[test]
    fn test_header_is_big_endian() {
        let frame = Frame::new(FrameType::End, 0x0102_0304, Bytes::from_static(b"xy"));
        assert_eq!(frame.encode().as_ref(), &[2, 1, 2, 3, 4, b'x', b'y']);
    }

    #[test]
    fn test_decode_short_input_fails() {
        for len in 0..HEADER_LEN {
            let bytes = vec![0u8; len];
            assert!(matches!(
                Frame::decode(&bytes),
                Err(Error::FrameTooShort { got, .. }) if got == len
            ));
        }
    }

    #[test]
    fn test_unknown_type_passes_through() {
        let frame = Frame::decode(&[9, 0, 0, 0, 7]).unwrap();
        assert_eq!(frame.kind, FrameType::Unknown(9));
        assert_eq!(frame.seq, 7);
        assert_eq!(frame.encode().as_ref(), &[9, 0, 0, 0, 7]);
    }

    #[test]
    fn test_split_message_tags() {
        let frames = split_message(&[], 10).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind, FrameType::End);
        assert!(frames[0].payload.is_empty());

        let frames = split_message(&[1; 10], 10).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind, FrameType::End);

        let frames = split_message(&[1; 11], 10).unwrap();
        let kinds: Vec<_> = frames.iter().map(|f| f.kind).collect();
        assert_eq!(kinds, vec![FrameType::Start, FrameType::End]);
        assert_eq!(frames[1].payload.len(), 1);

        let data: Vec<u8> = (0..=255).collect();
        let frames = split_message(&data, 100).unwrap();
        let kinds: Vec<_> = frames.iter().map(|f| f.kind).collect();
        assert_eq!(kinds, vec![FrameType::Start, FrameType::Data, FrameType::End]);
        let seqs: Vec<_> = frames.iter().map(|f| f.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[test]
    fn test_split_rejects_zero_chunk_size() {
        assert!(matches!(
            split_message(b"x", 0),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_missing_list_format() {
        assert!(encode_missing(&[]).is_empty());
        assert_eq!(encode_missing(&[2, 5, 9]).as_ref(), b"2,5,9");
        assert_eq!(parse_missing(b"2,5,9").unwrap(), vec![2, 5, 9]);
        assert_eq!(parse_missing(b" 4 \n").unwrap(), vec![4]);
        assert!(parse_missing(b"").unwrap().is_empty());
        assert!(matches!(parse_missing(b"1,x"), Err(Error::InvalidReport(_))));
    }
}
