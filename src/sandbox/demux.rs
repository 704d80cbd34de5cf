//! Docker multiplexed log framing
//!
//! With `Tty=false` the Engine interleaves stdout and stderr on one body.
//! Each frame is an 8-byte header `[stream, 0, 0, 0, len: u32 BE]` followed
//! by `len` payload bytes, where stream is 0 (stdin), 1 (stdout) or 2 (stderr).

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

use super::{LogFrame, OutputChannel, SandboxError};

const HEADER_LEN: usize = 8;

/// Upper bound on one frame's payload; larger lengths mean a corrupt stream.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Decodes the Engine's multiplexed log body into [`LogFrame`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct MultiplexedLogCodec;

impl Decoder for MultiplexedLogCodec {
    type Item = LogFrame;
    type Error = SandboxError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<LogFrame>, SandboxError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let channel = match src[0] {
            0 => OutputChannel::Stdin,
            1 => OutputChannel::Stdout,
            2 => OutputChannel::Stderr,
            other => {
                return Err(SandboxError::Protocol(format!(
                    "unknown stream id {other} in frame header"
                )))
            }
        };
        let len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(SandboxError::Protocol(format!(
                "frame length {len} exceeds {MAX_FRAME_LEN}"
            )));
        }

        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();
        Ok(Some(LogFrame { channel, payload }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<LogFrame>, SandboxError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(SandboxError::Protocol(format!(
                "log stream ended mid-frame with {} bytes pending",
                src.len()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio_util::codec::FramedRead;

    fn encode(stream: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![stream, 0, 0, 0];
        out.extend_from_slice(&u32::try_from(payload.len()).unwrap().to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_partial_header_waits_for_more() {
        let mut codec = MultiplexedLogCodec;
        let mut buf = BytesMut::from(&[1u8, 0, 0][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_unknown_stream_id_is_protocol_error() {
        let mut codec = MultiplexedLogCodec;
        let mut buf = BytesMut::from(&encode(7, b"x")[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(SandboxError::Protocol(_))
        ));
    }

    #[test]
    fn test_truncated_frame_at_eof() {
        let mut codec = MultiplexedLogCodec;
        let mut raw = encode(1, b"hello");
        raw.truncate(10);
        let mut buf = BytesMut::from(&raw[..]);
        assert!(codec.decode_eof(&mut buf).is_err());
    }

    #[tokio::test]
    async fn test_interleaved_frames_split_across_reads() {
        let mut bytes = encode(1, b"cloning\n");
        bytes.extend(encode(2, b"warn: x\n"));
        bytes.extend(encode(1, b""));
        bytes.extend(encode(1, b"done\n"));

        // Split at awkward offsets, including inside a header
        let mock = tokio_test::io::Builder::new()
            .read(&bytes[..3])
            .read(&bytes[3..13])
            .read(&bytes[13..])
            .build();

        let frames: Vec<LogFrame> = FramedRead::new(mock, MultiplexedLogCodec)
            .map(|f| f.unwrap())
            .collect()
            .await;

        assert_eq!(frames.len(), 4);
        assert_eq!(frames[0].channel, OutputChannel::Stdout);
        assert_eq!(&frames[0].payload[..], b"cloning\n");
        assert_eq!(frames[1].channel, OutputChannel::Stderr);
        assert_eq!(&frames[1].payload[..], b"warn: x\n");
        assert!(frames[2].payload.is_empty());
        assert_eq!(&frames[3].payload[..], b"done\n");
    }
}
