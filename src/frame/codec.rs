use std::convert::TryFrom;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use nom::bytes::complete::take;
use nom::error::{Error, ErrorKind};
use nom::number::complete::{be_u16, be_u24, be_u32, be_u64, be_u8};
use nom::IResult;
use tokio_util::codec::{Decoder, Encoder};

use crate::frame::errors::FramingError;
use crate::frame::payload::Payload;
use crate::frame::{flags, ErrorCode, Frame, FrameType, Setup, MAJOR_VERSION, MAX_U24, MAX_U31, MINOR_VERSION};

/// Size of the frame length prefix used on stream transports.
const LENGTH_PREFIX_SIZE: usize = 3;

type Res<'a, T> = IResult<&'a [u8], T>;

struct Header {
    stream_id: u32,
    frame_type: u8,
    flags: u16,
}

impl Header {
    fn has(&self, flag: u16) -> bool {
        self.flags & flag == flag
    }
}

fn u8_(i: &[u8]) -> Res<u8> { be_u8(i) }
fn u16_(i: &[u8]) -> Res<u16> { be_u16(i) }
fn u24_(i: &[u8]) -> Res<u32> { be_u24(i) }
fn u32_(i: &[u8]) -> Res<u32> { be_u32(i) }
fn u64_(i: &[u8]) -> Res<u64> { be_u64(i) }
fn bytes_(i: &[u8], n: usize) -> Res<&[u8]> { take(n)(i) }

fn rest(i: &[u8]) -> (&[u8], &[u8]) {
    (&i[i.len()..], i)
}

fn header(i: &[u8]) -> Res<Header> {
    let (i, stream_id) = u32_(i)?;
    let (i, type_and_flags) = u16_(i)?;
    Ok((i, Header {
        stream_id: stream_id & MAX_U31,
        frame_type: (type_and_flags >> 10) as u8,
        flags: type_and_flags & 0x3FF
    }))
}

fn payload(i: &[u8], has_metadata: bool) -> Res<Payload> {
    let (i, metadata) = if has_metadata {
        let (i, len) = u24_(i)?;
        bytes_(i, len as usize)?
    } else {
        (i, &i[..0])
    };
    let (i, data) = rest(i);
    Ok((i, Payload::new(Bytes::copy_from_slice(data), Bytes::copy_from_slice(metadata))))
}

fn mime_type(i: &[u8]) -> Res<String> {
    let (i, len) = u8_(i)?;
    let (i, mime) = bytes_(i, len as usize)?;
    Ok((i, String::from_utf8_lossy(mime).into_owned()))
}

fn setup<'a>(i: &'a [u8], header: &Header) -> Res<'a, Frame> {
    let (i, _major) = u16_(i)?;
    let (i, _minor) = u16_(i)?;
    let (i, keepalive_interval) = u32_(i)?;
    let (i, max_lifetime) = u32_(i)?;
    let i = if header.has(flags::RESUME) {
        let (i, token_len) = u16_(i)?;
        bytes_(i, token_len as usize)?.0
    } else {
        i
    };
    let (i, metadata_mime_type) = mime_type(i)?;
    let (i, data_mime_type) = mime_type(i)?;
    let (i, payload) = payload(i, header.has(flags::METADATA))?;
    Ok((i, Frame::Setup(Setup {
        keepalive_interval: keepalive_interval & MAX_U31,
        max_lifetime: max_lifetime & MAX_U31,
        metadata_mime_type,
        data_mime_type,
        payload
    })))
}

fn reject_fragment<'a>(i: &'a [u8], header: &Header) -> Result<(), nom::Err<Error<&'a [u8]>>> {
    if header.has(flags::FOLLOWS) {
        Err(nom::Err::Failure(Error::new(i, ErrorKind::Verify)))
    } else {
        Ok(())
    }
}

fn frame(i: &[u8]) -> Res<Frame> {
    let (i, header) = header(i)?;
    let stream_id = header.stream_id;

    match FrameType::try_from(header.frame_type) {
        Ok(FrameType::Setup) => setup(i, &header),
        Ok(FrameType::KeepAlive) => {
            let (i, position) = u64_(i)?;
            let (i, data) = rest(i);
            Ok((i, Frame::KeepAlive {
                respond: header.has(flags::RESPOND),
                last_received_position: position & 0x7FFF_FFFF_FFFF_FFFF,
                data: Bytes::copy_from_slice(data)
            }))
        }
        Ok(FrameType::RequestChannel) => {
            reject_fragment(i, &header)?;
            let (i, n) = u32_(i)?;
            let (i, payload) = payload(i, header.has(flags::METADATA))?;
            Ok((i, Frame::RequestChannel {
                stream_id,
                initial_request_n: n & MAX_U31,
                complete: header.has(flags::COMPLETE),
                payload
            }))
        }
        Ok(FrameType::RequestN) => {
            let (i, n) = u32_(i)?;
            Ok((i, Frame::RequestN { stream_id, n: n & MAX_U31 }))
        }
        Ok(FrameType::Cancel) => Ok((i, Frame::Cancel { stream_id })),
        Ok(FrameType::Payload) => {
            reject_fragment(i, &header)?;
            let (i, payload) = payload(i, header.has(flags::METADATA))?;
            Ok((i, Frame::Payload {
                stream_id,
                next: header.has(flags::NEXT),
                complete: header.has(flags::COMPLETE),
                payload
            }))
        }
        Ok(FrameType::Error) => {
            let (i, code) = u32_(i)?;
            let (i, message) = rest(i);
            Ok((i, Frame::Error {
                stream_id,
                code: ErrorCode::from(code),
                message: String::from_utf8_lossy(message).into_owned()
            }))
        }
        _ => {
            let (i, _) = rest(i);
            Ok((i, Frame::Unsupported {
                stream_id,
                frame_type: header.frame_type,
                ignore: header.has(flags::IGNORE)
            }))
        }
    }
}

/// Decodes one complete frame without length prefix (one websocket message).
pub fn decode_frame(buf: &[u8]) -> Result<Frame, FramingError> {
    frame(buf)
        .map(|(_, frame)| frame)
        .map_err(|e| FramingError::DecodeErr(format!("Error decoding frame: {:?}", e)))
}

/// Encodes one frame without length prefix.
pub fn encode_frame(frame: &Frame, dst: &mut BytesMut) -> Result<(), FramingError> {
    match frame {
        Frame::Setup(setup) => {
            put_header(dst, 0, FrameType::Setup, metadata_flag(&setup.payload));
            dst.put_u16(MAJOR_VERSION);
            dst.put_u16(MINOR_VERSION);
            dst.put_u32(setup.keepalive_interval & MAX_U31);
            dst.put_u32(setup.max_lifetime & MAX_U31);
            put_mime_type(dst, &setup.metadata_mime_type)?;
            put_mime_type(dst, &setup.data_mime_type)?;
            put_payload(dst, &setup.payload)?;
        }
        Frame::KeepAlive { respond, last_received_position, data } => {
            let flags = if *respond { flags::RESPOND } else { 0 };
            put_header(dst, 0, FrameType::KeepAlive, flags);
            dst.put_u64(last_received_position & 0x7FFF_FFFF_FFFF_FFFF);
            dst.put_slice(data);
        }
        Frame::RequestChannel { stream_id, initial_request_n, complete, payload } => {
            let mut flags = metadata_flag(payload);
            if *complete { flags |= flags::COMPLETE; }
            put_header(dst, *stream_id, FrameType::RequestChannel, flags);
            dst.put_u32(*initial_request_n & MAX_U31);
            put_payload(dst, payload)?;
        }
        Frame::RequestN { stream_id, n } => {
            put_header(dst, *stream_id, FrameType::RequestN, 0);
            dst.put_u32(*n & MAX_U31);
        }
        Frame::Cancel { stream_id } => {
            put_header(dst, *stream_id, FrameType::Cancel, 0);
        }
        Frame::Payload { stream_id, next, complete, payload } => {
            let mut flags = metadata_flag(payload);
            if *next { flags |= flags::NEXT; }
            if *complete { flags |= flags::COMPLETE; }
            put_header(dst, *stream_id, FrameType::Payload, flags);
            put_payload(dst, payload)?;
        }
        Frame::Error { stream_id, code, message } => {
            put_header(dst, *stream_id, FrameType::Error, 0);
            dst.put_u32(u32::from(*code));
            dst.put_slice(message.as_bytes());
        }
        Frame::Unsupported { frame_type, .. } => {
            return Err(FramingError::EncodeErr(format!("Cannot encode unsupported frame type {}", frame_type)));
        }
    }
    log::trace!("Encoded {:?} frame", frame.frame_type());
    Ok(())
}

fn put_header(dst: &mut BytesMut, stream_id: u32, frame_type: FrameType, flags: u16) {
    dst.put_u32(stream_id & MAX_U31);
    dst.put_u16(((frame_type as u16) << 10) | (flags & 0x3FF));
}

fn metadata_flag(payload: &Payload) -> u16 {
    if payload.has_metadata() { flags::METADATA } else { 0 }
}

fn put_mime_type(dst: &mut BytesMut, mime_type: &str) -> Result<(), FramingError> {
    if mime_type.len() > u8::MAX as usize || !mime_type.is_ascii() {
        return Err(FramingError::EncodeErr(format!("Invalid mime type: {}", mime_type)));
    }
    dst.put_u8(mime_type.len() as u8);
    dst.put_slice(mime_type.as_bytes());
    Ok(())
}

fn put_payload(dst: &mut BytesMut, payload: &Payload) -> Result<(), FramingError> {
    if payload.has_metadata() {
        let len = payload.metadata().len();
        if len > MAX_U24 {
            return Err(FramingError::EncodeErr(format!("Metadata too large: {} bytes", len)));
        }
        dst.put_uint(len as u64, 3);
        dst.put_slice(payload.metadata());
    }
    dst.put_slice(payload.data());
    Ok(())
}

/// Frames with a 24-bit length prefix, for byte-stream transports such as TCP.
pub struct Codec;

impl Encoder<Frame> for Codec {
    type Error = FramingError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), FramingError> {
        let mut buf = BytesMut::new();
        encode_frame(&item, &mut buf)?;
        if buf.len() > MAX_U24 {
            return Err(FramingError::EncodeErr(format!("Frame too large: {} bytes", buf.len())));
        }
        dst.reserve(LENGTH_PREFIX_SIZE + buf.len());
        dst.put_uint(buf.len() as u64, LENGTH_PREFIX_SIZE);
        dst.put_slice(&buf);
        log::trace!("Encoder sending {} bytes", buf.len() + LENGTH_PREFIX_SIZE);
        Ok(())
    }
}

impl Decoder for Codec {
    type Item = Frame;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FramingError> {
        log::trace!("Decoder received {} bytes", src.len());
        if src.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }
        let frame_size = (&src[..LENGTH_PREFIX_SIZE]).get_uint(LENGTH_PREFIX_SIZE) as usize;
        if src.len() < LENGTH_PREFIX_SIZE + frame_size {
            src.reserve(LENGTH_PREFIX_SIZE + frame_size - src.len());
            return Ok(None);
        }
        src.advance(LENGTH_PREFIX_SIZE);
        let buf = src.split_to(frame_size);
        decode_frame(&buf).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use tokio_util::codec::{Decoder, Encoder};

    use super::*;

    fn encoded(frame: &Frame) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_frame(frame, &mut buf).unwrap();
        buf.to_vec()
    }

    #[test]
    fn parse_request_n() {
        let input: &[u8] = &[0x00, 0x00, 0x00, 0x01, 0x20, 0x00, 0x00, 0x00, 0x00, 0x05];
        let frame = decode_frame(input).unwrap();
        assert_eq!(frame, Frame::RequestN { stream_id: 1, n: 5 });
        assert_eq!(encoded(&frame), input);
    }

    #[test]
    fn parse_payload_next_complete() {
        let input: &[u8] = &[0x00, 0x00, 0x00, 0x01, 0x28, 0x60, 0x58];
        let frame = decode_frame(input).unwrap();
        assert_eq!(frame, Frame::next(1, Payload::from("X"), true));
        assert_eq!(encoded(&frame), input);
    }

    #[test]
    fn parse_payload_with_metadata() {
        let input: &[u8] = &[0x00, 0x00, 0x00, 0x03, 0x29, 0x20, 0x00, 0x00, 0x02, b'{', b'}', b'X'];
        let frame = decode_frame(input).unwrap();
        match &frame {
            Frame::Payload { stream_id, next, complete, payload } => {
                assert_eq!(*stream_id, 3);
                assert!(*next);
                assert!(!*complete);
                assert_eq!(payload.metadata().as_ref(), b"{}");
                assert_eq!(payload.data().as_ref(), b"X");
            }
            other => panic!("unexpected frame {:?}", other)
        }
        assert_eq!(encoded(&frame), input);
    }

    #[test]
    fn parse_keepalive_and_error() {
        let keepalive: &[u8] = &[0x00, 0x00, 0x00, 0x00, 0x0C, 0x80, 0, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(
            decode_frame(keepalive).unwrap(),
            Frame::KeepAlive { respond: true, last_received_position: 0, data: Bytes::new() }
        );

        let error: &[u8] = &[0x00, 0x00, 0x00, 0x00, 0x2C, 0x00, 0x00, 0x00, 0x00, 0x03, b'b', b'a', b'd'];
        let frame = decode_frame(error).unwrap();
        assert_eq!(frame, Frame::error(0, ErrorCode::RejectedSetup, "bad"));
        assert_eq!(encoded(&frame), error);
    }

    #[test]
    fn encode_setup() {
        let frame = Frame::Setup(Setup {
            keepalive_interval: 30_000,
            max_lifetime: 86_400_000,
            metadata_mime_type: "application/json".into(),
            data_mime_type: "application/json".into(),
            payload: Payload::empty()
        });

        let mut expected = vec![0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x01, 0x00, 0x00,
                                0x00, 0x00, 0x75, 0x30, 0x05, 0x26, 0x5C, 0x00];
        expected.push(16);
        expected.extend_from_slice(b"application/json");
        expected.push(16);
        expected.extend_from_slice(b"application/json");

        let output = encoded(&frame);
        assert_eq!(output, expected);
        assert_eq!(decode_frame(&output).unwrap(), frame);
    }

    #[test]
    fn reject_fragmented_payload() {
        let input: &[u8] = &[0x00, 0x00, 0x00, 0x01, 0x28, 0xA0, 0x58];
        assert!(decode_frame(input).is_err());
    }

    #[test]
    fn unsupported_frame_is_surfaced() {
        let input: &[u8] = &[0x00, 0x00, 0x00, 0x05, 0x12, 0x00, 0x01];
        let frame = decode_frame(input).unwrap();
        assert_eq!(frame, Frame::Unsupported { stream_id: 5, frame_type: 0x04, ignore: true });
    }

    #[test]
    fn length_prefixed_codec_waits_for_full_frame() {
        let mut buf = BytesMut::new();
        Codec.encode(Frame::RequestN { stream_id: 1, n: 7 }, &mut buf).unwrap();
        Codec.encode(Frame::Cancel { stream_id: 1 }, &mut buf).unwrap();
        assert_eq!(&buf[..3], &[0x00, 0x00, 0x0A]);

        let mut partial = BytesMut::from(&buf[..5]);
        assert!(Codec.decode(&mut partial).unwrap().is_none());

        assert_eq!(Codec.decode(&mut buf).unwrap(), Some(Frame::RequestN { stream_id: 1, n: 7 }));
        assert_eq!(Codec.decode(&mut buf).unwrap(), Some(Frame::Cancel { stream_id: 1 }));
        assert!(Codec.decode(&mut buf).unwrap().is_none());
    }
}
