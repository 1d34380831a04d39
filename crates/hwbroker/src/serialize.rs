//! Serialize/deserialize RPC requests and responses into/from binary.

use crate::{io_err, res, rpc::*};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_traits::FromPrimitive;
use std::io::{Read, Result};
use std::mem;
use std::ops::Shl;

macro_rules! decode {
    ($decoder:expr) => {
        Decodable::decode(&mut $decoder)?
    };
}

fn read_exact<R: Read + ?Sized>(r: &mut R, size: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0; size];
    r.read_exact(&mut buf[..]).and(Ok(buf))
}

/// A serializing specific result to overload operators on `Result`
///
/// # Overloaded operators
/// <<, ?
pub struct SResult<T>(::std::io::Result<T>);

/// A wrapper class of WriteBytesExt to provide operator overloads
/// for serializing
///
/// Operator '<<' serializes the right hand side argument into
/// the left hand side encoder
#[derive(Clone, Debug)]
pub struct Encoder<W> {
    writer: W,
    bytes: usize,
}

impl<W: WriteBytesExt> Encoder<W> {
    pub fn new(writer: W) -> Encoder<W> {
        Encoder { writer, bytes: 0 }
    }

    /// Encode data, equivalent to: encoder << data
    pub fn encode<T: Encodable>(&mut self, data: &T) -> Result<usize> {
        let bytes = data.encode(&mut self.writer)?;
        self.bytes += bytes;
        Ok(bytes)
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for Encoder<W> {
    type Output = SResult<Encoder<W>>;
    fn shl(mut self, rhs: &'a T) -> Self::Output {
        match self.encode(rhs) {
            Ok(_) => SResult(Ok(self)),
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for SResult<Encoder<W>> {
    type Output = Self;
    fn shl(self, rhs: &'a T) -> Self::Output {
        match self.0 {
            Ok(mut encoder) => match encoder.encode(rhs) {
                Ok(_) => SResult(Ok(encoder)),
                Err(e) => SResult(Err(e)),
            },
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<W> SResult<Encoder<W>> {
    fn bytes_written(self) -> Result<usize> {
        self.0.map(|enc| enc.bytes)
    }
}

/// Trait representing a type which can be serialized into binary
pub trait Encodable {
    /// Encode self to w and returns the number of bytes encoded
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize>;
}

impl Encodable for u8 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u8(*self).and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for bool {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        (*self as u8).encode(w)
    }
}

impl Encodable for u16 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u16::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u32 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u32::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u64 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u64::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for i64 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_i64::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for String {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let len = u16::try_from(self.len())
            .map_err(|_| io_err!(InvalidInput, "string longer than 65535 bytes"))?;
        let mut bytes = len.encode(w)?;
        bytes += w.write_all(self.as_bytes()).and(Ok(self.len()))?;
        Ok(bytes)
    }
}

impl Encodable for Serial {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_all(&self.0).and(Ok(SERIAL_LEN))
    }
}

impl Encodable for Event {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        (Encoder::new(w) << &self.event_number << &self.severity << &self.serial << &self.timestamp)
            .bytes_written()
    }
}

impl Encodable for EventFilter {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        (Encoder::new(w)
            << &self.event_number
            << &self.severity
            << &self.serial
            << &self.match_serial)
            .bytes_written()
    }
}

impl Encodable for MailboxPair {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        (Encoder::new(w) << &self.reader << &self.writer).bytes_written()
    }
}

impl<T: Encodable> Encodable for Vec<T> {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let len = u16::try_from(self.len())
            .map_err(|_| io_err!(InvalidInput, "list longer than 65535 entries"))?;
        self.iter()
            .fold(Encoder::new(w) << &len, |acc, e| acc << e)
            .bytes_written()
    }
}

impl Encodable for Request {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        use crate::Request::*;

        let opcode = Opcode::from(self) as u8;
        let buf = Encoder::new(w) << &opcode;

        let buf = match *self {
            GetSupportedDevices | FindAll | GetEvents | GetLastError | GetEventLimit => buf,
            MailboxOpen { ref serial }
            | MailboxClose { ref serial }
            | DeviceOpen { ref serial }
            | DeviceGoOnline { ref serial }
            | DeviceGoOffline { ref serial }
            | DeviceClose { ref serial }
            | DeviceUnlock { ref serial } => buf << serial,
            DeviceLock {
                ref serial,
                ref max_duration_ms,
            } => buf << serial << max_duration_ms,
            GetEventCount { ref filter } | DiscardEvents { ref filter } => buf << filter,
            SetEventLimit { ref limit } => buf << limit,
        };
        buf.bytes_written()
    }
}

impl Encodable for Response {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        use crate::Response::*;

        let buf = Encoder::new(w);
        let buf = match *self {
            SupportedDevices(ref types) => buf << types,
            Serials(ref serials) => buf << serials,
            MailboxOpened(None) => buf << &false,
            MailboxOpened(Some(ref pair)) => buf << &true << pair,
            Status(ref ok) => buf << ok,
            Events(ref events) => {
                // Event lists carry a 64-bit count
                events
                    .iter()
                    .fold(buf << &(events.len() as u64), |acc, e| acc << e)
            }
            LastError(ref event) => buf << event,
            Count(ref n) => buf << n,
        };
        buf.bytes_written()
    }
}

/// Trait representing a type which can be deserialized from binary
pub trait Decodable: Sized {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self>;
}

impl Decodable for u8 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u8()
    }
}

impl Decodable for bool {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        match r.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => res!(io_err!(InvalidData, "Invalid boolean")),
        }
    }
}

impl Decodable for u16 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u16::<LittleEndian>()
    }
}

impl Decodable for u32 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u32::<LittleEndian>()
    }
}

impl Decodable for u64 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u64::<LittleEndian>()
    }
}

impl Decodable for i64 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_i64::<LittleEndian>()
    }
}

impl Decodable for String {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u16 = Decodable::decode(r)?;
        String::from_utf8(read_exact(r, len as usize)?)
            .or(res!(io_err!(InvalidData, "Invalid UTF-8 sequence")))
    }
}

impl Decodable for Serial {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let mut raw = [0u8; SERIAL_LEN];
        r.read_exact(&mut raw)?;
        Ok(Serial(raw))
    }
}

impl Decodable for Event {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(Event {
            event_number: decode!(*r),
            severity: decode!(*r),
            serial: decode!(*r),
            timestamp: decode!(*r),
        })
    }
}

impl Decodable for EventFilter {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(EventFilter {
            event_number: decode!(*r),
            severity: decode!(*r),
            serial: decode!(*r),
            match_serial: decode!(*r),
        })
    }
}

impl Decodable for MailboxPair {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(MailboxPair {
            reader: decode!(*r),
            writer: decode!(*r),
        })
    }
}

impl<T: Decodable> Decodable for Vec<T> {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u16 = decode!(*r);
        let mut buf = Vec::with_capacity(len as usize);
        for _ in 0..len {
            buf.push(decode!(*r));
        }
        Ok(buf)
    }
}

impl Decodable for Request {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        use crate::Opcode::*;

        let mut buf = r;

        let raw: u8 = decode!(buf);
        let request = match Opcode::from_u8(raw) {
            Some(GetSupportedDevices) => Request::GetSupportedDevices,
            Some(FindAll) => Request::FindAll,
            Some(MailboxOpen) => Request::MailboxOpen {
                serial: decode!(buf),
            },
            Some(MailboxClose) => Request::MailboxClose {
                serial: decode!(buf),
            },
            Some(DeviceOpen) => Request::DeviceOpen {
                serial: decode!(buf),
            },
            Some(DeviceGoOnline) => Request::DeviceGoOnline {
                serial: decode!(buf),
            },
            Some(DeviceGoOffline) => Request::DeviceGoOffline {
                serial: decode!(buf),
            },
            Some(DeviceClose) => Request::DeviceClose {
                serial: decode!(buf),
            },
            Some(DeviceLock) => Request::DeviceLock {
                serial: decode!(buf),
                max_duration_ms: decode!(buf),
            },
            Some(DeviceUnlock) => Request::DeviceUnlock {
                serial: decode!(buf),
            },
            Some(GetEvents) => Request::GetEvents,
            Some(GetLastError) => Request::GetLastError,
            Some(GetEventCount) => Request::GetEventCount {
                filter: decode!(buf),
            },
            Some(DiscardEvents) => Request::DiscardEvents {
                filter: decode!(buf),
            },
            Some(GetEventLimit) => Request::GetEventLimit,
            Some(SetEventLimit) => Request::SetEventLimit {
                limit: decode!(buf),
            },
            None => return res!(io_err!(InvalidData, format!("Invalid opcode {raw}"))),
        };

        Ok(request)
    }
}

/// Helper function to read a request from a byte-oriented stream
pub fn read_request<R: ReadBytesExt>(r: &mut R) -> Result<Request> {
    Decodable::decode(r)
}

/// Helper function to write a request into a byte-oriented stream
pub fn write_request<W: WriteBytesExt>(w: &mut W, request: &Request) -> Result<usize> {
    request.encode(w)
}

/// Read the response to a request carrying `opcode`.
///
/// Responses carry no opcode of their own, so the caller must say which
/// shape to expect.
pub fn read_response<R: ReadBytesExt>(r: &mut R, opcode: Opcode) -> Result<Response> {
    use crate::Opcode::*;

    let mut buf = r;

    let response = match opcode {
        GetSupportedDevices => Response::SupportedDevices(decode!(buf)),
        FindAll => Response::Serials(decode!(buf)),
        MailboxOpen => {
            let ok: bool = decode!(buf);
            Response::MailboxOpened(if ok { Some(decode!(buf)) } else { None })
        }
        MailboxClose | DeviceOpen | DeviceGoOnline | DeviceGoOffline | DeviceClose
        | DeviceLock | DeviceUnlock => Response::Status(decode!(buf)),
        GetEvents => {
            let count: u64 = decode!(buf);
            let mut events = Vec::new();
            for _ in 0..count {
                events.push(decode!(buf));
            }
            Response::Events(events)
        }
        GetLastError => Response::LastError(decode!(buf)),
        GetEventCount | GetEventLimit => Response::Count(decode!(buf)),
        DiscardEvents | SetEventLimit => {
            return res!(io_err!(InvalidInput, format!("{opcode:?} has no response")));
        }
    };

    Ok(response)
}

/// Helper function to write a response into a byte-oriented stream
pub fn write_response<W: WriteBytesExt>(w: &mut W, response: &Response) -> Result<usize> {
    response.encode(w)
}

#[test]
fn encoder_test1() {
    let expected: Vec<u8> = (0..10).collect();
    let mut encoder = Vec::new();
    for i in 0..10 {
        (&(i as u8)).encode(&mut encoder).unwrap();
    }
    assert_eq!(expected, encoder);
}

#[test]
fn decoder_test1() {
    use std::io::Cursor;

    let expected: Vec<u8> = (0..10).collect();
    let mut decoder = Cursor::new(expected.clone());
    let mut actual: Vec<u8> = Vec::new();
    while let Ok(i) = Decodable::decode(&mut decoder) {
        actual.push(i);
    }
    assert_eq!(expected, actual);
}

#[test]
fn lock_request_layout() {
    let request = Request::DeviceLock {
        serial: "A".to_owned(),
        max_duration_ms: 500,
    };
    let mut buf = Vec::new();
    let n = write_request(&mut buf, &request).unwrap();

    let mut expected = vec![8u8, 1, 0, b'A'];
    expected.extend_from_slice(&500i64.to_le_bytes());
    assert_eq!(n, expected.len());
    assert_eq!(buf, expected);
}

#[test]
fn request_encode_decode1() {
    use std::io::Cursor;

    let expected = Request::DiscardEvents {
        filter: EventFilter {
            event_number: 3,
            severity: 1,
            serial: Serial::new("B"),
            match_serial: true,
        },
    };
    let mut buf = Vec::new();
    let _ = expected.encode(&mut buf);
    assert_eq!(buf.len(), 1 + 13);

    let actual = read_request(&mut Cursor::new(buf));
    assert_eq!(expected, actual.unwrap());
}

#[test]
fn find_all_response_layout() {
    let response = Response::Serials(vec![Serial::new("A"), Serial::new("B")]);
    let mut buf = Vec::new();
    write_response(&mut buf, &response).unwrap();

    assert_eq!(&buf[..2], &[2, 0]);
    assert_eq!(buf.len(), 2 + 2 * SERIAL_LEN);
    assert_eq!(buf[2], b'A');
    assert_eq!(buf[2 + SERIAL_LEN], b'B');
}

#[test]
fn failed_mailbox_open_is_a_single_byte() {
    let mut buf = Vec::new();
    write_response(&mut buf, &Response::MailboxOpened(None)).unwrap();
    assert_eq!(buf, vec![0]);
}

#[test]
fn events_response_decodes_with_opcode() {
    use std::io::Cursor;

    let event = Event {
        event_number: 9,
        severity: 0x30,
        serial: Serial::new("A"),
        timestamp: 1234,
    };
    let expected = Response::Events(vec![event, event]);
    let mut buf = Vec::new();
    write_response(&mut buf, &expected).unwrap();
    assert_eq!(buf.len(), 8 + 2 * 20);

    let actual = read_response(&mut Cursor::new(buf), Opcode::GetEvents).unwrap();
    assert_eq!(expected, actual);
}

#[test]
fn invalid_opcode_is_rejected() {
    use std::io::{Cursor, ErrorKind};

    let err = read_request(&mut Cursor::new(vec![0xee])).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidData);
}

#[test]
fn truncated_request_reports_eof() {
    use std::io::{Cursor, ErrorKind};

    let err = read_request(&mut Cursor::new(vec![4, 5, 0, b'A'])).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
}
