//! Stream codecs for the RPC protocol.
//!
//! Requests and responses are not length-prefixed; a decoder knows a
//! message is complete only once every field of its shape could be read.

use {
    crate::{error::Error, rpc::*, serialize},
    bytes::{Buf, BufMut, BytesMut},
    std::io::{self, Cursor},
    tokio_util::codec::{Decoder, Encoder},
};

/// Run `read` over the buffered bytes, consuming them only if a whole
/// message was available.
fn decode_with<T>(
    src: &mut BytesMut,
    read: impl FnOnce(&mut Cursor<&[u8]>) -> io::Result<T>,
) -> Result<Option<T>, Error> {
    if src.is_empty() {
        return Ok(None);
    }

    let mut cursor = Cursor::new(&src[..]);
    match read(&mut cursor) {
        Ok(item) => {
            let consumed = cursor.position() as usize;
            src.advance(consumed);
            Ok(Some(item))
        }
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(Error::Protocol(e.to_string())),
    }
}

/// Server side: decodes requests, encodes responses.
#[derive(Clone, Debug, Default)]
pub struct ServerCodec;

impl Decoder for ServerCodec {
    type Item = Request;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Request>, Error> {
        decode_with(src, |r| serialize::read_request(r))
    }
}

impl Encoder<Response> for ServerCodec {
    type Error = Error;

    fn encode(&mut self, response: Response, dst: &mut BytesMut) -> Result<(), Error> {
        let mut writer = dst.writer();
        serialize::write_response(&mut writer, &response)?;
        Ok(())
    }
}

/// Client side: encodes requests, decodes the response to the last request
/// sent that expects one.
#[derive(Clone, Debug, Default)]
pub struct ClientCodec {
    expect: Option<Opcode>,
}

impl ClientCodec {
    pub fn expecting(&self) -> Option<Opcode> {
        self.expect
    }
}

impl Decoder for ClientCodec {
    type Item = Response;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Response>, Error> {
        let Some(opcode) = self.expect else {
            if src.is_empty() {
                return Ok(None);
            }
            return Err(Error::Protocol(format!(
                "{} unsolicited bytes from server",
                src.len()
            )));
        };

        let response = decode_with(src, |r| serialize::read_response(r, opcode))?;
        if response.is_some() {
            self.expect = None;
        }
        Ok(response)
    }
}

impl Encoder<Request> for ClientCodec {
    type Error = Error;

    fn encode(&mut self, request: Request, dst: &mut BytesMut) -> Result<(), Error> {
        let opcode = Opcode::from(&request);
        let mut writer = dst.writer();
        serialize::write_request(&mut writer, &request)?;
        if opcode.has_response() {
            self.expect = Some(opcode);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(request: Request) -> BytesMut {
        let mut buf = BytesMut::new();
        ClientCodec::default().encode(request, &mut buf).unwrap();
        buf
    }

    #[test]
    fn partial_request_waits_for_more() {
        let full = encoded(Request::DeviceLock {
            serial: "A".to_owned(),
            max_duration_ms: 250,
        });

        let mut codec = ServerCodec;
        let mut src = BytesMut::from(&full[..full.len() - 3]);
        assert_eq!(codec.decode(&mut src).unwrap(), None);
        assert_eq!(src.len(), full.len() - 3);

        src.extend_from_slice(&full[full.len() - 3..]);
        assert_eq!(
            codec.decode(&mut src).unwrap(),
            Some(Request::DeviceLock {
                serial: "A".to_owned(),
                max_duration_ms: 250,
            })
        );
        assert!(src.is_empty());
    }

    #[test]
    fn pipelined_requests_decode_in_order() {
        let mut src = encoded(Request::FindAll);
        src.extend_from_slice(&encoded(Request::DeviceOpen {
            serial: "B".to_owned(),
        }));

        let mut codec = ServerCodec;
        assert_eq!(codec.decode(&mut src).unwrap(), Some(Request::FindAll));
        assert_eq!(
            codec.decode(&mut src).unwrap(),
            Some(Request::DeviceOpen {
                serial: "B".to_owned()
            })
        );
        assert_eq!(codec.decode(&mut src).unwrap(), None);
    }

    #[test]
    fn unknown_opcode_is_a_protocol_error() {
        let mut src = BytesMut::from(&[0xee_u8, 0, 0][..]);
        assert!(matches!(
            ServerCodec.decode(&mut src),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn client_tracks_expected_shape() {
        let mut client = ClientCodec::default();
        let mut out = BytesMut::new();
        client
            .encode(Request::SetEventLimit { limit: 5 }, &mut out)
            .unwrap();
        assert_eq!(client.expecting(), None);

        client.encode(Request::GetEventLimit, &mut out).unwrap();
        assert_eq!(client.expecting(), Some(Opcode::GetEventLimit));

        let mut src = BytesMut::new();
        ServerCodec.encode(Response::Count(5), &mut src).unwrap();
        assert_eq!(client.decode(&mut src).unwrap(), Some(Response::Count(5)));
        assert_eq!(client.expecting(), None);
    }

    #[test]
    fn unsolicited_response_is_rejected() {
        let mut src = BytesMut::from(&[1u8][..]);
        assert!(ClientCodec::default().decode(&mut src).is_err());
    }
}
