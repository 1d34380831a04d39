//! Client side of the RPC protocol.

use {
    crate::{codec::ClientCodec, error::Error, io_err, rpc::*, utils::Result},
    futures::sink::SinkExt,
    std::time::Duration,
    tokio::{
        io::{AsyncRead, AsyncWrite},
        net::{TcpStream, ToSocketAddrs},
    },
    tokio_stream::StreamExt,
    tokio_util::codec::Framed,
};

macro_rules! expect_response {
    ($response:expr, $variant:ident) => {
        match $response {
            Response::$variant(value) => Ok(value),
            other => Err(Error::Protocol(format!(
                "expected {}, got {:?}",
                stringify!($variant),
                other
            ))),
        }
    };
}

/// A connection to a broker.
///
/// Requests are issued one at a time; each call waits for its response.
pub struct Client<S = TcpStream> {
    framed: Framed<S, ClientCodec>,
}

impl Client<TcpStream> {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Client<TcpStream>> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Client::new(stream))
    }
}

impl<S> Client<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Client<S> {
        Client {
            framed: Framed::new(stream, ClientCodec::default()),
        }
    }

    async fn call(&mut self, request: Request) -> Result<Response> {
        self.framed.send(request).await?;
        match self.framed.next().await {
            Some(response) => response,
            None => Err(io_err!(UnexpectedEof, "connection closed by broker").into()),
        }
    }

    async fn post(&mut self, request: Request) -> Result<()> {
        self.framed.send(request).await
    }

    async fn status(&mut self, request: Request) -> Result<bool> {
        expect_response!(self.call(request).await?, Status)
    }

    pub async fn supported_devices(&mut self) -> Result<Vec<DeviceType>> {
        expect_response!(self.call(Request::GetSupportedDevices).await?, SupportedDevices)
    }

    /// Run discovery on the broker and return the serials it knows.
    pub async fn find_all(&mut self) -> Result<Vec<String>> {
        let serials = expect_response!(self.call(Request::FindAll).await?, Serials)?;
        Ok(serials.iter().map(Serial::as_string).collect())
    }

    /// Open the bulk channel for `serial`; `None` if the broker refused.
    pub async fn mailbox_open(&mut self, serial: &str) -> Result<Option<MailboxPair>> {
        let serial = serial.to_owned();
        expect_response!(self.call(Request::MailboxOpen { serial }).await?, MailboxOpened)
    }

    pub async fn mailbox_close(&mut self, serial: &str) -> Result<bool> {
        let serial = serial.to_owned();
        self.status(Request::MailboxClose { serial }).await
    }

    pub async fn device_open(&mut self, serial: &str) -> Result<bool> {
        let serial = serial.to_owned();
        self.status(Request::DeviceOpen { serial }).await
    }

    pub async fn device_close(&mut self, serial: &str) -> Result<bool> {
        let serial = serial.to_owned();
        self.status(Request::DeviceClose { serial }).await
    }

    pub async fn device_go_online(&mut self, serial: &str) -> Result<bool> {
        let serial = serial.to_owned();
        self.status(Request::DeviceGoOnline { serial }).await
    }

    pub async fn device_go_offline(&mut self, serial: &str) -> Result<bool> {
        let serial = serial.to_owned();
        self.status(Request::DeviceGoOffline { serial }).await
    }

    /// Block until the device lock is granted for at most `max_duration`.
    pub async fn device_lock(&mut self, serial: &str, max_duration: Duration) -> Result<bool> {
        let request = Request::DeviceLock {
            serial: serial.to_owned(),
            max_duration_ms: i64::try_from(max_duration.as_millis()).unwrap_or(i64::MAX),
        };
        self.status(request).await
    }

    pub async fn device_unlock(&mut self, serial: &str) -> Result<bool> {
        let serial = serial.to_owned();
        self.status(Request::DeviceUnlock { serial }).await
    }

    pub async fn events(&mut self) -> Result<Vec<Event>> {
        expect_response!(self.call(Request::GetEvents).await?, Events)
    }

    pub async fn last_error(&mut self) -> Result<Event> {
        expect_response!(self.call(Request::GetLastError).await?, LastError)
    }

    pub async fn event_count(&mut self, filter: EventFilter) -> Result<u64> {
        expect_response!(self.call(Request::GetEventCount { filter }).await?, Count)
    }

    /// Fire and forget; the broker does not answer.
    pub async fn discard_events(&mut self, filter: EventFilter) -> Result<()> {
        self.post(Request::DiscardEvents { filter }).await
    }

    pub async fn event_limit(&mut self) -> Result<u64> {
        expect_response!(self.call(Request::GetEventLimit).await?, Count)
    }

    /// Fire and forget; the broker does not answer.
    pub async fn set_event_limit(&mut self, limit: u64) -> Result<()> {
        self.post(Request::SetEventLimit { limit }).await
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::codec::ServerCodec,
        tokio::io::{DuplexStream, duplex},
    };

    fn pair() -> (Client<DuplexStream>, Framed<DuplexStream, ServerCodec>) {
        let (a, b) = duplex(1024);
        (Client::new(a), Framed::new(b, ServerCodec))
    }

    #[tokio::test]
    async fn lock_duration_is_sent_in_milliseconds() {
        let (mut client, mut server) = pair();
        let call = tokio::spawn(async move {
            client
                .device_lock("A", Duration::from_millis(1500))
                .await
                .unwrap()
        });

        assert_eq!(
            server.next().await.unwrap().unwrap(),
            Request::DeviceLock {
                serial: "A".to_owned(),
                max_duration_ms: 1500
            }
        );
        server.send(Response::Status(true)).await.unwrap();
        assert!(call.await.unwrap());
    }

    #[tokio::test]
    async fn refused_channel_is_none() {
        let (mut client, mut server) = pair();
        let call = tokio::spawn(async move { client.mailbox_open("A").await });

        server.next().await.unwrap().unwrap();
        server.send(Response::MailboxOpened(None)).await.unwrap();
        assert_eq!(call.await.unwrap().unwrap(), None);
    }

    #[tokio::test]
    async fn closed_connection_is_an_error() {
        let (mut client, server) = pair();
        drop(server);
        assert!(client.event_limit().await.is_err());
    }

    #[tokio::test]
    async fn fire_and_forget_requests_do_not_wait() {
        let (mut client, mut server) = pair();
        client.set_event_limit(9).await.unwrap();
        client.discard_events(EventFilter::default()).await.unwrap();

        assert_eq!(
            server.next().await.unwrap().unwrap(),
            Request::SetEventLimit { limit: 9 }
        );
        assert_eq!(
            server.next().await.unwrap().unwrap(),
            Request::DiscardEvents {
                filter: EventFilter::default()
            }
        );
    }
}
