//! Trame streaming over TCP.
//!
//! A [`TrameWriter`] serializes a view's trame stream to any byte sink,
//! typically a socket connected to the observation daemon. On the daemon
//! side, [`NetStreamReader`] accepts one producer connection and feeds the
//! decoded trames into a plugin until the `end` trame or the peer hangs up.

use std::io::{BufReader, BufWriter, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};

use super::plugin::ViewPlugin;
use super::trame::{read_trame, write_trame, ProtocolError, Trame};
use super::TrameSink;

/// A sink that frames trames onto a byte stream.
pub struct TrameWriter<W: Write + Send> {
    inner: BufWriter<W>,
}

impl<W: Write + Send> TrameWriter<W> {
    /// Wraps any writer.
    pub fn new(inner: W) -> Self {
        Self {
            inner: BufWriter::new(inner),
        }
    }
}

impl TrameWriter<TcpStream> {
    /// Connects to a daemon at `addr` (e.g. `"127.0.0.1:8090"`).
    pub fn connect(addr: impl ToSocketAddrs) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }
}

impl<W: Write + Send> TrameSink for TrameWriter<W> {
    fn deliver(&mut self, trame: &Trame) -> Result<(), ProtocolError> {
        write_trame(&mut self.inner, trame)?;
        // The end trame closes the view; make sure it reaches the wire.
        if matches!(trame, Trame::End { .. }) {
            self.inner.flush()?;
        }
        Ok(())
    }
}

/// Daemon-side reader: accepts one stream and replays it into a plugin.
pub struct NetStreamReader {
    listener: TcpListener,
}

impl NetStreamReader {
    /// Binds the daemon listener on `port`, all interfaces.
    pub fn bind(port: u16) -> std::io::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        Ok(Self { listener })
    }

    /// Wraps an already bound listener (used by tests with port 0).
    pub fn from_listener(listener: TcpListener) -> Self {
        Self { listener }
    }

    /// The bound local address.
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts one connection and pumps trames into `plugin`.
    ///
    /// Returns after the `end` trame or a clean disconnect; decoding
    /// failures surface as [`ProtocolError`].
    pub fn process(&self, plugin: &mut dyn ViewPlugin) -> Result<(), ProtocolError> {
        let (stream, peer) = self.listener.accept()?;
        tracing::info!(%peer, "observation stream connected");
        let mut reader = BufReader::new(stream);

        while let Some(trame) = read_trame(&mut reader)? {
            let is_end = matches!(trame, Trame::End { .. });
            plugin.deliver(&trame);
            if is_end {
                tracing::info!(view = trame.view(), "observation stream closed");
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observation::storage::StoragePlugin;
    use crate::observation::trame::ModelSample;
    use crate::value::Value;
    use std::thread;

    #[test]
    fn test_stream_roundtrip_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let reader = NetStreamReader::from_listener(listener);

        let producer = thread::spawn(move || {
            let mut writer = TrameWriter::connect(addr).unwrap();
            writer
                .deliver(&Trame::NewObservable {
                    view: "v".into(),
                    parent: "top.".into(),
                    simulator: "a".into(),
                    port: "out".into(),
                })
                .unwrap();
            writer
                .deliver(&Trame::Value {
                    view: "v".into(),
                    time: 1.0,
                    items: vec![ModelSample {
                        parent: "top.".into(),
                        simulator: "a".into(),
                        port: "out".into(),
                        value: Value::Integer(5),
                    }],
                })
                .unwrap();
            writer
                .deliver(&Trame::End {
                    view: "v".into(),
                    time: 1.0,
                })
                .unwrap();
        });

        let mut storage = StoragePlugin::new();
        reader.process(&mut storage).unwrap();
        producer.join().unwrap();

        assert_eq!(storage.column_count(), 1);
        assert_eq!(storage.row_count(), 1);
        assert_eq!(storage.last_time(), Some(1.0));
    }
}
