//! Plain TCP byte channel.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use super::ByteChannel;

// A zero timeout means "no timeout" to the socket API.
fn socket_timeout(timeout: Duration) -> Option<Duration> {
    Some(timeout.max(Duration::from_millis(1)))
}

impl ByteChannel for TcpStream {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        self.set_read_timeout(socket_timeout(timeout))?;
        Read::read(self, buf)
    }

    fn write(&mut self, buf: &[u8], timeout: Duration) -> io::Result<usize> {
        self.set_write_timeout(socket_timeout(timeout))?;
        Write::write(self, buf)
    }

    fn try_clone(&self) -> io::Result<Box<dyn ByteChannel>> {
        Ok(Box::new(TcpStream::try_clone(self)?))
    }

    fn shutdown(&mut self) -> io::Result<()> {
        match TcpStream::shutdown(self, Shutdown::Write) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_tcp_roundtrip_and_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            ByteChannel::write_all(&mut stream, b"ping", Duration::from_secs(1)).unwrap();
            ByteChannel::shutdown(&mut stream).unwrap();
        });

        let (mut server, _) = listener.accept().unwrap();
        let mut buf = [0u8; 16];
        let mut got = Vec::new();
        loop {
            let n = ByteChannel::read(&mut server, &mut buf, Duration::from_secs(1)).unwrap();
            if n == 0 {
                break;
            }
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(got, b"ping");
        client.join().unwrap();
    }

    #[test]
    fn test_tcp_read_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).unwrap();
        let (mut server, _) = listener.accept().unwrap();
        let mut buf = [0u8; 4];
        let err = ByteChannel::read(&mut server, &mut buf, Duration::from_millis(20)).unwrap_err();
        assert!(super::super::is_timeout(&err));
    }
}
