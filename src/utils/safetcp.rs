//! Safe TCP bind/connect/read/write helper functions for the line-oriented
//! text protocol.

use std::marker::Unpin;
use std::net::{Ipv4Addr, SocketAddr};

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::{self, Duration};

use crate::utils::LendsetError;

/// Receives one `\n`-terminated line from TCP readable connection
/// `conn_read`, using `read_buf` as buffer storage for partial reads.
/// Returns:
///   - `Ok(Some(line))` if a full line is available; the line is returned
///     without its terminator (a trailing `\r` is stripped as well) and its
///     bytes are consumed from the read buffer; invalid UTF-8 sequences come
///     out as `U+FFFD`, leaving the verdict to the line's parser
///   - `Ok(None)` if the peer closed the connection with nothing pending
///   - `Err(err)` if the line grows beyond `max_len` bytes or any I/O error
///     occurs
///
/// CANCELLATION SAFETY: bytes already read are kept in the read buffer, so
/// dropping this future midway and calling again later loses nothing.
pub(crate) async fn safe_line_read<Conn>(
    read_buf: &mut BytesMut,
    conn_read: &mut Conn,
    max_len: usize,
) -> Result<Option<String>, LendsetError>
where
    Conn: AsyncReadExt + Unpin,
{
    loop {
        if let Some(pos) = read_buf.iter().position(|&b| b == b'\n') {
            let line = read_buf.split_to(pos + 1);
            return Ok(Some(line_text(&line[..pos])));
        }
        if read_buf.len() > max_len {
            return Err(LendsetError::msg(format!(
                "line exceeds {} bytes",
                max_len
            )));
        }

        if conn_read.read_buf(read_buf).await? == 0 {
            // connection closed; a final unterminated line still counts
            if read_buf.is_empty() {
                return Ok(None);
            }
            let rest = read_buf.split();
            return Ok(Some(line_text(&rest)));
        }
    }
}

fn line_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches('\r')
        .to_string()
}

/// Sends one line to TCP writable connection `conn_write`, appending the
/// `\n` terminator. Lines are small, so this simply awaits `write_all()`.
pub(crate) async fn safe_line_write<Conn>(
    conn_write: &mut Conn,
    line: &str,
) -> Result<(), LendsetError>
where
    Conn: AsyncWriteExt + Unpin,
{
    let mut bytes = Vec::with_capacity(line.len() + 1);
    bytes.extend_from_slice(line.as_bytes());
    bytes.push(b'\n');
    conn_write.write_all(&bytes).await?;
    Ok(())
}

/// Wrapper over tokio `TcpListener::bind()` that provides a retrying logic.
/// Binds on all interfaces at the port of `bind_addr`.
pub(crate) async fn tcp_bind_with_retry(
    bind_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpListener, LendsetError> {
    loop {
        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;

        let bind_addr = (Ipv4Addr::UNSPECIFIED, bind_addr.port()).into();
        if let Err(err) = socket.bind(bind_addr) {
            if retries == 0 {
                return Err(err.into());
            }
            retries -= 1;
            time::sleep(Duration::from_secs(1)).await;
            continue;
        }

        match socket.listen(1024) {
            Ok(listener) => return Ok(listener),
            Err(err) => {
                if retries == 0 {
                    return Err(err.into());
                }
                retries -= 1;
                time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Wrapper over tokio `TcpStream::connect()` that provides a retrying logic.
pub(crate) async fn tcp_connect_with_retry(
    conn_addr: SocketAddr,
    mut retries: u8,
    interval: Duration,
) -> Result<TcpStream, LendsetError> {
    loop {
        match TcpStream::connect(conn_addr).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(err) => {
                if retries == 0 {
                    return Err(err.into());
                }
                retries -= 1;
                time::sleep(interval).await;
            }
        }
    }
}

#[cfg(test)]
mod safetcp_tests {
    use super::*;

    #[tokio::test(flavor = "current_thread")]
    async fn read_lines_split() -> Result<(), LendsetError> {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(b"LOCK 1 3\nUNL").await?;
        client.write_all(b"OCK 1 4\r\nCOMMAND").await?;
        drop(client);

        let mut read_buf = BytesMut::new();
        assert_eq!(
            safe_line_read(&mut read_buf, &mut server, 128).await?,
            Some("LOCK 1 3".into())
        );
        assert_eq!(
            safe_line_read(&mut read_buf, &mut server, 128).await?,
            Some("UNLOCK 1 4".into())
        );
        assert_eq!(
            safe_line_read(&mut read_buf, &mut server, 128).await?,
            Some("COMMAND".into())
        );
        assert_eq!(safe_line_read(&mut read_buf, &mut server, 128).await?, None);
        Ok(())
    }

    #[tokio::test(flavor = "current_thread")]
    async fn read_line_not_utf8() -> Result<(), LendsetError> {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(b"reserve c1 b\xff\xfe\nreturn c1 b0\n").await?;
        let mut read_buf = BytesMut::new();
        assert_eq!(
            safe_line_read(&mut read_buf, &mut server, 64).await?,
            Some("reserve c1 b\u{fffd}\u{fffd}".into())
        );
        assert_eq!(
            safe_line_read(&mut read_buf, &mut server, 64).await?,
            Some("return c1 b0".into())
        );
        Ok(())
    }

    #[tokio::test(flavor = "current_thread")]
    async fn read_line_too_long() -> Result<(), LendsetError> {
        let (mut client, mut server) = tokio::io::duplex(256);
        client.write_all(&[b'x'; 100]).await?;
        let mut read_buf = BytesMut::new();
        assert!(safe_line_read(&mut read_buf, &mut server, 16).await.is_err());
        Ok(())
    }

    #[tokio::test(flavor = "current_thread")]
    async fn write_then_read() -> Result<(), LendsetError> {
        let (mut client, mut server) = tokio::io::duplex(64);
        safe_line_write(&mut client, "client").await?;
        let mut read_buf = BytesMut::new();
        assert_eq!(
            safe_line_read(&mut read_buf, &mut server, 64).await?,
            Some("client".into())
        );
        Ok(())
    }
}
