//! Non-destructive classification of freshly accepted connections.
//!
//! The first TPKT segment is pulled into memory with `MSG_PEEK` reads only:
//! whatever consumer handles the connection next (the relay on redirection,
//! the RDP engine otherwise) reads the exact byte stream the client
//! transmitted.

use std::io;

use tokio::net::TcpStream;

/// What the first segment of a connection turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// A connection request carrying a `Cookie: msts=` redirection token.
    Redirect {
        token: String,
        /// Size of the whole connection request, in bytes.
        pdu_len: usize,
        /// Offset of the first byte after the cookie line's CRLF.
        post_cookie_offset: usize,
    },
    /// A valid connection request without a redirection token; the
    /// connection belongs to the RDP engine.
    Engine {
        pdu_len: usize,
        post_cookie_offset: usize,
    },
}

/// Classifies the connection by peeking one X.224 connection request.
///
/// Zero bytes are consumed from the socket, whatever the outcome. Any
/// wire-format violation, as well as a segment bigger than `cap`, is an
/// `InvalidData` error: the caller must drop the connection without sending
/// anything back.
pub async fn classify(stream: &TcpStream, cap: usize) -> io::Result<Classification> {
    let mut header = [0u8; x224_proto::HEADER_LEN];
    peek_exact(stream, &mut header).await?;

    let pdu_len = usize::from(x224_proto::validate_header(&header).map_err(into_invalid_data)?);

    if pdu_len > cap {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{pdu_len}-byte connection request exceeds the {cap}-byte cap"),
        ));
    }

    let mut segment = vec![0u8; pdu_len];
    peek_exact(stream, &mut segment).await?;

    x224_proto::validate_segment(&segment).map_err(into_invalid_data)?;

    let Some((cookie, post_cookie_offset)) = x224_proto::find_cookie(&segment) else {
        return Ok(Classification::Engine {
            pdu_len,
            post_cookie_offset: x224_proto::FIXED_PART_LEN,
        });
    };

    match x224_proto::extract_token(cookie) {
        Some(token) => Ok(Classification::Redirect {
            token: token.to_owned(),
            pdu_len,
            post_cookie_offset,
        }),
        // An unrecognized cookie key is not hostile, just not ours.
        None => Ok(Classification::Engine {
            pdu_len,
            post_cookie_offset,
        }),
    }
}

/// Peeks until the kernel has `buf.len()` bytes buffered.
///
/// `peek` resolves as soon as anything is readable, so short results are
/// retried; the task yields in between to keep the worker cooperative while
/// the rest of the segment is in flight.
async fn peek_exact(stream: &TcpStream, buf: &mut [u8]) -> io::Result<()> {
    loop {
        let n = stream.peek(buf).await?;

        if n >= buf.len() {
            return Ok(());
        }

        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed during classification",
            ));
        }

        tokio::task::yield_now().await;
    }
}

fn into_invalid_data(e: x224_proto::CrError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}
