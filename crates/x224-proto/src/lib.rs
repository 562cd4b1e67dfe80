//! Codec for the TPKT-framed X.224 Connection Request PDU, the very first
//! segment an RDP client transmits.
//!
//! Everything in this crate is pure: functions take byte slices, never
//! perform I/O and never mutate their input. Reading the PDU off a socket is
//! the caller's business.

use byteorder::{BigEndian, ByteOrder as _, LittleEndian};

/// TPKT version byte expected at offset 0.
pub const TPKT_VERSION: u8 = 3;

/// TPDU code for an X.224 Connection Request (CR, CDT class 0).
pub const CR_TPDU_CODE: u8 = 0xE0;

/// Bytes 0..5: TPKT header (4 bytes) plus the X.224 length indicator.
pub const HEADER_LEN: usize = 5;

/// Bytes 0..11: everything up to (excluding) the variable-data region.
///
/// TPKT header, length indicator, TPDU code, destination reference, source
/// reference and the class/option byte.
pub const FIXED_PART_LEN: usize = 11;

/// Prefix of the routing cookie line carrying a redirection token.
pub const COOKIE_PREFIX: &[u8] = b"Cookie: msts=";

const CRLF: &[u8] = b"\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CrError {
    #[error("buffer of {got} bytes is too short, need {need}")]
    BufferTooShort { got: usize, need: usize },
    #[error("unexpected TPKT version {0:#04X}")]
    BadVersion(u8),
    #[error("TPKT length {0} cannot hold a connection request")]
    LengthOutOfRange(u16),
    #[error("length indicator {li} inconsistent with TPKT length {tpkt_len}")]
    LengthMismatch { li: u8, tpkt_len: u16 },
    #[error("segment is {got} bytes but TPKT length says {expected}")]
    SegmentSizeMismatch { got: usize, expected: u16 },
    #[error("unexpected TPDU code {0:#04X}, expected a connection request")]
    NotConnectionRequest(u8),
    #[error("non-zero destination reference {0:#06X}")]
    NonZeroDstRef(u16),
    #[error("reserved class/option bits set in {0:#04X}")]
    BadClassOption(u8),
    #[error("cookie boundary {end} out of range for a {len}-byte segment")]
    CookieOutOfRange { end: usize, len: usize },
}

/// Validates the first [`HEADER_LEN`] bytes of a segment and returns the TPKT
/// length, i.e. the total size in bytes of the segment on the wire.
///
/// Usable before the rest of the segment is available, so callers peeking a
/// socket know how many bytes to wait for.
pub fn validate_header(buf: &[u8]) -> Result<u16, CrError> {
    if buf.len() < HEADER_LEN {
        return Err(CrError::BufferTooShort {
            got: buf.len(),
            need: HEADER_LEN,
        });
    }

    if buf[0] != TPKT_VERSION {
        return Err(CrError::BadVersion(buf[0]));
    }

    let tpkt_len = BigEndian::read_u16(&buf[2..4]);
    let li = buf[4];

    if usize::from(tpkt_len) != usize::from(li) + 5 {
        return Err(CrError::LengthMismatch { li, tpkt_len });
    }

    if usize::from(tpkt_len) < FIXED_PART_LEN {
        return Err(CrError::LengthOutOfRange(tpkt_len));
    }

    Ok(tpkt_len)
}

/// Validates a whole segment, fixed-offset field by fixed-offset field.
///
/// `buf` must hold exactly the number of bytes announced by the TPKT length.
/// The source reference (bytes 8..10) is unconstrained and only the top six
/// bits of the class/option byte are checked.
pub fn validate_segment(buf: &[u8]) -> Result<(), CrError> {
    let tpkt_len = validate_header(buf)?;

    if buf.len() != usize::from(tpkt_len) {
        return Err(CrError::SegmentSizeMismatch {
            got: buf.len(),
            expected: tpkt_len,
        });
    }

    if buf[5] != CR_TPDU_CODE {
        return Err(CrError::NotConnectionRequest(buf[5]));
    }

    let dst_ref = LittleEndian::read_u16(&buf[6..8]);
    if dst_ref != 0 {
        return Err(CrError::NonZeroDstRef(dst_ref));
    }

    if buf[10] & 0xFC != 0 {
        return Err(CrError::BadClassOption(buf[10]));
    }

    Ok(())
}

/// Looks for a cookie line in the variable-data region.
///
/// Returns the line's bytes (CRLF excluded) and the offset of the first byte
/// after the CRLF. `None` when the region holds no CRLF at all, which is the
/// ordinary non-redirected connection request.
pub fn find_cookie(buf: &[u8]) -> Option<(&[u8], usize)> {
    let variable_part = buf.get(FIXED_PART_LEN..)?;
    let crlf_start = variable_part.windows(CRLF.len()).position(|w| w == CRLF)?;
    Some((
        &variable_part[..crlf_start],
        FIXED_PART_LEN + crlf_start + CRLF.len(),
    ))
}

/// Extracts the redirection token out of a cookie line.
///
/// The line must start with the exact [`COOKIE_PREFIX`]; anything else (for
/// instance an `mstshash` identification cookie) yields `None` and is treated
/// by callers the same as no cookie at all.
pub fn extract_token(cookie: &[u8]) -> Option<&str> {
    let token = cookie.strip_prefix(COOKIE_PREFIX)?;
    core::str::from_utf8(token).ok()
}

/// Builds a copy of the segment with the cookie line removed.
///
/// `cookie_end` is the offset right after the cookie's CRLF, as returned by
/// [`find_cookie`]. The fixed part is copied verbatim except for the TPKT
/// length and the length indicator, both re-stamped down by the number of
/// removed bytes; everything past the cookie line shifts left unchanged.
pub fn strip_cookie(buf: &[u8], cookie_end: usize) -> Result<Vec<u8>, CrError> {
    if buf.len() < FIXED_PART_LEN {
        return Err(CrError::BufferTooShort {
            got: buf.len(),
            need: FIXED_PART_LEN,
        });
    }

    // Shortest removable line is an empty cookie: just the CRLF.
    if cookie_end < FIXED_PART_LEN + CRLF.len() || cookie_end > buf.len() {
        return Err(CrError::CookieOutOfRange {
            end: cookie_end,
            len: buf.len(),
        });
    }

    let new_len = buf.len() - (cookie_end - FIXED_PART_LEN);

    // The re-stamped length indicator must still fit into its single byte.
    let new_li = new_len - 5;
    if new_li > usize::from(u8::MAX) {
        return Err(CrError::LengthOutOfRange(u16::try_from(new_len).unwrap_or(u16::MAX)));
    }

    let mut rewritten = Vec::with_capacity(new_len);
    rewritten.extend_from_slice(&buf[..FIXED_PART_LEN]);
    rewritten.extend_from_slice(&buf[cookie_end..]);

    #[expect(clippy::cast_possible_truncation, reason = "bounded by the length indicator check above")]
    BigEndian::write_u16(&mut rewritten[2..4], new_len as u16);
    #[expect(clippy::cast_possible_truncation, reason = "bounded by the length indicator check above")]
    {
        rewritten[4] = new_li as u8;
    }

    Ok(rewritten)
}
