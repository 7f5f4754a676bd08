use bytes::{Buf, BufMut, BytesMut};

const FEND: u8 = 0xC0;
const FESC: u8 = 0xDB;
const TFEND: u8 = 0xDC;
const TFESC: u8 = 0xDD;

// Command nibble of the type byte; the high nibble is the TNC port.
const CMD_DATA: u8 = 0x00;
#[cfg(test)]
const CMD_TXDELAY: u8 = 0x01;

/// Streaming KISS decoder plus frame encoder. Only data frames surface
/// from `decode`; command frames (txdelay, persist, ...) are dropped.
pub struct KissCodec {
    decode_buf: BytesMut,
    in_frame: bool,
    escaped: bool,
}

impl KissCodec {
    pub fn new() -> Self {
        KissCodec {
            decode_buf: BytesMut::with_capacity(1024),
            in_frame: false,
            escaped: false,
        }
    }

    /// Consumes bytes from `src`; returns the next complete data frame as
    /// `(port, payload)` or None when more input is needed.
    pub fn decode(&mut self, src: &mut BytesMut) -> Option<(u8, Vec<u8>)> {
        while src.has_remaining() {
            let byte = src.get_u8();

            if self.escaped {
                self.escaped = false;
                match byte {
                    TFEND => self.decode_buf.put_u8(FEND),
                    TFESC => self.decode_buf.put_u8(FESC),
                    _ => {
                        // Invalid escape: abandon the frame, resync on FEND
                        self.decode_buf.clear();
                        self.in_frame = false;
                    }
                }
                continue;
            }

            match byte {
                FEND => {
                    if self.in_frame && !self.decode_buf.is_empty() {
                        let frame = self.decode_buf.split().to_vec();
                        self.in_frame = false;

                        let cmd = frame[0] & 0x0F;
                        let port = (frame[0] >> 4) & 0x0F;
                        if cmd == CMD_DATA && frame.len() > 1 {
                            return Some((port, frame[1..].to_vec()));
                        }
                    } else {
                        self.in_frame = true;
                        self.decode_buf.clear();
                    }
                }
                FESC => {
                    if self.in_frame {
                        self.escaped = true;
                    }
                }
                _ => {
                    if self.in_frame {
                        self.decode_buf.put_u8(byte);
                    }
                }
            }
        }

        None
    }

    pub fn encode(&self, data: &[u8], port: u8) -> Vec<u8> {
        let mut output = Vec::with_capacity(data.len() + 4);

        output.push(FEND);
        output.push((port << 4) | CMD_DATA);

        for &byte in data {
            match byte {
                FEND => {
                    output.push(FESC);
                    output.push(TFEND);
                }
                FESC => {
                    output.push(FESC);
                    output.push(TFESC);
                }
                _ => output.push(byte),
            }
        }

        output.push(FEND);
        output
    }
}

impl Default for KissCodec {
    fn default() -> Self {
        KissCodec::new()
    }
}

/// True when a raw datagram looks like a KISS frame (UDP submissions may
/// carry either framed or bare APRS data).
pub fn looks_like_kiss(data: &[u8]) -> bool {
    data.first() == Some(&FEND)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode() {
        let codec = KissCodec::new();

        let encoded = codec.encode(b"Hello", 0);
        assert_eq!(encoded[0], FEND);
        assert_eq!(encoded[1], CMD_DATA);
        assert_eq!(&encoded[2..7], b"Hello");
        assert_eq!(encoded[7], FEND);

        // FEND in payload gets escaped
        let encoded = codec.encode(&[0x41, FEND, 0x42], 0);
        assert_eq!(encoded[3], FESC);
        assert_eq!(encoded[4], TFEND);

        // FESC in payload gets escaped
        let encoded = codec.encode(&[0x41, FESC, 0x42], 0);
        assert_eq!(encoded[3], FESC);
        assert_eq!(encoded[4], TFESC);

        // Port lands in the high nibble
        let encoded = codec.encode(b"Test", 1);
        assert_eq!(encoded[1], 0x10);
    }

    #[test]
    fn test_decode_simple() {
        let mut codec = KissCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[FEND, CMD_DATA, 0x41, 0x42, FEND]);

        let (port, data) = codec.decode(&mut buf).unwrap();
        assert_eq!(port, 0);
        assert_eq!(data, vec![0x41, 0x42]);
    }

    #[test]
    fn test_decode_escaped() {
        let mut codec = KissCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[FEND, CMD_DATA, 0x41, FESC, TFEND, 0x42, FEND]);

        let (_, data) = codec.decode(&mut buf).unwrap();
        assert_eq!(data, vec![0x41, FEND, 0x42]);

        buf.extend_from_slice(&[FEND, CMD_DATA, 0x41, FESC, TFESC, 0x42, FEND]);
        let (_, data) = codec.decode(&mut buf).unwrap();
        assert_eq!(data, vec![0x41, FESC, 0x42]);
    }

    #[test]
    fn test_decode_multiple_frames() {
        let mut codec = KissCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[
            FEND, CMD_DATA, 0x41, FEND, FEND, CMD_DATA, 0x42, FEND,
        ]);

        assert_eq!(codec.decode(&mut buf).unwrap().1, vec![0x41]);
        assert_eq!(codec.decode(&mut buf).unwrap().1, vec![0x42]);
    }

    #[test]
    fn test_decode_partial() {
        let mut codec = KissCodec::new();
        let mut buf = BytesMut::new();

        buf.extend_from_slice(&[FEND, CMD_DATA, 0x41]);
        assert!(codec.decode(&mut buf).is_none());

        buf.extend_from_slice(&[0x42, FEND]);
        assert_eq!(codec.decode(&mut buf).unwrap().1, vec![0x41, 0x42]);
    }

    #[test]
    fn test_decode_command_frames_dropped() {
        let mut codec = KissCodec::new();
        let mut buf = BytesMut::new();

        buf.extend_from_slice(&[FEND, CMD_TXDELAY, 0x10, FEND]);
        assert!(codec.decode(&mut buf).is_none());
    }

    #[test]
    fn test_decode_nonzero_port() {
        let mut codec = KissCodec::new();
        let mut buf = BytesMut::new();

        buf.extend_from_slice(&[FEND, 0x10, 0x41, 0x42, FEND]);
        let (port, data) = codec.decode(&mut buf).unwrap();
        assert_eq!(port, 1);
        assert_eq!(data, vec![0x41, 0x42]);
    }

    #[test]
    fn test_decode_invalid_escape_recovers() {
        let mut codec = KissCodec::new();
        let mut buf = BytesMut::new();

        buf.extend_from_slice(&[FEND, CMD_DATA, FESC, 0xFF, FEND]);
        assert!(codec.decode(&mut buf).is_none());

        buf.extend_from_slice(&[FEND, CMD_DATA, 0x41, FEND]);
        assert_eq!(codec.decode(&mut buf).unwrap().1, vec![0x41]);
    }

    #[test]
    fn test_looks_like_kiss() {
        assert!(looks_like_kiss(&[FEND, CMD_DATA, 0x41, FEND]));
        assert!(!looks_like_kiss(b"N0CALL>APRS:>Test"));
        assert!(!looks_like_kiss(&[]));
    }
}
