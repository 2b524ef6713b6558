use crate::debugger::error::Error;
use bytes::{Buf, BytesMut};
use log::{trace, warn};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::TcpStream;

const INITIAL_INPUT_BUFFER_SIZE: usize = 2048;
const WIRE_LOG_MAX_LEN: usize = 120;

/// Framed byte transport to the stub.
///
/// Outgoing commands are wrapped in `$<payload>#<checksum>` frames, incoming
/// frames are validated and acknowledged. Inferior console output (`O`
/// packets) and asynchronous `%` notifications are consumed here and never
/// surface to callers of [`WireConn::recv`].
pub(crate) struct WireConn {
    stream: TcpStream,
    inbuf: BytesMut,
    ack_mode: bool,
    poisoned: bool,
    max_transmit_attempts: usize,
    console_sink: Option<Box<dyn Write + Send>>,
    notifications: VecDeque<Vec<u8>>,
}

impl WireConn {
    pub fn new(stream: TcpStream) -> Self {
        let _ = stream.set_nodelay(true);
        WireConn {
            stream,
            inbuf: BytesMut::with_capacity(INITIAL_INPUT_BUFFER_SIZE),
            ack_mode: true,
            poisoned: false,
            max_transmit_attempts: 3,
            console_sink: None,
            notifications: VecDeque::new(),
        }
    }

    /// Acknowledgement mode is on from connection start and switched off
    /// exactly once, after the stub accepts `QStartNoAckMode`.
    pub fn set_ack_mode(&mut self, on: bool) {
        self.ack_mode = on;
    }

    pub fn set_console_sink(&mut self, sink: Box<dyn Write + Send>) {
        self.console_sink = Some(sink);
    }

    /// Queued `%Stop:` notifications received since the last call.
    pub fn take_notifications(&mut self) -> Vec<Vec<u8>> {
        self.notifications.drain(..).collect()
    }

    pub fn try_clone_stream(&self) -> std::io::Result<TcpStream> {
        self.stream.try_clone()
    }

    /// Frame and transmit one command, waiting for the ack byte while ack
    /// mode is on. A `-` triggers retransmission, at most
    /// `max_transmit_attempts` times.
    pub fn send(&mut self, payload: &[u8]) -> Result<(), Error> {
        self.check_open()?;

        let mut frame = Vec::with_capacity(payload.len() + 4);
        frame.push(b'$');
        frame.extend_from_slice(payload);
        frame.push(b'#');
        frame.extend_from_slice(format!("{:02x}", checksum(payload)).as_bytes());

        for _ in 0..self.max_transmit_attempts {
            self.write_all(&frame)?;
            wire_log("->", payload);
            if !self.ack_mode {
                return Ok(());
            }
            match self.next_byte()? {
                b'+' => return Ok(()),
                b'-' => {
                    warn!(target: "gdbwire", "stub nacked packet, retransmitting");
                    continue;
                }
                other => {
                    return Err(Error::MalformedReply(format!(
                        "expected ack byte, got {:#04x}",
                        other
                    )));
                }
            }
        }
        self.poisoned = true;
        Err(Error::Transmit(self.max_transmit_attempts))
    }

    /// Receive the next reply packet. Console output and notifications are
    /// consumed inline; only genuine replies are returned.
    pub fn recv(&mut self) -> Result<Vec<u8>, Error> {
        self.check_open()?;
        loop {
            let (kind, payload) = self.read_frame()?;
            let payload = decode_payload(&payload);
            if kind == b'%' {
                trace!(target: "gdbwire", "notification queued ({} bytes)", payload.len());
                self.notifications.push_back(payload);
                continue;
            }
            if let Some(out) = console_payload(&payload) {
                self.forward_console(&out);
                continue;
            }
            wire_log("<-", &payload);
            return Ok(payload);
        }
    }

    /// Out-of-band interrupt: a single `0x03` byte, no framing, no checksum,
    /// no paired response.
    pub fn write_ctrl_c(&mut self) -> Result<(), Error> {
        self.check_open()?;
        self.write_all(&[0x03])
    }

    fn check_open(&self) -> Result<(), Error> {
        if self.poisoned {
            return Err(Error::ConnectionClosed);
        }
        Ok(())
    }

    fn read_frame(&mut self) -> Result<(u8, Vec<u8>), Error> {
        loop {
            let start = loop {
                let b = self.next_byte()?;
                if b == b'$' || b == b'%' {
                    break b;
                }
            };
            let mut payload = Vec::new();
            loop {
                let b = self.next_byte()?;
                if b == b'#' {
                    break;
                }
                payload.push(b);
            }
            let declared = {
                let hi = self.next_byte()?;
                let lo = self.next_byte()?;
                hex_digit(hi).zip(hex_digit(lo)).map(|(h, l)| (h << 4) | l)
            };
            if declared == Some(checksum(&payload)) {
                if self.ack_mode && start == b'$' {
                    self.write_all(b"+")?;
                }
                return Ok((start, payload));
            }
            warn!(target: "gdbwire", "bad checksum on incoming frame");
            if !self.ack_mode {
                return Err(Error::MalformedReply(
                    String::from_utf8_lossy(&payload).into_owned(),
                ));
            }
            self.write_all(b"-")?;
        }
    }

    fn forward_console(&mut self, out: &[u8]) {
        match &mut self.console_sink {
            Some(sink) => {
                let _ = sink.write_all(out);
                let _ = sink.flush();
            }
            None => trace!(target: "gdbwire", "inferior: {}", String::from_utf8_lossy(out)),
        }
    }

    fn next_byte(&mut self) -> Result<u8, Error> {
        while self.inbuf.is_empty() {
            self.fill()?;
        }
        Ok(self.inbuf.get_u8())
    }

    fn fill(&mut self) -> Result<(), Error> {
        let mut chunk = [0u8; 4096];
        let n = match self.stream.read(&mut chunk) {
            Ok(n) => n,
            Err(e) => {
                self.poisoned = true;
                return Err(Error::IO(e));
            }
        };
        if n == 0 {
            self.poisoned = true;
            return Err(Error::ConnectionClosed);
        }
        self.inbuf.extend_from_slice(&chunk[..n]);
        Ok(())
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), Error> {
        if let Err(e) = self.stream.write_all(data) {
            self.poisoned = true;
            return Err(Error::IO(e));
        }
        Ok(())
    }
}

/// Modulo-256 sum of the payload bytes.
pub(crate) fn checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Undo run-length encoding (`c*r`, repeat count `r - 29`) and `0x7d`
/// escaping. Applied after checksum validation, which covers the raw bytes.
fn decode_payload(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        match raw[i] {
            0x7d if i + 1 < raw.len() => {
                out.push(raw[i + 1] ^ 0x20);
                i += 2;
            }
            b'*' if i + 1 < raw.len() && !out.is_empty() => {
                let last = *out.last().unwrap();
                let repeats = raw[i + 1].saturating_sub(29);
                out.extend(std::iter::repeat(last).take(repeats as usize));
                i += 2;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    out
}

/// An `O` packet carries hex-encoded inferior console output. The literal
/// reply `OK` also starts with `O` and must not be treated as one.
fn console_payload(payload: &[u8]) -> Option<Vec<u8>> {
    if payload.first() != Some(&b'O') || payload == b"OK" {
        return None;
    }
    let rest = &payload[1..];
    if rest.is_empty() || rest.len() % 2 != 0 {
        return None;
    }
    hex_decode(rest).ok()
}

fn wire_log(dir: &str, payload: &[u8]) {
    if !log::log_enabled!(target: "gdbwire", log::Level::Trace) {
        return;
    }
    let text = String::from_utf8_lossy(payload);
    if text.chars().count() > WIRE_LOG_MAX_LEN {
        let head: String = text.chars().take(WIRE_LOG_MAX_LEN).collect();
        trace!(target: "gdbwire", "{dir} {head}... ({} bytes)", payload.len());
    } else {
        trace!(target: "gdbwire", "{dir} {text}");
    }
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

pub(crate) fn hex_decode(data: &[u8]) -> Result<Vec<u8>, Error> {
    if data.len() % 2 != 0 {
        return Err(Error::MalformedReply(
            String::from_utf8_lossy(data).into_owned(),
        ));
    }
    data.chunks_exact(2)
        .map(|pair| {
            hex_digit(pair[0])
                .zip(hex_digit(pair[1]))
                .map(|(h, l)| (h << 4) | l)
                .ok_or_else(|| Error::MalformedReply(String::from_utf8_lossy(data).into_owned()))
        })
        .collect()
}

pub(crate) fn hex_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2);
    for b in data {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn wire_pair() -> (WireConn, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = thread::spawn(move || listener.accept().unwrap().0);
        let client = TcpStream::connect(addr).unwrap();
        (WireConn::new(client), peer.join().unwrap())
    }

    #[test]
    fn checksum_is_modulo_256_sum() {
        assert_eq!(checksum(b""), 0);
        assert_eq!(checksum(b"OK"), 0x9a);
        assert_eq!(checksum(&[0xff, 0xff, 0x03]), 0x01);
    }

    #[test]
    fn payload_decoding_undoes_rle_and_escapes() {
        assert_eq!(decode_payload(b"0* "), b"0000");
        assert_eq!(decode_payload(&[b'a', 0x7d, 0x03 ^ 0x20, b'b']), b"a\x03b");
        assert_eq!(decode_payload(b"plain"), b"plain");
        // a leading `*` has no previous character to repeat
        assert_eq!(decode_payload(b"*!x"), b"*!x");
    }

    #[test]
    fn console_packets_are_recognized() {
        assert_eq!(console_payload(b"O68690a"), Some(b"hi\n".to_vec()));
        assert_eq!(console_payload(b"OK"), None);
        assert_eq!(console_payload(b"T05thread:1;"), None);
    }

    #[test]
    fn frame_round_trip() {
        let (mut wire, mut peer) = wire_pair();
        let echo = thread::spawn(move || {
            let mut buf = [0u8; 64];
            let mut got = Vec::new();
            while !got.ends_with(b"#9a") {
                let n = peer.read(&mut buf).unwrap();
                got.extend_from_slice(&buf[..n]);
            }
            peer.write_all(b"+").unwrap();
            let reply = b"T05thread:1a2;";
            peer.write_all(format!("${}#{:02x}", "T05thread:1a2;", checksum(reply)).as_bytes())
                .unwrap();
            let mut ack = [0u8; 1];
            peer.read_exact(&mut ack).unwrap();
            assert_eq!(&ack, b"+");
            got
        });
        wire.send(b"OK").unwrap();
        let reply = wire.recv().unwrap();
        assert_eq!(reply, b"T05thread:1a2;");
        assert_eq!(echo.join().unwrap(), b"$OK#9a");
    }

    #[test]
    fn corrupted_frame_is_nacked_then_retransmission_accepted() {
        let (mut wire, mut peer) = wire_pair();
        let stub = thread::spawn(move || {
            // first copy corrupted, retransmission good
            peer.write_all(b"$T05thread:1;#00").unwrap();
            let mut nack = [0u8; 1];
            peer.read_exact(&mut nack).unwrap();
            assert_eq!(&nack, b"-");
            let reply = b"T05thread:1;";
            peer.write_all(format!("${}#{:02x}", "T05thread:1;", checksum(reply)).as_bytes())
                .unwrap();
            let mut ack = [0u8; 1];
            peer.read_exact(&mut ack).unwrap();
            assert_eq!(&ack, b"+");
        });
        let reply = wire.recv().unwrap();
        assert_eq!(reply, b"T05thread:1;");
        stub.join().unwrap();
    }

    #[test]
    fn retransmit_limit_exhausts_into_error() {
        let (mut wire, mut peer) = wire_pair();
        let stub = thread::spawn(move || {
            let mut buf = [0u8; 64];
            for _ in 0..3 {
                let mut got = Vec::new();
                while !got.ends_with(b"#9a") {
                    let n = peer.read(&mut buf).unwrap();
                    got.extend_from_slice(&buf[..n]);
                }
                peer.write_all(b"-").unwrap();
            }
        });
        let err = wire.send(b"OK").unwrap_err();
        assert!(matches!(err, Error::Transmit(3)));
        stub.join().unwrap();
    }

    #[test]
    fn console_output_is_consumed_before_reply() {
        let (mut wire, mut peer) = wire_pair();
        wire.set_ack_mode(false);
        thread::spawn(move || {
            let o = b"O68690a";
            peer.write_all(format!("$O68690a#{:02x}", checksum(o)).as_bytes())
                .unwrap();
            peer.write_all(b"$OK#9a").unwrap();
        });
        assert_eq!(wire.recv().unwrap(), b"OK");
    }

    #[test]
    fn eof_poisons_the_connection() {
        let (mut wire, peer) = wire_pair();
        drop(peer);
        assert!(matches!(wire.recv().unwrap_err(), Error::ConnectionClosed));
        assert!(matches!(wire.send(b"?").unwrap_err(), Error::ConnectionClosed));
    }
}
